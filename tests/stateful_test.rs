//! Stateful routing: allocation policies, bus-driven assignment, and the
//! disconnect grace window.

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::*;
use tonic::Code;

use gatehub::bus::{Event, EventBus};
use gatehub::cluster::kv::memory::MemoryKv;
use gatehub::cluster::Allocation;
use gatehub::gateway::GatewayConfig;
use gatehub::proto::{code, Request, RpcError};

const MARKER_A: u8 = 0xA1;
const MARKER_B: u8 = 0xB2;

async fn two_backends(kv: &Arc<MemoryKv>, allocation: Allocation) -> (BackendNode, BackendNode) {
    let a = BackendNode::start(
        kv,
        "backend-a",
        vec![service_desc(9, true, true, allocation, "")],
        marker_handler(MARKER_A),
    )
    .await;
    let b = BackendNode::start(
        kv,
        "backend-b",
        vec![service_desc(9, true, true, allocation, "")],
        marker_handler(MARKER_B),
    )
    .await;
    (a, b)
}

fn request(id: u32) -> Request {
    Request {
        id,
        service_code: 9,
        method: "Act".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_auto_allocation_sticks_to_one_node() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Auto).await;
    let gateway = Gateway::start(&kv, GatewayConfig::default(), fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    let mut client = connect(gateway.addr).await;

    send_request(&mut client, &request(1)).await;
    let first = read_reply(&mut client).await;
    let marker = first.data[0];

    // The table now holds the mapping, and every further request lands on
    // the same node.
    let state = Arc::clone(gateway.playground.state());
    wait_until(move || state.find("user-1", 9).is_some()).await;

    for id in 2..6 {
        send_request(&mut client, &request(id)).await;
        assert_eq!(read_reply(&mut client).await.data[0], marker);
    }

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_client_allocation_honors_hint_then_sticks() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Client).await;
    let gateway = Gateway::start(&kv, GatewayConfig::default(), fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    let mut client = connect(gateway.addr).await;

    // Name node B explicitly on the first call.
    let mut first = request(1);
    first.node_id = Some(b.id);
    send_request(&mut client, &first).await;
    assert_eq!(read_reply(&mut client).await.data[0], MARKER_B);

    // Without a hint, the memoized node wins.
    send_request(&mut client, &request(2)).await;
    assert_eq!(read_reply(&mut client).await.data[0], MARKER_B);

    // After NodeUnassign the mapping is gone; a hint-less request under the
    // client policy has nothing to go on.
    gateway
        .bus
        .publish(Event::NodeUnassign {
            session_id: "user-1".to_string(),
            service_code: 9,
        })
        .await
        .unwrap();
    let state = Arc::clone(gateway.playground.state());
    wait_until(move || state.find("user-1", 9).is_none()).await;

    send_request(&mut client, &request(3)).await;
    let reply = read_reply(&mut client).await;
    assert_eq!(reply.code, code::RPC_ERROR);
    let err: RpcError = reply.payload().unwrap();
    assert_eq!(err.status.code, Code::PermissionDenied as i32);

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_server_allocation_requires_bus_assignment() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Server).await;
    let gateway = Gateway::start(&kv, GatewayConfig::default(), fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    let mut client = connect(gateway.addr).await;
    let sessions = Arc::clone(gateway.playground.sessions());
    wait_until(move || sessions.count() == 1).await;

    // No assignment yet: the gateway refuses to pick a node itself.
    send_request(&mut client, &request(1)).await;
    let reply = read_reply(&mut client).await;
    assert_eq!(reply.code, code::RPC_ERROR);
    let err: RpcError = reply.payload().unwrap();
    assert_eq!(err.status.code, Code::PermissionDenied as i32);
    assert_eq!(err.status.message, "no node allocated");

    // A bus event assigns node A.
    gateway
        .bus
        .publish(Event::NodeAssign {
            session_id: "user-1".to_string(),
            service_code: 9,
            node_id: a.id,
        })
        .await
        .unwrap();
    let state = Arc::clone(gateway.playground.state());
    wait_until(move || state.find("user-1", 9).is_some()).await;

    send_request(&mut client, &request(2)).await;
    assert_eq!(read_reply(&mut client).await.data[0], MARKER_A);

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_assignment_for_foreign_session_is_ignored() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Server).await;
    let gateway = Gateway::start(&kv, GatewayConfig::default(), fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    // "elsewhere" is connected to some other gateway, not this one.
    gateway
        .bus
        .publish(Event::NodeAssign {
            session_id: "elsewhere".to_string(),
            service_code: 9,
            node_id: a.id,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.playground.state().find("elsewhere", 9).is_none());

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_affinity() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Auto).await;
    let config = GatewayConfig {
        cleanup_delay: Duration::from_millis(400),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::start(&kv, config, fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    let mut client = connect(gateway.addr).await;
    send_request(&mut client, &request(1)).await;
    let marker = read_reply(&mut client).await.data[0];

    // Disconnect, reconnect inside the grace window.
    drop(client);
    let sessions = Arc::clone(gateway.playground.sessions());
    wait_until(move || sessions.count() == 0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut client = connect(gateway.addr).await;
    send_request(&mut client, &request(2)).await;
    assert_eq!(
        read_reply(&mut client).await.data[0],
        marker,
        "affinity survives a reconnect inside the grace window"
    );

    // And well past the grace window the mapping still exists because the
    // session is online again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(gateway.playground.state().find("user-1", 9).is_some());

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_no_reconnect_drops_state_after_grace() {
    let kv = Arc::new(MemoryKv::new());
    let (a, b) = two_backends(&kv, Allocation::Auto).await;
    let config = GatewayConfig {
        cleanup_delay: Duration::from_millis(300),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::start(&kv, config, fixed_authorizer("user-1")).await;
    gateway.wait_for_service(9).await;

    let mut client = connect(gateway.addr).await;
    send_request(&mut client, &request(1)).await;
    let _ = read_reply(&mut client).await;

    let state = Arc::clone(gateway.playground.state());
    wait_until(move || state.find("user-1", 9).is_some()).await;

    drop(client);
    let state = Arc::clone(gateway.playground.state());
    wait_until(move || state.find("user-1", 9).is_none()).await;

    gateway.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}
