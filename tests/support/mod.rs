//! Shared harness for the integration suites.
//!
//! Builds a miniature cluster entirely in-process: an in-memory registry
//! backend, raw-codec gRPC backend nodes, one gateway with a real TCP
//! transport, and frame-level client helpers.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tonic::body::BoxBody;
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Response, Status};
use ulid::Ulid;

use gatehub::bus::MemoryBus;
use gatehub::cluster::kv::memory::MemoryKv;
use gatehub::cluster::kv::KvStore;
use gatehub::cluster::{
    Allocation, ClusterConfig, GrpcEntry, NodeEntry, RawCodec, Registry, ServiceDesc,
};
use gatehub::gateway::transport::{TcpServer, Transport};
use gatehub::gateway::{
    Authorizer, GatewayConfig, Metadata, Playground, SessionHandler,
};
use gatehub::proto::codec::{encode_frame, from_payload, to_payload};
use gatehub::proto::{Reply, Request};

/// gRPC path prefix every test backend serves under.
pub const BACKEND_PATH: &str = "/test.Backend";

/// Request handler of a test backend: `(method, payload) -> reply bytes`.
pub type BackendHandler =
    Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;

#[derive(Clone)]
pub struct BackendService {
    handler: BackendHandler,
}

impl NamedService for BackendService {
    const NAME: &'static str = "test.Backend";
}

impl tower::Service<http::Request<BoxBody>> for BackendService {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let method = req
            .uri()
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec);
            Ok(grpc.unary(BackendUnary { handler, method }, req).await)
        })
    }
}

struct BackendUnary {
    handler: BackendHandler,
    method: String,
}

impl UnaryService<Bytes> for BackendUnary {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<Response<Bytes>, Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let method = self.method.clone();
        Box::pin(async move {
            handler(method, request.into_inner()).await.map(Response::new)
        })
    }
}

/// A backend node: raw-codec gRPC server + its own registry publisher.
pub struct BackendNode {
    pub id: Ulid,
    pub endpoint: String,
    pub registry: Arc<Registry>,
    server: JoinHandle<()>,
}

impl BackendNode {
    /// Spawns the gRPC server, publishes the node entry, waits for nothing.
    pub async fn start(
        kv: &Arc<MemoryKv>,
        name: &str,
        services: Vec<ServiceDesc>,
        handler: BackendHandler,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        let server = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(BackendService { handler })
                .serve_with_incoming(incoming)
                .await;
        });

        let registry = Registry::new(
            Arc::clone(kv) as Arc<dyn KvStore>,
            ClusterConfig::default(),
        )
        .await
        .unwrap();

        let id = Ulid::new();
        let mut entry = NodeEntry::new(id, name);
        entry.grpc = GrpcEntry {
            endpoint: format!("http://{addr}"),
            services,
        };
        registry.put(&entry).await.unwrap();

        Self {
            id,
            endpoint: format!("http://{addr}"),
            registry,
            server,
        }
    }

    /// Takes the node out of the cluster (lease revoked, keys expire).
    pub async fn shutdown(self) {
        self.registry.close().await;
        self.server.abort();
    }
}

/// The gateway under test plus everything needed to talk to it.
pub struct Gateway {
    pub node_id: Ulid,
    pub playground: Playground,
    pub registry: Arc<Registry>,
    pub bus: Arc<MemoryBus>,
    pub addr: SocketAddr,
    transport: TcpServer,
}

impl Gateway {
    pub async fn start(kv: &Arc<MemoryKv>, config: GatewayConfig, authorizer: Authorizer) -> Self {
        let node_id = Ulid::new();
        let registry = Registry::new(
            Arc::clone(kv) as Arc<dyn KvStore>,
            ClusterConfig::default(),
        )
        .await
        .unwrap();

        let bus = Arc::new(MemoryBus::new());
        let event_bus: Arc<dyn gatehub::bus::EventBus> =
            bus.clone() as Arc<dyn gatehub::bus::EventBus>;
        let multicast: Arc<dyn gatehub::bus::MulticastBus> =
            bus.clone() as Arc<dyn gatehub::bus::MulticastBus>;

        let playground = Playground::builder(node_id, Arc::clone(&registry))
            .config(config.clone())
            .event_bus(event_bus)
            .multicast(multicast)
            .build();

        let handler: SessionHandler = {
            let playground = playground.clone();
            Arc::new(move |sess| {
                let playground = playground.clone();
                Box::pin(async move { playground.handle(sess).await })
            })
        };

        let mut transport = TcpServer::new("127.0.0.1:0", authorizer, config.max_payload);
        transport.set_session_handler(handler);
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        Self {
            node_id,
            playground,
            registry,
            bus,
            addr,
            transport,
        }
    }

    /// Blocks until the gateway's resolver knows the service code.
    pub async fn wait_for_service(&self, service_code: i32) {
        let registry = Arc::clone(&self.registry);
        wait_until(move || registry.get_desc(service_code).is_some()).await;
    }

    pub async fn shutdown(mut self) {
        self.transport.stop().await;
        self.playground.close().await;
        self.registry.close().await;
    }
}

/// Builds a service descriptor with the test backend path.
pub fn service_desc(
    code: i32,
    public: bool,
    stateful: bool,
    allocation: Allocation,
    pipeline: &str,
) -> ServiceDesc {
    ServiceDesc {
        code,
        path: BACKEND_PATH.to_string(),
        public,
        stateful,
        allocation,
        pipeline: pipeline.to_string(),
    }
}

/// Backend handler answering every call with a one-byte marker reply.
pub fn marker_handler(marker: u8) -> BackendHandler {
    Arc::new(move |_method, _payload| {
        Box::pin(async move {
            let reply = Reply {
                code: 0,
                data: vec![marker],
                ..Default::default()
            };
            Ok(Bytes::from(to_payload(&reply).unwrap()))
        })
    })
}

/// Backend handler that sleeps for the duration encoded in the payload's
/// first two bytes (big-endian milliseconds), then echoes the rest.
pub fn delay_handler() -> BackendHandler {
    Arc::new(move |_method, payload| {
        Box::pin(async move {
            let delay = if payload.len() >= 2 {
                u64::from(u16::from_be_bytes([payload[0], payload[1]]))
            } else {
                0
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            let reply = Reply {
                code: 0,
                data: payload.get(2..).unwrap_or_default().to_vec(),
                ..Default::default()
            };
            Ok(Bytes::from(to_payload(&reply).unwrap()))
        })
    })
}

/// Encodes a delay-handler payload.
pub fn delay_payload(delay_ms: u16, tag: u8) -> Vec<u8> {
    let mut payload = delay_ms.to_be_bytes().to_vec();
    payload.push(tag);
    payload
}

/// Authorizer admitting everyone under one fixed session id.
pub fn fixed_authorizer(session_id: &str) -> Authorizer {
    let session_id = session_id.to_string();
    Arc::new(move |_sess| {
        let session_id = session_id.clone();
        Box::pin(async move { Some((session_id, Metadata::new())) })
    })
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub async fn send_request(stream: &mut TcpStream, req: &Request) {
    let frame = encode_frame(&to_payload(req).unwrap());
    stream.write_all(&frame).await.unwrap();
}

/// Reads one reply frame, failing the test after 5 seconds.
pub async fn read_reply(stream: &mut TcpStream) -> Reply {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        from_payload::<Reply>(&payload).unwrap()
    })
    .await
    .expect("no reply within 5s")
}

/// True when no reply arrives within the window.
pub async fn assert_no_reply(stream: &mut TcpStream, window: Duration) {
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(window, stream.read(&mut buf)).await;
    assert!(read.is_err(), "unexpected bytes from gateway");
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
