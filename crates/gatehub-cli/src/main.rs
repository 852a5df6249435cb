//! # gatehub CLI Entry Point
//!
//! Runs a gateway node: terminates client connections, registers the node in
//! the cluster registry, and forwards requests to backend services.
//!
//! ## Usage
//!
//! ```bash
//! # TCP gateway on the default port against a local etcd
//! gatehub gateway -l 0.0.0.0:7000
//!
//! # WebSocket gateway with a custom registry prefix
//! gatehub gateway -l 0.0.0.0:7000 -t ws --etcd http://10.0.0.2:2379 --prefix /prod/node
//! ```
//!
//! Logging is configured through `RUST_LOG` (e.g. `RUST_LOG=gatehub=debug`).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use tracing::info;
use ulid::Ulid;

use gatehub_bus::MemoryBus;
use gatehub_cluster::kv::etcd::EtcdKv;
use gatehub_cluster::{ClusterConfig, NodeEntry, Registry};
use gatehub_gateway::transport::{anonymous_authorizer, QuicServer, TcpServer, Transport, WsServer};
use gatehub_gateway::{GatewayConfig, Playground, SessionHandler};

#[derive(FromArgs)]
/// gatehub - stateful RPC gateway for microservice clusters
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Gateway(GatewayArgs),
}

/// Arguments for running a gateway node.
#[derive(FromArgs)]
#[argh(subcommand, name = "gateway")]
/// run a gateway node
struct GatewayArgs {
    /// address to listen for client connections on
    #[argh(option, short = 'l', default = "\"0.0.0.0:7000\".into()")]
    listen: String,

    /// client transport: tcp, ws or quic
    #[argh(option, short = 't', default = "\"tcp\".into()")]
    transport: String,

    /// etcd endpoint of the cluster registry
    #[argh(option, default = "\"http://127.0.0.1:2379\".into()")]
    etcd: String,

    /// registry key prefix
    #[argh(option, default = "\"/gatehub/node\".into()")]
    prefix: String,

    /// node name published in the registry entry
    #[argh(option, short = 'n', default = "\"gateway\".into()")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Commands::Gateway(args) => run_gateway(args).await,
    }
}

async fn run_gateway(args: GatewayArgs) -> Result<()> {
    let node_id = Ulid::new();
    info!(%node_id, name = %args.name, "starting gateway node");

    let kv = EtcdKv::connect(&[args.etcd.clone()])
        .await
        .with_context(|| format!("connect registry backend {}", args.etcd))?;
    let registry = Registry::new(
        Arc::new(kv),
        ClusterConfig {
            key_prefix: args.prefix.clone(),
            ..ClusterConfig::default()
        },
    )
    .await
    .context("start registry")?;

    let bus = Arc::new(MemoryBus::new());
    let event_bus: Arc<dyn gatehub_bus::EventBus> = bus.clone() as Arc<dyn gatehub_bus::EventBus>;
    let multicast: Arc<dyn gatehub_bus::MulticastBus> =
        bus.clone() as Arc<dyn gatehub_bus::MulticastBus>;
    let config = GatewayConfig::default();
    let playground = Playground::builder(node_id, Arc::clone(&registry))
        .config(config.clone())
        .event_bus(event_bus)
        .multicast(multicast)
        .build();

    let mut transport: Box<dyn Transport> = match args.transport.as_str() {
        "tcp" => Box::new(TcpServer::new(
            args.listen.as_str(),
            anonymous_authorizer(),
            config.max_payload,
        )),
        "ws" => Box::new(WsServer::new(
            args.listen.as_str(),
            anonymous_authorizer(),
            config.max_payload,
        )),
        "quic" => Box::new(QuicServer::new(
            args.listen.as_str(),
            anonymous_authorizer(),
            config.max_payload,
        )),
        other => bail!("unknown transport {other:?} (expected tcp, ws or quic)"),
    };

    let handler: SessionHandler = {
        let playground = playground.clone();
        Arc::new(move |sess| {
            let playground = playground.clone();
            Box::pin(async move { playground.handle(sess).await })
        })
    };
    transport.set_session_handler(handler);
    transport
        .start()
        .await
        .with_context(|| format!("start {} transport on {}", transport.name(), args.listen))?;

    let mut entry = NodeEntry::new(node_id, args.name);
    transport.complete_node_entry(&mut entry);
    registry.put(&entry).await.context("publish node entry")?;
    info!(
        transport = transport.name(),
        entrance = entry.entrance.as_deref().unwrap_or(""),
        "gateway ready"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");

    transport.stop().await;
    playground.close().await;
    registry.close().await;
    Ok(())
}
