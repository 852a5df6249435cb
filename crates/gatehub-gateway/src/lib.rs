//! Gateway runtime for gatehub.
//!
//! A transport accepts a connection, authorizes it, and yields a [`Session`];
//! the [`Playground`] owns that session's lifecycle: intake, routing through
//! the cluster [`Registry`](gatehub_cluster::Registry), per-pipeline
//! ordering, reply fan-in, and deferred cleanup of routing state.
//!
//! # Components
//!
//! - [`Session`] / [`SessionHub`] — live connections and zombie reaping
//! - [`StateTable`] — (session, service) → node affinity for stateful services
//! - [`WorkerPool`] / [`PipelineMux`] — unordered and ordered execution lanes
//! - [`Playground`] — the per-session request pipeline
//! - [`transport`] — TCP, WebSocket and QUIC adapters

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod metadata;
pub mod pipeline;
pub mod playground;
pub mod session;
pub mod state;
pub mod transport;
pub mod worker;

pub use api::GatewayApi;
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use hub::SessionHub;
pub use metadata::{Metadata, MD_GATEWAY_ID, MD_SESSION_ID, MD_TRANSACTION_ID};
pub use pipeline::PipelineMux;
pub use playground::{Playground, PlaygroundBuilder};
pub use session::{Session, SessionError, SessionRef};
pub use state::StateTable;
pub use transport::{Authorizer, SessionHandler, Transport};
pub use worker::WorkerPool;

/// Convenience result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
