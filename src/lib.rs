//! gatehub — stateful RPC gateway for microservice clusters.
//!
//! Client connections (TCP, WebSocket, QUIC) terminate at a gateway node that
//! decodes length-framed binary request frames, routes each request to the
//! appropriate backend service over gRPC, and returns the encoded reply on
//! the same session. The cluster is discovered through a lease-based service
//! registry; bus components deliver state-assignment events and multicast
//! push messages to connected sessions.
//!
//! This crate is a facade over the workspace members:
//!
//! - [`proto`] — wire messages, frame codec, object pooling
//! - [`cluster`] — registry keeper/watcher, gRPC resolver
//! - [`bus`] — event bus and multicast contracts
//! - [`gateway`] — sessions, state table, request pipeline, transports

pub use gatehub_bus as bus;
pub use gatehub_cluster as cluster;
pub use gatehub_gateway as gateway;
pub use gatehub_proto as proto;
