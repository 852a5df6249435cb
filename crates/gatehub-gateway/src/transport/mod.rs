//! Transport adapters.
//!
//! A transport accepts connections, authorizes them into [`Session`]s and
//! hands each session to the configured handler (the playground). All three
//! adapters speak the same wire frame; they differ only in how bytes move.

pub mod quic;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use ulid::Ulid;

use gatehub_cluster::NodeEntry;

use crate::error::GatewayError;
use crate::metadata::Metadata;
use crate::session::SessionRef;

pub use quic::QuicServer;
pub use tcp::TcpServer;
pub use ws::WsServer;

/// Receives each authorized session; typically `Playground::handle`.
pub type SessionHandler = Arc<dyn Fn(SessionRef) -> BoxFuture<'static, ()> + Send + Sync>;

/// Authorizes a fresh session.
///
/// Yields the stable user id (which becomes the session id) and initial
/// metadata, or `None` to deny — a denied connection is closed and logged.
pub type Authorizer =
    Arc<dyn Fn(SessionRef) -> BoxFuture<'static, Option<(String, Metadata)>> + Send + Sync>;

/// A gateway transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fills the entry's `entrance` with this transport's public URL.
    fn complete_node_entry(&self, entry: &mut NodeEntry);

    fn set_session_handler(&mut self, handler: SessionHandler);

    async fn start(&mut self) -> Result<(), GatewayError>;

    async fn stop(&mut self);
}

/// Authorizer that admits everyone under a fresh ULID.
///
/// Real deployments plug in their own; this one keeps demos and tests
/// running without an auth backend.
pub fn anonymous_authorizer() -> Authorizer {
    Arc::new(|_sess| Box::pin(async { Some((Ulid::new().to_string(), Metadata::new())) }))
}

/// Runs the authorizer against a fresh session and stamps the result.
pub(crate) async fn authorize(authorizer: &Authorizer, sess: &SessionRef) -> bool {
    match authorizer(Arc::clone(sess)).await {
        Some((user_id, md)) if !user_id.is_empty() => {
            sess.set_id(user_id);
            sess.set_metadata(md);
            true
        }
        _ => false,
    }
}
