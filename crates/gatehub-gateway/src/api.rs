//! Gateway management surface.
//!
//! Operations other cluster components invoke against a gateway node:
//! counting and kicking sessions, pushing a reply to one session, and
//! inspecting a session's stateful assignments. Exposed over the node's
//! gRPC server in deployment; the type itself is transport-agnostic.

use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use gatehub_proto::Reply;

use crate::error::GatewayError;
use crate::hub::SessionHub;
use crate::session::SessionError;
use crate::state::StateTable;

/// Management operations over one gateway's hub and state table.
#[derive(Clone)]
pub struct GatewayApi {
    sessions: Arc<SessionHub>,
    state: Arc<StateTable>,
}

impl GatewayApi {
    pub(crate) fn new(sessions: Arc<SessionHub>, state: Arc<StateTable>) -> Self {
        Self { sessions, state }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Whether the session is connected to this gateway.
    pub fn is_online(&self, session_id: &str) -> bool {
        self.sessions.load(session_id).is_some()
    }

    /// Force-disconnects a session. Returns whether it was present.
    pub async fn kick(&self, session_id: &str) -> bool {
        let Some(sess) = self.sessions.load(session_id) else {
            return false;
        };
        info!(session = session_id, "session kicked");
        self.sessions.delete(session_id);
        sess.close().await;
        true
    }

    /// Pushes a reply directly to one session.
    pub async fn push(&self, session_id: &str, reply: &Reply) -> Result<(), GatewayError> {
        let sess = self
            .sessions
            .load(session_id)
            .ok_or(GatewayError::Session(SessionError::Closed))?;
        sess.send(reply).await?;
        Ok(())
    }

    /// The session's current (service, node) assignments.
    pub fn assignments(&self, session_id: &str) -> Vec<(i32, Ulid)> {
        self.state.assignments(session_id)
    }
}
