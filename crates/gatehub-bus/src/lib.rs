//! Bus contracts for gatehub.
//!
//! Two channels flow between cluster components outside the request path:
//!
//! - the **event bus** carries session lifecycle and state-assignment
//!   events ([`Event`]);
//! - the **multicast bus** carries server-initiated fan-out messages
//!   addressed by session id ([`Multicast`](gatehub_proto::Multicast)).
//!
//! The transports behind these (Redis, NATS, ...) are external collaborators;
//! this crate fixes the contracts and ships [`MemoryBus`], a process-local
//! implementation used by tests and single-node deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use gatehub_proto::Multicast;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Cluster event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A session finished authorization on some gateway
    UserConnected { session_id: String, gateway_id: String },
    /// A session disconnected from its gateway
    UserDisconnected { session_id: String, gateway_id: String },
    /// A backend assigned a stateful service node to a session
    NodeAssign {
        session_id: String,
        service_code: i32,
        node_id: Ulid,
    },
    /// A backend released a session's stateful service node
    NodeUnassign { session_id: String, service_code: i32 },
}

/// Publish/subscribe channel for [`Event`]s.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Publish/subscribe channel for multicast messages.
#[async_trait]
pub trait MulticastBus: Send + Sync {
    async fn publish(&self, message: Multicast) -> Result<(), BusError>;

    fn subscribe(&self) -> broadcast::Receiver<Multicast>;
}

/// Process-local bus backed by tokio broadcast channels.
pub struct MemoryBus {
    events: broadcast::Sender<Event>,
    multicasts: broadcast::Sender<Multicast>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (multicasts, _) = broadcast::channel(256);
        Self { events, multicasts }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        // A send without subscribers is not a failure for a bus.
        let _ = self.events.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[async_trait]
impl MulticastBus for MemoryBus {
    async fn publish(&self, message: Multicast) -> Result<(), BusError> {
        let _ = self.multicasts.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Multicast> {
        self.multicasts.subscribe()
    }
}
