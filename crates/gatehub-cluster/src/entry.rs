//! Node entries and service descriptors.
//!
//! A [`NodeEntry`] is the immutable record a node publishes to the registry.
//! Changing anything about a node means re-putting the whole entry; watchers
//! treat every PUT as a full replacement.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ClusterError;

/// Operational state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Accepting traffic
    Ok,
    /// Finishing existing work, not accepting new allocations
    Drain,
    /// Out of service
    Down,
}

/// How a stateful service picks the node a session sticks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocation {
    /// The resolver picks any healthy node on first use and remembers it
    Auto,
    /// The client may name the node on its first call; sticky afterwards
    Client,
    /// A node is assigned only via bus events; no automatic selection
    Server,
}

/// One gRPC service hosted by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDesc {
    /// Non-zero service identifier; the routing key on every request
    pub code: i32,
    /// gRPC method path prefix, e.g. `/chat.Room`
    pub path: String,
    /// Whether gateway clients may invoke this service
    #[serde(default)]
    pub public: bool,
    /// Whether requests from one session must stick to one node
    #[serde(default)]
    pub stateful: bool,
    /// Node selection rule for stateful services
    pub allocation: Allocation,
    /// Ordering domain; requests sharing a non-empty pipeline are FIFO
    #[serde(default)]
    pub pipeline: String,
}

/// The gRPC endpoint a node exposes, plus the services behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcEntry {
    /// Dial target for this node's gRPC server, e.g. `http://10.0.0.5:9100`
    pub endpoint: String,
    /// Services hosted behind the endpoint
    pub services: Vec<ServiceDesc>,
}

/// Immutable record describing one cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Cluster-wide unique, time-sortable identifier
    pub id: Ulid,
    /// Human-readable node name
    pub name: String,
    /// Operational state
    pub state: NodeState,
    /// Public transport URL, filled in by gateway transports
    #[serde(default)]
    pub entrance: Option<String>,
    /// gRPC surface of the node
    pub grpc: GrpcEntry,
    /// Publish time of this entry
    pub created_at: SystemTime,
}

impl NodeEntry {
    /// Creates an entry in state `ok` with a fresh timestamp.
    pub fn new(id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: NodeState::Ok,
            entrance: None,
            grpc: GrpcEntry {
                endpoint: String::new(),
                services: Vec::new(),
            },
            created_at: SystemTime::now(),
        }
    }

    /// Validates the entry before publish or after decode.
    ///
    /// Invalid entries observed on the wire are dropped by the watcher with
    /// a logged warning; invalid local entries refuse to publish.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.id.is_nil() {
            return Err(ClusterError::InvalidEntry("id is zero".to_string()));
        }
        if self.name.is_empty() {
            return Err(ClusterError::InvalidEntry("name is empty".to_string()));
        }
        if !self.grpc.services.is_empty() && self.grpc.endpoint.is_empty() {
            return Err(ClusterError::InvalidEntry(
                "grpc endpoint is empty".to_string(),
            ));
        }
        for desc in &self.grpc.services {
            if desc.code == 0 {
                return Err(ClusterError::InvalidEntry(format!(
                    "service {:?} has zero code",
                    desc.path
                )));
            }
            if desc.path.is_empty() {
                return Err(ClusterError::InvalidEntry(format!(
                    "service {} has empty path",
                    desc.code
                )));
            }
        }
        Ok(())
    }
}
