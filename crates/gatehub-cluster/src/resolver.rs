//! gRPC resolver.
//!
//! Consumes registry events and keeps, for each service code, the set of
//! nodes hosting it plus one lazily-created gRPC channel per node. Channels
//! are owned here: they are dropped exactly once, either when the node's
//! entry is removed or when the resolver closes.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::entry::{NodeEntry, NodeState, ServiceDesc};
use crate::error::ClusterError;

/// Node selection strategy for stateless allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Rotate through healthy nodes, keyed per service
    #[default]
    RoundRobin,
    /// Hash the session id so one session keeps hitting the same node
    SessionHash,
}

struct ServicePool {
    desc: ServiceDesc,
    nodes: Vec<Ulid>,
    next: AtomicUsize,
}

struct NodeConn {
    endpoint: String,
    state: NodeState,
    channel: Option<Channel>,
    /// Cleared when an invoke against this node fails at the transport
    /// level; allocation prefers healthy nodes and `get_conn` re-dials
    /// flagged ones.
    healthy: bool,
}

/// Per-service connection pools with load-balanced allocation.
pub struct Resolver {
    services: RwLock<HashMap<i32, ServicePool>>,
    nodes: RwLock<HashMap<Ulid, NodeConn>>,
    dial_timeout: Duration,
    load_balance: LoadBalance,
}

impl Resolver {
    pub fn new(dial_timeout: Duration, load_balance: LoadBalance) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            dial_timeout,
            load_balance,
        }
    }

    /// Applies a PUT: re-registers the node and each service it hosts.
    ///
    /// A re-put replaces the previous record wholesale; services the node no
    /// longer hosts forget it. Duplicate PUTs are idempotent.
    pub fn update_entry(&self, entry: &NodeEntry) {
        {
            let mut nodes = self.nodes.write().expect("resolver lock");
            let channel = nodes
                .get(&entry.id)
                .filter(|conn| conn.endpoint == entry.grpc.endpoint)
                .and_then(|conn| conn.channel.clone());

            nodes.insert(
                entry.id,
                NodeConn {
                    endpoint: entry.grpc.endpoint.clone(),
                    state: entry.state,
                    channel,
                    healthy: true,
                },
            );
        }

        let mut services = self.services.write().expect("resolver lock");
        for desc in &entry.grpc.services {
            match services.entry(desc.code) {
                Entry::Occupied(mut occupied) => {
                    let pool = occupied.get_mut();
                    if pool.desc != *desc {
                        warn!(
                            service = desc.code,
                            node = %entry.id,
                            "conflicting service descriptors, last observed wins"
                        );
                        pool.desc = desc.clone();
                    }
                    if !pool.nodes.contains(&entry.id) {
                        pool.nodes.push(entry.id);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(ServicePool {
                        desc: desc.clone(),
                        nodes: vec![entry.id],
                        next: AtomicUsize::new(0),
                    });
                }
            }
        }
        for (code, pool) in services.iter_mut() {
            if !entry.grpc.services.iter().any(|desc| desc.code == *code) {
                pool.nodes.retain(|id| *id != entry.id);
            }
        }
    }

    /// Applies a DELETE: the node's channel is dropped and no pool keeps
    /// referring to it.
    pub fn remove_entry(&self, entry: &NodeEntry) {
        {
            let mut services = self.services.write().expect("resolver lock");
            for pool in services.values_mut() {
                pool.nodes.retain(|id| *id != entry.id);
            }
        }

        // Dropping the record drops the channel, tearing the connection down.
        self.nodes.write().expect("resolver lock").remove(&entry.id);
    }

    /// Any registered descriptor for the service code.
    pub fn get_desc(&self, service_code: i32) -> Option<ServiceDesc> {
        self.services
            .read()
            .expect("resolver lock")
            .get(&service_code)
            .map(|pool| pool.desc.clone())
    }

    /// Picks a node for the service among entries whose node is `ok`.
    ///
    /// Flagged (unhealthy) nodes are skipped while a healthy alternative
    /// exists; when every candidate is flagged one is still returned so the
    /// subsequent `get_conn` gets its chance to re-dial.
    pub fn alloc_node(&self, service_code: i32, session_id: &str) -> Result<Ulid, ClusterError> {
        let (candidates, position) = {
            let services = self.services.read().expect("resolver lock");
            let pool = services
                .get(&service_code)
                .ok_or(ClusterError::NoNodeAvailable)?;
            (pool.nodes.clone(), pool.next.fetch_add(1, Ordering::Relaxed))
        };

        let nodes = self.nodes.read().expect("resolver lock");
        let serving: Vec<Ulid> = candidates
            .iter()
            .copied()
            .filter(|id| {
                nodes
                    .get(id)
                    .map(|conn| conn.state == NodeState::Ok)
                    .unwrap_or(false)
            })
            .collect();
        if serving.is_empty() {
            return Err(ClusterError::NoNodeAvailable);
        }

        let healthy: Vec<Ulid> = serving
            .iter()
            .copied()
            .filter(|id| nodes.get(id).map(|conn| conn.healthy).unwrap_or(false))
            .collect();
        let pick_from = if healthy.is_empty() { &serving } else { &healthy };

        let index = match self.load_balance {
            LoadBalance::RoundRobin => position % pick_from.len(),
            LoadBalance::SessionHash => {
                let mut hasher = DefaultHasher::new();
                session_id.hash(&mut hasher);
                (hasher.finish() as usize) % pick_from.len()
            }
        };
        Ok(pick_from[index])
    }

    /// Resolves a node to its gRPC channel, dialing lazily on first use.
    pub fn get_conn(&self, node_id: Ulid) -> Result<Channel, ClusterError> {
        let mut nodes = self.nodes.write().expect("resolver lock");
        let conn = nodes.get_mut(&node_id).ok_or(ClusterError::NoNodeOrDown)?;
        if conn.state != NodeState::Ok {
            return Err(ClusterError::NoNodeOrDown);
        }

        if conn.channel.is_none() || !conn.healthy {
            let endpoint = Endpoint::from_shared(conn.endpoint.clone())?
                .connect_timeout(self.dial_timeout);
            conn.channel = Some(endpoint.connect_lazy());
            conn.healthy = true;
            debug!(node = %node_id, endpoint = %conn.endpoint, "dialing grpc channel");
        }

        conn.channel.clone().ok_or(ClusterError::NoNodeOrDown)
    }

    /// Flags a node after a transport-level failure; the next `get_conn`
    /// re-dials it.
    pub fn mark_unhealthy(&self, node_id: Ulid) {
        if let Some(conn) = self
            .nodes
            .write()
            .expect("resolver lock")
            .get_mut(&node_id)
        {
            conn.healthy = false;
            debug!(node = %node_id, "grpc node flagged unhealthy");
        }
    }

    /// Drops every channel.
    pub fn close(&self) {
        self.services.write().expect("resolver lock").clear();
        self.nodes.write().expect("resolver lock").clear();
    }
}
