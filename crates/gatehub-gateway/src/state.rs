//! State table: routing memory for stateful services.
//!
//! Two-level map keyed first by session so session cleanup is one removal,
//! with a reverse index by node so a node leaving the cluster drops every
//! mapping that points at it. Both indices are updated under one lock.
//! The reverse index is in-memory only; it can always be rebuilt from the
//! forward map.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;
use ulid::Ulid;

#[derive(Default)]
struct Indices {
    by_session: HashMap<String, HashMap<i32, Ulid>>,
    by_node: HashMap<Ulid, HashSet<(String, i32)>>,
}

/// Maps (session, service) → node for stateful services.
#[derive(Default)]
pub struct StateTable {
    inner: Mutex<Indices>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the session's requests for the service go to the node.
    pub fn store(&self, session_id: &str, service_code: i32, node_id: Ulid) {
        let mut inner = self.inner.lock().expect("state lock");

        let slot = inner
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(service_code, node_id);
        if let Some(previous) = slot {
            if let Some(back) = inner.by_node.get_mut(&previous) {
                back.remove(&(session_id.to_string(), service_code));
            }
        }
        inner
            .by_node
            .entry(node_id)
            .or_default()
            .insert((session_id.to_string(), service_code));
    }

    /// Looks up the node the session sticks to for the service.
    pub fn find(&self, session_id: &str, service_code: i32) -> Option<Ulid> {
        self.inner
            .lock()
            .expect("state lock")
            .by_session
            .get(session_id)
            .and_then(|services| services.get(&service_code))
            .copied()
    }

    /// Drops one (session, service) mapping.
    pub fn remove(&self, session_id: &str, service_code: i32) {
        let mut inner = self.inner.lock().expect("state lock");

        let removed = inner
            .by_session
            .get_mut(session_id)
            .and_then(|services| services.remove(&service_code));
        if let Some(node_id) = removed {
            if let Some(back) = inner.by_node.get_mut(&node_id) {
                back.remove(&(session_id.to_string(), service_code));
            }
        }
    }

    /// Drops every mapping for the session.
    pub fn clean_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("state lock");

        if let Some(services) = inner.by_session.remove(session_id) {
            for (service_code, node_id) in services {
                if let Some(back) = inner.by_node.get_mut(&node_id) {
                    back.remove(&(session_id.to_string(), service_code));
                }
            }
            debug!(session = session_id, "state table session cleaned");
        }
    }

    /// Drops every mapping pointing at the node (the node left the cluster).
    pub fn clean_node(&self, node_id: Ulid) {
        let mut inner = self.inner.lock().expect("state lock");

        if let Some(entries) = inner.by_node.remove(&node_id) {
            for (session_id, service_code) in entries {
                if let Some(services) = inner.by_session.get_mut(&session_id) {
                    services.remove(&service_code);
                }
            }
            debug!(node = %node_id, "state table node cleaned");
        }
    }

    /// Every (service, node) mapping the session currently holds.
    pub fn assignments(&self, session_id: &str) -> Vec<(i32, Ulid)> {
        self.inner
            .lock()
            .expect("state lock")
            .by_session
            .get(session_id)
            .map(|services| services.iter().map(|(code, node)| (*code, *node)).collect())
            .unwrap_or_default()
    }

    /// Total number of mappings, for tests and the management surface.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("state lock")
            .by_session
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
