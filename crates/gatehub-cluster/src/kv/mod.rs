//! Registry backend abstraction.
//!
//! The registry consumes its backend as a KV store with leases, watches and
//! prefix ranges — nothing more. [`etcd::EtcdKv`] is the production backend;
//! [`memory::MemoryKv`] backs the test suites.

pub mod etcd;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClusterError;

/// Backend lease identifier.
pub type LeaseId = i64;

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum KvEvent {
    Put {
        key: String,
        value: String,
    },
    Delete {
        key: String,
        /// Last value the key held, when the backend can report it
        prev_value: Option<String>,
    },
}

/// Minimal KV contract the registry needs from its backend.
///
/// Semantics expected of implementations:
///
/// - keys put with a lease disappear when the lease expires or is revoked;
/// - the receiver returned by [`keep_alive`](KvStore::keep_alive) yields one
///   message per successful renewal and **closes** when the lease is dead —
///   channel close is the only death signal the keeper gets;
/// - the receiver returned by [`watch_prefix`](KvStore::watch_prefix) closes
///   when the watch breaks; consumers re-establish it and re-scan.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, ClusterError>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<()>, ClusterError>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), ClusterError>;

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), ClusterError>;

    async fn get_prefix(&self, prefix: &str)
        -> Result<Vec<(String, String)>, ClusterError>;

    async fn watch_prefix(&self, prefix: &str)
        -> Result<mpsc::Receiver<KvEvent>, ClusterError>;
}
