//! In-memory [`KvStore`] used by the test suites.
//!
//! Lease and watch semantics mirror the production backend closely enough to
//! exercise the keeper and watcher: renewal receivers close when a lease is
//! revoked or expired, and expiry deletes the lease's keys with prev-values
//! reported to watchers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{KvEvent, KvStore, LeaseId};
use crate::error::ClusterError;

const RENEW_TICK: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Shared {
    entries: HashMap<String, (String, LeaseId)>,
    leases: HashMap<LeaseId, ()>,
    watchers: Vec<(String, mpsc::Sender<KvEvent>)>,
}

impl Shared {
    fn notify(&mut self, event: KvEvent) {
        let key = match &event {
            KvEvent::Put { key, .. } | KvEvent::Delete { key, .. } => key.clone(),
        };
        self.watchers
            .retain(|(prefix, tx)| !key.starts_with(prefix.as_str()) || tx.try_send(event.clone()).is_ok());
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        if self.leases.remove(&lease).is_none() {
            return;
        }

        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, l))| *l == lease)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            if let Some((prev, _)) = self.entries.remove(&key) {
                self.notify(KvEvent::Delete {
                    key,
                    prev_value: Some(prev),
                });
            }
        }
    }
}

/// In-memory KV store with lease and watch semantics.
#[derive(Clone, Default)]
pub struct MemoryKv {
    shared: Arc<Mutex<Shared>>,
    next_lease: Arc<AtomicI64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force-expires a lease, as the backend would after missed renewals.
    ///
    /// Keys attached to the lease are deleted and their watchers notified;
    /// the lease's renewal receivers close.
    pub fn expire_lease(&self, lease: LeaseId) {
        self.shared.lock().expect("kv lock").drop_lease(lease);
    }

    /// Number of live keys, for test assertions.
    pub fn len(&self) -> usize {
        self.shared.lock().expect("kv lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn grant_lease(&self, _ttl: Duration) -> Result<LeaseId, ClusterError> {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.lock().expect("kv lock").leases.insert(lease, ());
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<()>, ClusterError> {
        {
            let shared = self.shared.lock().expect("kv lock");
            if !shared.leases.contains_key(&lease) {
                return Err(ClusterError::Kv(format!("lease {lease} not found")));
            }
        }

        let (tx, rx) = mpsc::channel(8);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEW_TICK).await;

                if !shared.lock().expect("kv lock").leases.contains_key(&lease) {
                    // Lease is gone; dropping tx closes the renewal channel.
                    return;
                }
                if tx.send(()).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), ClusterError> {
        self.shared.lock().expect("kv lock").drop_lease(lease);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), ClusterError> {
        let mut shared = self.shared.lock().expect("kv lock");
        if !shared.leases.contains_key(&lease) {
            return Err(ClusterError::Kv(format!("lease {lease} not found")));
        }

        shared
            .entries
            .insert(key.to_string(), (value.to_string(), lease));
        shared.notify(KvEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ClusterError> {
        let shared = self.shared.lock().expect("kv lock");
        let mut kvs: Vec<(String, String)> = shared
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect();
        kvs.sort();
        Ok(kvs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .lock()
            .expect("kv lock")
            .watchers
            .push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();

        kv.put("/nodes/a", "1", lease).await.unwrap();
        kv.put("/nodes/b", "2", lease).await.unwrap();
        kv.put("/other/c", "3", lease).await.unwrap();

        let kvs = kv.get_prefix("/nodes").await.unwrap();
        assert_eq!(
            kvs,
            vec![
                ("/nodes/a".to_string(), "1".to_string()),
                ("/nodes/b".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_sees_put_and_delete() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        let mut watch = kv.watch_prefix("/nodes").await.unwrap();

        kv.put("/nodes/a", "1", lease).await.unwrap();
        assert_eq!(
            watch.recv().await.unwrap(),
            KvEvent::Put {
                key: "/nodes/a".to_string(),
                value: "1".to_string()
            }
        );

        kv.expire_lease(lease);
        assert_eq!(
            watch.recv().await.unwrap(),
            KvEvent::Delete {
                key: "/nodes/a".to_string(),
                prev_value: Some("1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_keep_alive_closes_on_expiry() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        let mut renewals = kv.keep_alive(lease).await.unwrap();

        // At least one renewal arrives while the lease is alive.
        assert!(renewals.recv().await.is_some());

        kv.expire_lease(lease);
        // Channel drains then closes.
        while renewals.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_put_without_lease_fails() {
        let kv = MemoryKv::new();
        assert!(kv.put("/nodes/a", "1", 42).await.is_err());
    }
}
