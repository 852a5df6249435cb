//! etcd-backed [`KvStore`].
//!
//! Thin adapter over `etcd-client`: leases map to etcd leases, watches to
//! prefix watches with prev-KV enabled. The adapter converts the client's
//! streams into the channel shapes the keeper and watcher consume.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KvEvent, KvStore, LeaseId};
use crate::error::ClusterError;

/// How often the renewal loop asks etcd to extend the lease. The lease TTL
/// is 10 seconds; renewing at a third of that tolerates two missed rounds.
const RENEW_INTERVAL: Duration = Duration::from_secs(3);

/// etcd registry backend.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connects to the given etcd endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self, ClusterError> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    /// Wraps an already-connected client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, ClusterError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl.as_secs() as i64, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<()>, ClusterError> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease, error = %err, "lease renewal request failed");
                    return;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        if tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(resp)) => {
                        warn!(lease, ttl = resp.ttl(), "lease expired on renewal");
                        return;
                    }
                    Ok(None) => {
                        warn!(lease, "lease renewal stream closed");
                        return;
                    }
                    Err(err) => {
                        warn!(lease, error = %err, "lease renewal stream error");
                        return;
                    }
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
        });
        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), ClusterError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), ClusterError> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ClusterError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            kvs.push((kv.key_str()?.to_string(), kv.value_str()?.to_string()));
        }
        Ok(kvs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>, ClusterError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(
                prefix,
                Some(WatchOptions::new().with_prefix().with_prev_key()),
            )
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            // The watcher handle must stay alive for the stream to deliver.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        debug!("watch stream ended");
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "watch stream error");
                        return;
                    }
                };

                for event in resp.events() {
                    let converted = match event.event_type() {
                        EventType::Put => event.kv().and_then(|kv| {
                            match (kv.key_str(), kv.value_str()) {
                                (Ok(key), Ok(value)) => Some(KvEvent::Put {
                                    key: key.to_string(),
                                    value: value.to_string(),
                                }),
                                _ => None,
                            }
                        }),
                        EventType::Delete => event.kv().and_then(|kv| {
                            kv.key_str().ok().map(|key| KvEvent::Delete {
                                key: key.to_string(),
                                prev_value: event
                                    .prev_kv()
                                    .and_then(|prev| prev.value_str().ok())
                                    .map(|v| v.to_string()),
                            })
                        }),
                    };

                    let Some(converted) = converted else {
                        warn!("dropping watch event with non-utf8 key or value");
                        continue;
                    };
                    if tx.send(converted).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
