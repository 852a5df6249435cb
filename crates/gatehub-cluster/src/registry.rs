//! Registry facade.
//!
//! Composes the [`Keeper`], [`Watcher`] and [`Resolver`] over one backend:
//! publish this node's entry, mirror everyone else's, and resolve service
//! codes to live gRPC channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tonic::metadata::MetadataMap;
use tonic::Status;
use ulid::Ulid;

use crate::entry::{NodeEntry, ServiceDesc};
use crate::error::ClusterError;
use crate::invoke::{invoke_unary, join_method_path};
use crate::keeper::{FatalHook, Keeper};
use crate::kv::KvStore;
use crate::resolver::{LoadBalance, Resolver};
use crate::watcher::{RegistryEvent, Watcher};

/// Cluster-side configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Registry key root; entries live at `<key_prefix>/<node id>`
    pub key_prefix: String,
    /// Connect timeout applied to every gRPC channel
    pub dial_timeout: Duration,
    /// Stateless allocation strategy
    pub load_balance: LoadBalance,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "/gatehub/node".to_string(),
            dial_timeout: Duration::from_secs(5),
            load_balance: LoadBalance::RoundRobin,
        }
    }
}

/// Service registry: keeper + watcher + resolver over one KV backend.
pub struct Registry {
    keeper: Keeper,
    watcher: Watcher,
    resolver: Arc<Resolver>,
    all_nodes: Arc<Mutex<HashMap<Ulid, NodeEntry>>>,
}

impl Registry {
    /// Starts a registry with the default fatal hook (exit on lease loss).
    pub async fn new(
        kv: Arc<dyn KvStore>,
        config: ClusterConfig,
    ) -> Result<Arc<Self>, ClusterError> {
        Self::build(kv, config, None).await
    }

    /// Starts a registry with an injected lease-loss hook (used by tests).
    pub async fn with_fatal_hook(
        kv: Arc<dyn KvStore>,
        config: ClusterConfig,
        hook: FatalHook,
    ) -> Result<Arc<Self>, ClusterError> {
        Self::build(kv, config, Some(hook)).await
    }

    async fn build(
        kv: Arc<dyn KvStore>,
        config: ClusterConfig,
        hook: Option<FatalHook>,
    ) -> Result<Arc<Self>, ClusterError> {
        let resolver = Arc::new(Resolver::new(config.dial_timeout, config.load_balance));
        let all_nodes: Arc<Mutex<HashMap<Ulid, NodeEntry>>> = Arc::new(Mutex::new(HashMap::new()));

        let watcher = Watcher::new(Arc::clone(&kv), config.key_prefix.clone());
        {
            let resolver = Arc::clone(&resolver);
            let all_nodes = Arc::clone(&all_nodes);
            watcher.subscribe(move |event| match event {
                RegistryEvent::Put(entry) => {
                    resolver.update_entry(entry);
                    all_nodes
                        .lock()
                        .expect("registry lock")
                        .insert(entry.id, entry.clone());
                }
                RegistryEvent::Delete(entry) => {
                    resolver.remove_entry(entry);
                    all_nodes.lock().expect("registry lock").remove(&entry.id);
                }
            });
        }

        let mut keeper = Keeper::new(kv, config.key_prefix);
        if let Some(hook) = hook {
            keeper = keeper.with_fatal_hook(hook);
        }
        keeper.start().await?;
        watcher.start();

        Ok(Arc::new(Self {
            keeper,
            watcher,
            resolver,
            all_nodes,
        }))
    }

    /// Publishes this node's entry under the lease.
    pub async fn put(&self, entry: &NodeEntry) -> Result<(), ClusterError> {
        self.keeper.put(entry).await
    }

    /// Any registered descriptor for the service code.
    pub fn get_desc(&self, service_code: i32) -> Option<ServiceDesc> {
        self.resolver.get_desc(service_code)
    }

    /// Picks a node hosting the service.
    pub fn alloc_node(&self, service_code: i32, session_id: &str) -> Result<Ulid, ClusterError> {
        self.resolver.alloc_node(service_code, session_id)
    }

    /// Invokes a unary method on a node, flagging it on transport failure.
    pub async fn invoke(
        &self,
        node_id: Ulid,
        desc: &ServiceDesc,
        method: &str,
        metadata: MetadataMap,
        payload: Bytes,
    ) -> Result<Bytes, Status> {
        let channel = self
            .resolver
            .get_conn(node_id)
            .map_err(|err| Status::unavailable(format!("get grpc conn: {err}")))?;

        let path = join_method_path(&desc.path, method);
        let result = invoke_unary(channel, &path, metadata, payload).await;
        if let Err(status) = &result {
            if status.code() == tonic::Code::Unavailable {
                self.resolver.mark_unhealthy(node_id);
            }
        }
        result
    }

    /// Registers a callback for every registry event.
    pub fn subscribe(&self, f: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.watcher.subscribe(f);
    }

    /// Registers a callback invoked when a node leaves the cluster.
    pub fn subscribe_delete(&self, f: impl Fn(&NodeEntry) + Send + Sync + 'static) {
        self.watcher.subscribe(move |event| {
            if let RegistryEvent::Delete(entry) = event {
                f(entry);
            }
        });
    }

    /// Visits every known node; stop early by returning `false`.
    pub fn foreach_nodes(&self, mut f: impl FnMut(&NodeEntry) -> bool) {
        for entry in self.all_nodes.lock().expect("registry lock").values() {
            if !f(entry) {
                break;
            }
        }
    }

    /// Number of nodes currently mirrored.
    pub fn node_count(&self) -> usize {
        self.all_nodes.lock().expect("registry lock").len()
    }

    /// Revokes the lease, stops the watcher and drains every channel.
    pub async fn close(&self) {
        self.watcher.stop();
        self.keeper.close().await;
        self.resolver.close();
    }
}
