//! Cluster membership and routing for gatehub.
//!
//! A node publishes its [`NodeEntry`] under a bounded-TTL lease in the
//! registry backend; every node mirrors the full set of entries through a
//! prefix watch and resolves gRPC connections out of that mirror.
//!
//! # Components
//!
//! - [`Keeper`] — grants the lease and keeps it renewed; lease loss is fatal
//! - [`Watcher`] — live mirror of all entries under the key prefix
//! - [`Resolver`] — per-service connection pools with load-balanced allocation
//! - [`Registry`] — facade composing the three over a [`KvStore`] backend
//!
//! The backend is abstracted behind [`KvStore`]: production uses
//! [`EtcdKv`](kv::etcd::EtcdKv), tests use [`MemoryKv`](kv::memory::MemoryKv).

pub mod entry;
pub mod error;
pub mod invoke;
pub mod keeper;
pub mod kv;
pub mod registry;
pub mod resolver;
pub mod watcher;

pub use entry::{Allocation, GrpcEntry, NodeEntry, NodeState, ServiceDesc};
pub use error::ClusterError;
pub use invoke::{invoke_unary, join_method_path, RawCodec};
pub use keeper::Keeper;
pub use kv::{KvEvent, KvStore, LeaseId};
pub use registry::{ClusterConfig, Registry};
pub use resolver::{LoadBalance, Resolver};
pub use watcher::{RegistryEvent, Watcher};

/// Convenience result alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
