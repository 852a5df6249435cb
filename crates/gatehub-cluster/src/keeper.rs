//! Lease keeper.
//!
//! Publishes this node's entry under a bounded-TTL lease and keeps the lease
//! renewed. The node must not keep appearing alive once the lease is dead,
//! so a closed renewal channel is fatal: the keeper invokes its fatal hook,
//! which by default logs and exits the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::entry::NodeEntry;
use crate::error::ClusterError;
use crate::kv::{KvStore, LeaseId};

/// Lease TTL. Fixed: renewals run at a third of this, and the failure
/// detection window of every other node in the cluster depends on it.
pub const LEASE_TTL: Duration = Duration::from_secs(10);

/// Hook invoked when the lease is lost.
pub type FatalHook = Arc<dyn Fn() + Send + Sync>;

fn default_fatal_hook() -> FatalHook {
    Arc::new(|| {
        error!("registry lease lost, aborting");
        std::process::exit(1);
    })
}

/// Publishes entries under a renewed lease. At most one lease per keeper.
pub struct Keeper {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    lease: Mutex<Option<LeaseId>>,
    closed: Arc<AtomicBool>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    on_lease_lost: FatalHook,
}

impl Keeper {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            lease: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            renewal: Mutex::new(None),
            on_lease_lost: default_fatal_hook(),
        }
    }

    /// Replaces the fatal hook. Tests use this to observe lease loss
    /// without killing the test process.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.on_lease_lost = hook;
        self
    }

    /// Grants the lease and starts the renewal loop.
    pub async fn start(&self) -> Result<(), ClusterError> {
        {
            let lease = self.lease.lock().expect("keeper lock");
            if lease.is_some() {
                return Err(ClusterError::AlreadyStarted);
            }
        }

        let lease = self.kv.grant_lease(LEASE_TTL).await?;
        let mut renewals = self.kv.keep_alive(lease).await?;
        info!(lease, ttl = ?LEASE_TTL, "registry lease granted");

        let closed = Arc::clone(&self.closed);
        let hook = Arc::clone(&self.on_lease_lost);
        let handle = tokio::spawn(async move {
            while renewals.recv().await.is_some() {}

            if !closed.load(Ordering::SeqCst) {
                error!(lease, "lease renewal channel closed unexpectedly");
                hook();
            }
        });

        *self.lease.lock().expect("keeper lock") = Some(lease);
        *self.renewal.lock().expect("keeper lock") = Some(handle);
        Ok(())
    }

    /// Publishes an entry at `<prefix>/<id>`, attached to the lease.
    ///
    /// Only usable after [`start`](Keeper::start); re-putting the same id
    /// replaces the stored entry wholesale.
    pub async fn put(&self, entry: &NodeEntry) -> Result<(), ClusterError> {
        let lease = self
            .lease
            .lock()
            .expect("keeper lock")
            .ok_or(ClusterError::LeaseNotGranted)?;
        entry.validate()?;

        let key = format!("{}/{}", self.key_prefix, entry.id);
        let value = serde_json::to_string(entry)?;
        self.kv.put(&key, &value, lease).await
    }

    /// Revokes the lease (best-effort) and stops the renewal loop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(handle) = self.renewal.lock().expect("keeper lock").take() {
            handle.abort();
        }

        let lease = self.lease.lock().expect("keeper lock").take();
        if let Some(lease) = lease {
            if let Err(err) = self.kv.revoke_lease(lease).await {
                error!(lease, error = %err, "revoke lease");
            }
        }
    }
}
