//! Registry watcher.
//!
//! Maintains a live mirror of every [`NodeEntry`] under the key prefix: an
//! initial range scan emits a PUT for each existing key, then a change
//! stream delivers PUTs and DELETEs. When the stream breaks the watcher
//! reconnects with capped exponential backoff and rebuilds the mirror from a
//! fresh scan — consumers must treat duplicate PUTs as idempotent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::entry::NodeEntry;
use crate::kv::{KvEvent, KvStore};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A change in the set of cluster nodes.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Put(NodeEntry),
    Delete(NodeEntry),
}

type Subscriber = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Watches the key prefix and fans changes out to subscribers.
///
/// Subscribers are invoked synchronously in the watcher task, in the order
/// events arrive from the backend; they must not block.
pub struct Watcher {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    /// Registers a callback for every subsequent registry event.
    pub fn subscribe(&self, f: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("watcher lock")
            .push(Box::new(f));
    }

    /// Starts the watch loop.
    pub fn start(&self) {
        let kv = Arc::clone(&self.kv);
        let prefix = self.key_prefix.clone();
        let subscribers = Arc::clone(&self.subscribers);

        let handle = tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;

            loop {
                // Rebuild the mirror from truth before (re)watching.
                match kv.get_prefix(&prefix).await {
                    Ok(kvs) => {
                        for (_, value) in kvs {
                            dispatch_value(&subscribers, &value, false);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "scan registry prefix");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        continue;
                    }
                }

                match kv.watch_prefix(&prefix).await {
                    Ok(mut events) => {
                        backoff = BACKOFF_BASE;
                        while let Some(event) = events.recv().await {
                            match event {
                                KvEvent::Put { value, .. } => {
                                    dispatch_value(&subscribers, &value, false);
                                }
                                KvEvent::Delete { key, prev_value } => match prev_value {
                                    Some(value) => dispatch_value(&subscribers, &value, true),
                                    None => warn!(key, "delete event without previous value"),
                                },
                            }
                        }
                        warn!("registry watch closed, reconnecting");
                    }
                    Err(err) => {
                        warn!(error = %err, "establish registry watch");
                    }
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        });

        *self.task.lock().expect("watcher lock") = Some(handle);
    }

    /// Stops the watch loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("watcher lock").take() {
            handle.abort();
        }
    }
}

fn dispatch_value(subscribers: &Mutex<Vec<Subscriber>>, value: &str, deleted: bool) {
    let entry: NodeEntry = match serde_json::from_str(value) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(error = %err, "unmarshal node entry");
            return;
        }
    };
    if let Err(err) = entry.validate() {
        warn!(error = %err, node = %entry.id, "dropping invalid node entry");
        return;
    }

    let event = if deleted {
        RegistryEvent::Delete(entry)
    } else {
        RegistryEvent::Put(entry)
    };

    for subscriber in subscribers.lock().expect("watcher lock").iter() {
        subscriber(&event);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
