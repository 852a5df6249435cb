//! Session hub.
//!
//! Holds every live session and reaps zombies: a background task sweeps the
//! hub every 10 seconds and closes sessions whose read/write clock has not
//! advanced within the heartbeat timeout.
//!
//! `store` and `delete` for the same id race at reconnect. Policy: store is
//! last-writer-wins, and [`remove`](SessionHub::remove) ignores a delete
//! that observes a different session object than the caller holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::SessionRef;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// The set of live sessions on this gateway.
pub struct SessionHub {
    sessions: Mutex<HashMap<String, SessionRef>>,
    heartbeat_timeout: Duration,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHub {
    /// Creates the hub and starts its reaper.
    pub fn new(heartbeat_timeout: Duration) -> Arc<Self> {
        let hub = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&hub);
        let handle = tokio::spawn(Self::reap_zombies(weak));
        *hub.reaper.lock().expect("hub lock") = Some(handle);
        hub
    }

    /// Inserts a session, replacing any previous one under the same id.
    pub fn store(&self, sess: SessionRef) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.sessions
            .lock()
            .expect("hub lock")
            .insert(sess.id(), sess);
    }

    pub fn load(&self, id: &str) -> Option<SessionRef> {
        self.sessions.lock().expect("hub lock").get(id).cloned()
    }

    /// Deletes whatever session is stored under the id.
    pub fn delete(&self, id: &str) {
        self.sessions.lock().expect("hub lock").remove(id);
    }

    /// Deletes the session only if the hub still holds this exact object.
    ///
    /// A reconnect may have replaced the entry; deleting the replacement
    /// would tear down a healthy session.
    pub fn remove(&self, sess: &SessionRef) {
        let mut sessions = self.sessions.lock().expect("hub lock");
        if let Some(stored) = sessions.get(&sess.id()) {
            if Arc::ptr_eq(stored, sess) {
                sessions.remove(&sess.id());
            }
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("hub lock").len()
    }

    /// Visits every session; stop early by returning `false`.
    pub fn range(&self, mut f: impl FnMut(&SessionRef) -> bool) {
        let sessions: Vec<SessionRef> = self
            .sessions
            .lock()
            .expect("hub lock")
            .values()
            .cloned()
            .collect();
        for sess in &sessions {
            if !f(sess) {
                break;
            }
        }
    }

    /// Force-closes every session and stops the reaper.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.reaper.lock().expect("hub lock").take() {
            handle.abort();
        }

        let sessions: Vec<SessionRef> = {
            let mut map = self.sessions.lock().expect("hub lock");
            map.drain().map(|(_, sess)| sess).collect()
        };
        for sess in sessions {
            sess.close().await;
        }
    }

    async fn reap_zombies(hub: Weak<SessionHub>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            let Some(hub) = hub.upgrade() else { return };
            if hub.closed.load(Ordering::SeqCst) {
                return;
            }

            // Deletion happens under the hub lock; closing does not.
            let zombies: Vec<SessionRef> = {
                let mut sessions = hub.sessions.lock().expect("hub lock");
                let dead: Vec<String> = sessions
                    .iter()
                    .filter(|(_, sess)| sess.last_rw_time().elapsed() > hub.heartbeat_timeout)
                    .map(|(id, _)| id.clone())
                    .collect();
                dead.iter().filter_map(|id| sessions.remove(id)).collect()
            };

            for sess in zombies {
                info!(
                    session = %sess.id(),
                    remote = %sess.remote_addr(),
                    "evicting zombie session"
                );
                sess.close().await;
            }
            debug!(count = hub.count(), "session sweep finished");
        }
    }
}
