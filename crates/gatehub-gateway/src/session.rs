//! Client sessions.
//!
//! A [`Session`] is an authenticated client connection: requests flow in
//! through [`recv`](Session::recv), replies flow out through
//! [`send`](Session::send). Transports produce concrete sessions; everything
//! above them works through the trait object.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use gatehub_proto::{ProtoError, Reply, Request};

use crate::metadata::Metadata;

/// Shared handle to a live session.
pub type SessionRef = Arc<dyn Session>;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer closed the connection cleanly
    #[error("end of stream")]
    Eof,

    /// The session was closed locally
    #[error("session closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An authenticated client connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Session id; equals the user id the authorizer produced.
    fn id(&self) -> String;

    /// Sets the id. Mutated once, at authorization.
    fn set_id(&self, id: String);

    /// Copy of the session metadata.
    fn metadata(&self) -> Metadata;

    fn set_metadata(&self, md: Metadata);

    /// Receives the next request into `req`.
    ///
    /// Ping frames are consumed internally: they refresh
    /// [`last_rw_time`](Session::last_rw_time) and never surface.
    async fn recv(&self, req: &mut Request) -> Result<(), SessionError>;

    /// Sends a reply to the client.
    async fn send(&self, reply: &Reply) -> Result<(), SessionError>;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    /// Instant of the last successful read or write (pings included).
    ///
    /// Measured on the tokio clock so eviction timing follows the runtime.
    fn last_rw_time(&self) -> Instant;

    /// Closes the session. Idempotent.
    async fn close(&self);
}

/// Read/write clock shared by session implementations.
#[derive(Debug)]
pub struct RwClock {
    inner: Mutex<Instant>,
}

impl RwClock {
    pub fn now() -> Self {
        Self {
            inner: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.inner.lock().expect("clock lock") = Instant::now();
    }

    pub fn get(&self) -> Instant {
        *self.inner.lock().expect("clock lock")
    }
}
