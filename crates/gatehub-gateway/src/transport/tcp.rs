//! TCP transport.
//!
//! Plain length-prefixed frames over a TCP stream. One task per accepted
//! connection; the read half is owned by `recv`, the write half by `send`,
//! so a session can receive and reply concurrently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use gatehub_cluster::NodeEntry;
use gatehub_proto::codec::{from_payload, read_frame, to_payload, write_frame, Frame};
use gatehub_proto::{ProtoError, Reply, Request};

use super::{authorize, Authorizer, SessionHandler, Transport};
use crate::error::GatewayError;
use crate::metadata::Metadata;
use crate::session::{RwClock, Session, SessionError, SessionRef};

/// TCP gateway transport.
pub struct TcpServer {
    listen_addr: String,
    authorizer: Authorizer,
    handler: Option<SessionHandler>,
    max_payload: usize,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn new(listen_addr: impl Into<String>, authorizer: Authorizer, max_payload: usize) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            authorizer,
            handler: None,
            max_payload,
            local_addr: StdMutex::new(None),
            accept_task: None,
        }
    }

    /// Actual bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("tcp lock")
    }
}

#[async_trait]
impl Transport for TcpServer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn complete_node_entry(&self, entry: &mut NodeEntry) {
        let addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.listen_addr.clone());
        entry.entrance = Some(format!("tcp://{addr}"));
    }

    fn set_session_handler(&mut self, handler: SessionHandler) {
        self.handler = Some(handler);
    }

    async fn start(&mut self) -> Result<(), GatewayError> {
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| GatewayError::Transport("session handler not set".to_string()))?;

        let listener = TcpListener::bind(&self.listen_addr).await?;
        *self.local_addr.lock().expect("tcp lock") = listener.local_addr().ok();

        let authorizer = Arc::clone(&self.authorizer);
        let max_payload = self.max_payload;
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(error = %err, "tcp accept");
                        continue;
                    }
                };

                let authorizer = Arc::clone(&authorizer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let sess: SessionRef = TcpSession::new(stream, max_payload);
                    if !authorize(&authorizer, &sess).await {
                        warn!(remote = %peer, "deny by authorizer");
                        sess.close().await;
                        return;
                    }
                    handler(sess).await;
                });
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// A session over one TCP connection.
pub struct TcpSession {
    id: RwLock<String>,
    md: RwLock<Metadata>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: String,
    remote_addr: String,
    last_rw: RwClock,
    max_payload: usize,
    closed: AtomicBool,
    close_notify: Notify,
}

impl TcpSession {
    pub fn new(stream: TcpStream, max_payload: usize) -> Arc<Self> {
        let local_addr = stream
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (reader, writer) = stream.into_split();

        Arc::new(Self {
            id: RwLock::new(ulid::Ulid::new().to_string()),
            md: RwLock::new(Metadata::new()),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
            last_rw: RwClock::now(),
            max_payload,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    async fn read_request(&self, reader: &mut OwnedReadHalf, req: &mut Request) -> Result<(), SessionError> {
        loop {
            match read_frame(reader, self.max_payload).await {
                Ok(Frame::Ping) => {
                    self.last_rw.touch();
                    continue;
                }
                Ok(Frame::Payload(payload)) => {
                    *req = from_payload(&payload)?;
                    self.last_rw.touch();
                    return Ok(());
                }
                Err(ProtoError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(SessionError::Eof);
                }
                Err(ProtoError::PayloadTooLarge { size, max }) => {
                    return Err(SessionError::Protocol(format!(
                        "payload size exceeds the limit: {size} > {max}"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl Session for TcpSession {
    fn id(&self) -> String {
        self.id.read().expect("session lock").clone()
    }

    fn set_id(&self, id: String) {
        *self.id.write().expect("session lock") = id;
    }

    fn metadata(&self) -> Metadata {
        self.md.read().expect("session lock").clone()
    }

    fn set_metadata(&self, md: Metadata) {
        *self.md.write().expect("session lock") = md;
    }

    async fn recv(&self, req: &mut Request) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.close_notify.notified() => Err(SessionError::Closed),
            result = self.read_request(&mut reader, req) => result,
        }
    }

    async fn send(&self, reply: &Reply) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let payload = to_payload(reply)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload).await?;
        self.last_rw.touch();
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn last_rw_time(&self) -> Instant {
        self.last_rw.get()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake a blocked recv, then half-close towards the peer.
        self.close_notify.notify_waiters();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehub_proto::codec::{encode_frame, write_ping};
    use tokio::io::AsyncReadExt;

    async fn session_pair(max_payload: usize) -> (SessionRef, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let sess: SessionRef = TcpSession::new(server_stream, max_payload);
        (sess, client)
    }

    #[tokio::test]
    async fn test_recv_decodes_request() {
        let (sess, mut client) = session_pair(64 * 1024).await;

        let req = Request {
            id: 5,
            service_code: 7,
            method: "Echo".to_string(),
            ..Default::default()
        };
        let frame = encode_frame(&to_payload(&req).unwrap());
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let mut got = Request::default();
        sess.recv(&mut got).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn test_ping_updates_clock_without_reply() {
        let (sess, mut client) = session_pair(64 * 1024).await;
        let before = sess.last_rw_time();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        write_ping(&mut client).await.unwrap();

        // recv keeps waiting for a payload frame; run it against a timeout.
        let mut req = Request::default();
        let recv =
            tokio::time::timeout(std::time::Duration::from_millis(100), sess.recv(&mut req)).await;
        assert!(recv.is_err(), "ping must not surface as a request");
        assert!(sess.last_rw_time() > before);

        // And no reply came back.
        let mut buf = [0u8; 1];
        let read =
            tokio::time::timeout(std::time::Duration::from_millis(50), client.read(&mut buf)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (sess, mut client) = session_pair(128).await;

        let frame = encode_frame(&vec![0u8; 1024]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let mut req = Request::default();
        assert!(matches!(
            sess.recv(&mut req).await,
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_eof() {
        let (sess, client) = session_pair(64 * 1024).await;
        drop(client);

        let mut req = Request::default();
        assert!(matches!(sess.recv(&mut req).await, Err(SessionError::Eof)));
    }

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let (sess, _client) = session_pair(64 * 1024).await;

        let recv_sess = Arc::clone(&sess);
        let recv = tokio::spawn(async move {
            let mut req = Request::default();
            recv_sess.recv(&mut req).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sess.close().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), recv)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));

        // Idempotent.
        sess.close().await;
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (sess, mut client) = session_pair(64 * 1024).await;

        let reply = Reply {
            request_id: 5,
            from_service: 7,
            code: 0,
            data: vec![1, 2],
        };
        sess.send(&reply).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();

        let got: Reply = from_payload(&payload).unwrap();
        assert_eq!(got, reply);
    }
}
