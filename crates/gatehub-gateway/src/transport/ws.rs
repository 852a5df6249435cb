//! WebSocket transport.
//!
//! Each binary WebSocket message carries one wire frame (the same
//! length-prefixed shape the other transports use). Control pings count as
//! keepalives exactly like zero-length frames do.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::time::Instant;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, warn};

use gatehub_cluster::NodeEntry;
use gatehub_proto::codec::{decode_frame, encode_frame, from_payload, to_payload, Frame};
use gatehub_proto::{Reply, Request};

use super::{authorize, Authorizer, SessionHandler, Transport};
use crate::error::GatewayError;
use crate::metadata::Metadata;
use crate::session::{RwClock, Session, SessionError, SessionRef};

/// WebSocket gateway transport.
pub struct WsServer {
    listen_addr: String,
    authorizer: Authorizer,
    handler: Option<SessionHandler>,
    max_payload: usize,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: Option<JoinHandle<()>>,
}

impl WsServer {
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("ws lock")
    }
}

#[async_trait]
impl Transport for WsServer {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn complete_node_entry(&self, entry: &mut NodeEntry) {
        let addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.listen_addr.clone());
        entry.entrance = Some(format!("ws://{addr}"));
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
        *self.local_addr.lock().expect("ws lock") = listener.local_addr().ok();

        let authorizer = Arc::clone(&self.authorizer);
        let max_payload = self.max_payload;
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(error = %err, "ws accept");
                        continue;
                    }
                };

                let authorizer = Arc::clone(&authorizer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(err) => {
                            warn!(remote = %peer, error = %err, "ws handshake");
                            return;
                        }
                    };

                    let sess: SessionRef = WsSession::new(ws, peer, max_payload);
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

/// A session over one WebSocket connection.
pub struct WsSession {
    id: RwLock<String>,
    md: RwLock<Metadata>,
    reader: Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    writer: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    local_addr: String,
    remote_addr: String,
    last_rw: RwClock,
    max_payload: usize,
    closed: AtomicBool,
    close_notify: Notify,
}

impl WsSession {
    pub fn new(ws: WebSocketStream<TcpStream>, peer: SocketAddr, max_payload: usize) -> Arc<Self> {
        let local_addr = ws
            .get_ref()
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (writer, reader) = ws.split();
        Arc::new(Self {
            id: RwLock::new(ulid::Ulid::new().to_string()),
            md: RwLock::new(Metadata::new()),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr: peer.to_string(),
            last_rw: RwClock::now(),
            max_payload,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    async fn read_request(
        &self,
        reader: &mut SplitStream<WebSocketStream<TcpStream>>,
        req: &mut Request,
    ) -> Result<(), SessionError> {
        loop {
            let message = match reader.next().await {
                None => return Err(SessionError::Eof),
                Some(Err(err)) => return Err(SessionError::Protocol(err.to_string())),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Binary(buf) => match decode_frame(&buf, self.max_payload)? {
                    Frame::Ping => {
                        self.last_rw.touch();
                        continue;
                    }
                    Frame::Payload(payload) => {
                        *req = from_payload(&payload)?;
                        self.last_rw.touch();
                        return Ok(());
                    }
                },
                Message::Ping(_) | Message::Pong(_) => {
                    self.last_rw.touch();
                    continue;
                }
                Message::Close(_) => return Err(SessionError::Eof),
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected websocket message: {other:?}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Session for WsSession {
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

        let frame = encode_frame(&to_payload(reply)?);
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Binary(frame))
            .await
            .map_err(|err| SessionError::Protocol(err.to_string()))?;
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
        self.close_notify.notify_waiters();
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn ws_pair(
        max_payload: usize,
    ) -> (
        SessionRef,
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            WsSession::new(ws, peer, max_payload)
        });

        let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let sess: SessionRef = server.await.unwrap();
        (sess, client)
    }

    #[tokio::test]
    async fn test_binary_roundtrip() {
        let (sess, mut client) = ws_pair(64 * 1024).await;

        let req = Request {
            id: 9,
            service_code: 3,
            method: "Join".to_string(),
            ..Default::default()
        };
        client
            .send(Message::Binary(encode_frame(&to_payload(&req).unwrap())))
            .await
            .unwrap();

        let mut got = Request::default();
        sess.recv(&mut got).await.unwrap();
        assert_eq!(got, req);

        let reply = Reply {
            request_id: 9,
            from_service: 3,
            code: 0,
            data: vec![7],
        };
        sess.send(&reply).await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Binary(buf) => {
                let Frame::Payload(payload) = decode_frame(&buf, 64 * 1024).unwrap() else {
                    panic!("expected payload frame");
                };
                let got: Reply = from_payload(&payload).unwrap();
                assert_eq!(got, reply);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_message_touches_clock() {
        let (sess, mut client) = ws_pair(64 * 1024).await;
        let before = sess.last_rw_time();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.send(Message::Ping(vec![])).await.unwrap();

        let mut req = Request::default();
        let recv =
            tokio::time::timeout(std::time::Duration::from_millis(100), sess.recv(&mut req)).await;
        assert!(recv.is_err());
        assert!(sess.last_rw_time() > before);
    }

    #[tokio::test]
    async fn test_client_close_is_eof() {
        let (sess, mut client) = ws_pair(64 * 1024).await;
        client.close(None).await.unwrap();

        let mut req = Request::default();
        assert!(matches!(sess.recv(&mut req).await, Err(SessionError::Eof)));
    }
}
