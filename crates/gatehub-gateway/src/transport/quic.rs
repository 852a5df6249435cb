//! QUIC transport.
//!
//! Clients multiplex several bidirectional streams over one connection.
//! Every stream carries the same length-prefixed frames; inbound requests
//! from all streams fan into one queue, and replies are spread across
//! streams by `service_code % stream_count` so one service's replies always
//! travel the same stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::time::Instant;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, RecvStream, SendStream, StreamId};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gatehub_cluster::NodeEntry;
use gatehub_proto::codec::{from_payload, read_frame, to_payload, write_frame, Frame};
use gatehub_proto::{Reply, Request};

use super::{authorize, Authorizer, SessionHandler, Transport};
use crate::error::GatewayError;
use crate::metadata::Metadata;
use crate::session::{RwClock, Session, SessionError, SessionRef};

/// QUIC gateway transport.
///
/// Serves a self-signed certificate; deployments that need a real one
/// terminate TLS ahead of the gateway or swap the server config.
pub struct QuicServer {
    listen_addr: String,
    authorizer: Authorizer,
    handler: Option<SessionHandler>,
    max_payload: usize,
    endpoint: StdMutex<Option<Endpoint>>,
    accept_task: Option<JoinHandle<()>>,
}

impl QuicServer {
    pub fn new(listen_addr: impl Into<String>, authorizer: Authorizer, max_payload: usize) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            authorizer,
            handler: None,
            max_payload,
            endpoint: StdMutex::new(None),
            accept_task: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .expect("quic lock")
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }
}

#[async_trait]
impl Transport for QuicServer {
    fn name(&self) -> &'static str {
        "quic"
    }

    fn complete_node_entry(&self, entry: &mut NodeEntry) {
        let addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.listen_addr.clone());
        entry.entrance = Some(format!("quic://{addr}"));
    }

    fn set_session_handler(&mut self, handler: SessionHandler) {
        self.handler = Some(handler);
    }

    async fn start(&mut self) -> Result<(), GatewayError> {
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| GatewayError::Transport("session handler not set".to_string()))?;

        // Install the process-wide crypto provider once; later calls no-op.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert = rcgen::generate_simple_self_signed(vec!["gatehub".to_string()])
            .map_err(|err| GatewayError::Transport(format!("generate certificate: {err}")))?;
        let cert_der = rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec());
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|err| GatewayError::Transport(format!("build server config: {err}")))?;
        let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|err| GatewayError::Transport(format!("build quic config: {err}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));

        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|err| GatewayError::Transport(format!("parse listen addr: {err}")))?;
        let endpoint = Endpoint::server(server_config, addr)?;
        *self.endpoint.lock().expect("quic lock") = Some(endpoint.clone());

        let authorizer = Arc::clone(&self.authorizer);
        let max_payload = self.max_payload;
        self.accept_task = Some(tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let authorizer = Arc::clone(&authorizer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "quic handshake");
                            return;
                        }
                    };
                    let remote = conn.remote_address();

                    let sess: SessionRef = QuicSession::new(conn, max_payload);
                    if !authorize(&authorizer, &sess).await {
                        warn!(remote = %remote, "deny by authorizer");
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
        if let Some(endpoint) = self.endpoint.lock().expect("quic lock").take() {
            endpoint.close(0u32.into(), b"");
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// A session over one QUIC connection and its streams.
pub struct QuicSession {
    id: RwLock<String>,
    md: RwLock<Metadata>,
    conn: Connection,
    streams: StdMutex<Vec<(StreamId, Arc<Mutex<SendStream>>)>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    last_rw: RwClock,
    max_payload: usize,
    closed: AtomicBool,
    close_notify: Notify,
}

impl QuicSession {
    pub fn new(conn: Connection, max_payload: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let sess = Arc::new(Self {
            id: RwLock::new(ulid::Ulid::new().to_string()),
            md: RwLock::new(Metadata::new()),
            conn,
            streams: StdMutex::new(Vec::new()),
            inbound: Mutex::new(inbound_rx),
            last_rw: RwClock::now(),
            max_payload,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        tokio::spawn(Self::accept_streams(Arc::clone(&sess), inbound_tx));
        sess
    }

    async fn accept_streams(sess: Arc<QuicSession>, inbound: mpsc::Sender<Vec<u8>>) {
        loop {
            let (send, recv) = match sess.conn.accept_bi().await {
                Ok(streams) => streams,
                Err(err) => {
                    debug!(error = %err, "quic accept stream");
                    sess.close().await;
                    return;
                }
            };

            let stream_id = send.id();
            sess.streams
                .lock()
                .expect("quic session lock")
                .push((stream_id, Arc::new(Mutex::new(send))));

            tokio::spawn(Self::read_stream(
                Arc::clone(&sess),
                inbound.clone(),
                stream_id,
                recv,
            ));
        }
    }

    async fn read_stream(
        sess: Arc<QuicSession>,
        inbound: mpsc::Sender<Vec<u8>>,
        stream_id: StreamId,
        mut recv: RecvStream,
    ) {
        loop {
            match read_frame(&mut recv, sess.max_payload).await {
                Ok(Frame::Ping) => sess.last_rw.touch(),
                Ok(Frame::Payload(payload)) => {
                    sess.last_rw.touch();
                    if inbound.send(payload).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    if !sess.closed.load(Ordering::SeqCst) {
                        debug!(error = %err, remote = %sess.remote_addr(), "quic stream read");
                    }

                    let drained = {
                        let mut streams = sess.streams.lock().expect("quic session lock");
                        streams.retain(|(id, _)| *id != stream_id);
                        streams.is_empty()
                    };
                    // All streams gone: the connection is done.
                    if drained {
                        sess.close().await;
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Session for QuicSession {
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

        let mut inbound = self.inbound.lock().await;
        let payload = tokio::select! {
            _ = self.close_notify.notified() => return Err(SessionError::Closed),
            payload = inbound.recv() => payload,
        };
        match payload {
            None => Err(SessionError::Eof),
            Some(payload) => {
                *req = from_payload(&payload)?;
                Ok(())
            }
        }
    }

    async fn send(&self, reply: &Reply) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        // Same service, same stream: replies keep per-service stream affinity.
        let stream = {
            let streams = self.streams.lock().expect("quic session lock");
            match streams.len() {
                0 => return Err(SessionError::Protocol("no available stream".to_string())),
                1 => Arc::clone(&streams[0].1),
                n => Arc::clone(&streams[reply.from_service.unsigned_abs() as usize % n].1),
            }
        };

        let payload = to_payload(reply)?;
        let mut send = stream.lock().await;
        write_frame(&mut *send, &payload).await?;
        self.last_rw.touch();
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.conn
            .local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }

    fn remote_addr(&self) -> String {
        self.conn.remote_address().to_string()
    }

    fn last_rw_time(&self) -> Instant {
        self.last_rw.get()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        self.conn.close(0u32.into(), b"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    // Certificate verification is skipped in tests; the server generates a
    // fresh self-signed certificate per start.
    #[derive(Debug)]
    struct SkipServerVerification;

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self)
        }
    }

    impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }

    fn client_endpoint() -> Endpoint {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut endpoint = Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth();
        let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap();
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_config)));
        endpoint
    }

    #[tokio::test]
    async fn test_quic_request_reply_over_stream() {
        let (sess_tx, sess_rx) = oneshot::channel::<SessionRef>();
        let sess_tx = StdMutex::new(Some(sess_tx));
        let handler: SessionHandler = Arc::new(move |sess| {
            if let Some(tx) = sess_tx.lock().unwrap().take() {
                let _ = tx.send(sess);
            }
            Box::pin(async {})
        });

        let mut server = QuicServer::new(
            "127.0.0.1:0",
            super::super::anonymous_authorizer(),
            64 * 1024,
        );
        server.set_session_handler(handler);
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let endpoint = client_endpoint();
        let conn = endpoint
            .connect(addr, "gatehub")
            .unwrap()
            .await
            .unwrap();
        let (mut send, mut recv) = conn.open_bi().await.unwrap();

        // The server only learns about the stream once data flows.
        let req = Request {
            id: 4,
            service_code: 12,
            method: "Act".to_string(),
            ..Default::default()
        };
        write_frame(&mut send, &to_payload(&req).unwrap()).await.unwrap();

        let sess = sess_rx.await.unwrap();
        let mut got = Request::default();
        sess.recv(&mut got).await.unwrap();
        assert_eq!(got, req);

        let reply = Reply {
            request_id: 4,
            from_service: 12,
            code: 0,
            data: vec![1],
        };
        sess.send(&reply).await.unwrap();

        match read_frame(&mut recv, 64 * 1024).await.unwrap() {
            Frame::Payload(payload) => {
                let got: Reply = from_payload(&payload).unwrap();
                assert_eq!(got, reply);
            }
            Frame::Ping => panic!("expected payload frame"),
        }

        sess.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_without_streams_fails() {
        let (sess_tx, sess_rx) = oneshot::channel::<SessionRef>();
        let sess_tx = StdMutex::new(Some(sess_tx));
        let handler: SessionHandler = Arc::new(move |sess| {
            if let Some(tx) = sess_tx.lock().unwrap().take() {
                let _ = tx.send(sess);
            }
            Box::pin(async {})
        });

        let mut server = QuicServer::new(
            "127.0.0.1:0",
            super::super::anonymous_authorizer(),
            64 * 1024,
        );
        server.set_session_handler(handler);
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let endpoint = client_endpoint();
        let _conn = endpoint
            .connect(addr, "gatehub")
            .unwrap()
            .await
            .unwrap();

        let sess = sess_rx.await.unwrap();
        assert!(matches!(
            sess.send(&Reply::default()).await,
            Err(SessionError::Protocol(_))
        ));

        sess.close().await;
        server.stop().await;
    }
}
