//! Playground: the per-session request pipeline.
//!
//! The playground owns a session from connect to disconnect. The intake loop
//! receives pooled requests, runs them through the request interceptor
//! chain, and dispatches execution either onto the shared worker pool
//! (unordered) or onto the session's pipeline multiplexer (ordered). State
//! assignment events mutate the state table, multicast messages become
//! direct session sends, and a disconnected session's routing state survives
//! for a grace period in case it reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Code, Status};
use tracing::{debug, error, warn};
use ulid::Ulid;

use gatehub_bus::{Event, EventBus, MulticastBus};
use gatehub_cluster::{Allocation, Registry, ServiceDesc};
use gatehub_proto::codec::from_payload;
use gatehub_proto::{code, Pool, Reply, Request, RpcError, RpcStatus};

use crate::api::GatewayApi;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::hub::SessionHub;
use crate::metadata::{MD_GATEWAY_ID, MD_SESSION_ID, MD_TRANSACTION_ID};
use crate::pipeline::PipelineMux;
use crate::session::{SessionError, SessionRef};
use crate::state::StateTable;
use crate::worker::WorkerPool;

/// Multicast messages older than this are dropped instead of delivered.
const MULTICAST_STALE: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Terminal request handler: receives the session and the decoded request.
pub type RequestHandler = Arc<dyn Fn(SessionRef, Request) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook around request handling; call `next` to continue the chain.
pub type RequestInterceptor =
    Arc<dyn Fn(SessionRef, Request, RequestHandler) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook after a session authorizes; an error closes the connection.
pub type ConnectInterceptor =
    Arc<dyn Fn(SessionRef) -> BoxFuture<'static, Result<(), GatewayError>> + Send + Sync>;

/// Hook before a session's disconnect cleanup runs.
pub type DisconnectInterceptor = Arc<dyn Fn(SessionRef) -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner {
    node_id: Ulid,
    registry: Arc<Registry>,
    sessions: Arc<SessionHub>,
    state: Arc<StateTable>,
    pool: WorkerPool,
    requests: Arc<Pool<Request>>,
    clean_jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    event_bus: Option<Arc<dyn EventBus>>,
    multicast: Option<Arc<dyn MulticastBus>>,
    config: GatewayConfig,
    done: watch::Sender<bool>,
    request_interceptors: Vec<RequestInterceptor>,
    connect_interceptors: Vec<ConnectInterceptor>,
    disconnect_interceptors: Vec<DisconnectInterceptor>,
}

/// Client session runtime. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Playground {
    inner: Arc<Inner>,
}

/// Builder for [`Playground`].
pub struct PlaygroundBuilder {
    node_id: Ulid,
    registry: Arc<Registry>,
    config: GatewayConfig,
    event_bus: Option<Arc<dyn EventBus>>,
    multicast: Option<Arc<dyn MulticastBus>>,
    request_interceptors: Vec<RequestInterceptor>,
    connect_interceptors: Vec<ConnectInterceptor>,
    disconnect_interceptors: Vec<DisconnectInterceptor>,
}

impl PlaygroundBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn multicast(mut self, bus: Arc<dyn MulticastBus>) -> Self {
        self.multicast = Some(bus);
        self
    }

    /// Appends a request interceptor; interceptors run in registration order.
    pub fn request_interceptor(mut self, interceptor: RequestInterceptor) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    pub fn connect_interceptor(mut self, interceptor: ConnectInterceptor) -> Self {
        self.connect_interceptors.push(interceptor);
        self
    }

    pub fn disconnect_interceptor(mut self, interceptor: DisconnectInterceptor) -> Self {
        self.disconnect_interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Playground {
        let sessions = SessionHub::new(self.config.heartbeat_timeout);
        let (done, _) = watch::channel(false);

        let playground = Playground {
            inner: Arc::new(Inner {
                node_id: self.node_id,
                registry: self.registry,
                sessions,
                state: Arc::new(StateTable::new()),
                pool: WorkerPool::new(self.config.worker_pool_size),
                requests: Arc::new(Pool::new(self.config.object_pool_size)),
                clean_jobs: Mutex::new(HashMap::new()),
                event_bus: self.event_bus,
                multicast: self.multicast,
                config: self.config,
                done,
                request_interceptors: self.request_interceptors,
                connect_interceptors: self.connect_interceptors,
                disconnect_interceptors: self.disconnect_interceptors,
            }),
        };
        playground.subscribe_buses();
        playground
    }
}

impl Playground {
    pub fn builder(node_id: Ulid, registry: Arc<Registry>) -> PlaygroundBuilder {
        PlaygroundBuilder {
            node_id,
            registry,
            config: GatewayConfig::default(),
            event_bus: None,
            multicast: None,
            request_interceptors: Vec::new(),
            connect_interceptors: Vec::new(),
            disconnect_interceptors: Vec::new(),
        }
    }

    pub fn node_id(&self) -> Ulid {
        self.inner.node_id
    }

    pub fn sessions(&self) -> &Arc<SessionHub> {
        &self.inner.sessions
    }

    pub fn state(&self) -> &Arc<StateTable> {
        &self.inner.state
    }

    /// Management surface over the hub and state table.
    pub fn api(&self) -> GatewayApi {
        GatewayApi::new(
            Arc::clone(&self.inner.sessions),
            Arc::clone(&self.inner.state),
        )
    }

    /// Runs one session's lifecycle: connect, intake loop, disconnect.
    pub async fn handle(&self, sess: SessionRef) {
        if let Err(err) = self.on_connect(&sess).await {
            error!(
                session = %sess.id(),
                remote = %sess.remote_addr(),
                error = %err,
                "on connect"
            );
            sess.close().await;
            return;
        }
        self.inner.sessions.store(Arc::clone(&sess));

        let mux = PipelineMux::spawn(
            self.inner.config.pipeline_buffer,
            self.inner.config.pipeline_idle_timeout,
            self.inner.done.subscribe(),
        );

        let handler: RequestHandler = {
            let playground = self.clone();
            let mux = mux.clone();
            Arc::new(move |sess, req| {
                let playground = playground.clone();
                let mux = mux.clone();
                Box::pin(async move { playground.route(sess, req, mux).await })
            })
        };
        let chain = chain_request_interceptors(self.inner.request_interceptors.clone(), handler);

        let mut done = self.inner.done.subscribe();
        loop {
            if *done.borrow() {
                break;
            }

            let mut req = self.inner.requests.get();
            // Arm bodies only yield a value; `req` stays free for the match.
            let received = tokio::select! {
                _ = done.changed() => None,
                received = sess.recv(&mut req) => Some(received),
            };

            match received {
                None => {
                    self.inner.requests.put(req);
                    break;
                }
                Some(Ok(())) => chain(Arc::clone(&sess), req).await,
                Some(Err(SessionError::Eof)) | Some(Err(SessionError::Closed)) => {
                    self.inner.requests.put(req);
                    break;
                }
                Some(Err(err)) => {
                    self.inner.requests.put(req);
                    error!(
                        session = %sess.id(),
                        remote = %sess.remote_addr(),
                        error = %err,
                        "recv request"
                    );
                    break;
                }
            }
        }

        self.on_disconnect(sess).await;
    }

    /// Signals shutdown: pipeline workers drain, sessions are force-closed,
    /// pending cleanup timers are cancelled. In-flight dispatches complete;
    /// their replies may be dropped.
    pub async fn close(&self) {
        // send_replace updates the value even with no live subscribers, so a
        // session arriving after close still observes the shutdown flag.
        self.inner.done.send_replace(true);

        let jobs: Vec<JoinHandle<()>> = {
            let mut clean_jobs = self.inner.clean_jobs.lock().expect("playground lock");
            clean_jobs.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            job.abort();
        }

        self.inner.sessions.close().await;
    }

    async fn on_connect(&self, sess: &SessionRef) -> Result<(), GatewayError> {
        for interceptor in &self.inner.connect_interceptors {
            interceptor(Arc::clone(sess)).await?;
        }

        let mut md = sess.metadata();
        md.set(MD_SESSION_ID, sess.id());
        md.set(MD_GATEWAY_ID, self.inner.node_id.to_string());
        sess.set_metadata(md);

        // A reconnect cancels the cleanup left behind by the old connection.
        let pending = self
            .inner
            .clean_jobs
            .lock()
            .expect("playground lock")
            .remove(&sess.id());
        if let Some(job) = pending {
            job.abort();
        }

        if let Some(bus) = &self.inner.event_bus {
            bus.publish(Event::UserConnected {
                session_id: sess.id(),
                gateway_id: self.inner.node_id.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn on_disconnect(&self, sess: SessionRef) {
        for interceptor in &self.inner.disconnect_interceptors {
            interceptor(Arc::clone(&sess)).await;
        }

        self.inner.sessions.remove(&sess);

        if let Some(bus) = &self.inner.event_bus {
            if let Err(err) = bus
                .publish(Event::UserDisconnected {
                    session_id: sess.id(),
                    gateway_id: self.inner.node_id.to_string(),
                })
                .await
            {
                error!(session = %sess.id(), error = %err, "publish disconnect event");
            }
        }

        // Keep routing state for the grace period; a reconnect cancels this.
        let session_id = sess.id();
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.config.cleanup_delay;
        let job = tokio::spawn({
            let session_id = session_id.clone();
            async move {
                tokio::time::sleep(delay).await;
                if inner.sessions.load(&session_id).is_none() {
                    inner.state.clean_session(&session_id);
                }
                inner
                    .clean_jobs
                    .lock()
                    .expect("playground lock")
                    .remove(&session_id);
            }
        });
        let replaced = self
            .inner
            .clean_jobs
            .lock()
            .expect("playground lock")
            .insert(session_id, job);
        if let Some(old) = replaced {
            old.abort();
        }

        sess.close().await;
    }

    async fn route(&self, sess: SessionRef, req: Request, mux: PipelineMux) {
        let routed = match self.inner.registry.get_desc(req.service_code) {
            None => Err(Status::not_found(format!(
                "service {} not found",
                req.service_code
            ))),
            Some(desc) if !desc.public => {
                Err(Status::permission_denied("request private service"))
            }
            Some(desc) => Ok(desc),
        };

        let pipeline = routed
            .as_ref()
            .map(|desc| desc.pipeline.clone())
            .unwrap_or_default();
        let exec = self.build_exec(sess, req, routed);

        if pipeline.is_empty() {
            // Rejection on saturation is logged by the pool itself.
            self.inner.pool.try_submit(exec);
        } else if !mux.dispatch(pipeline, exec).await {
            debug!("pipeline multiplexer closed, request dropped");
        }
    }

    fn build_exec(
        &self,
        sess: SessionRef,
        req: Request,
        routed: Result<ServiceDesc, Status>,
    ) -> BoxFuture<'static, ()> {
        let playground = self.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = match &routed {
                Err(status) => Err(status.clone()),
                Ok(desc) => playground.do_request(&sess, &req, desc).await,
            };

            playground.log_request(&sess, &req, started, result.as_ref().err());
            if let Err(status) = result {
                playground.send_rpc_error(&sess, &req, status).await;
            }

            playground.inner.requests.put(req);
        })
    }

    async fn do_request(
        &self,
        sess: &SessionRef,
        req: &Request,
        desc: &ServiceDesc,
    ) -> Result<(), Status> {
        let (node_id, memoize) = self.pick_upstream(sess, req, desc)?;

        let mut md = sess.metadata();
        md.set(MD_TRANSACTION_ID, Ulid::new().to_string());

        let output = self
            .inner
            .registry
            .invoke(
                node_id,
                desc,
                &req.method,
                md.to_tonic(),
                Bytes::copy_from_slice(&req.data),
            )
            .await?;

        if memoize {
            self.inner.state.store(&sess.id(), desc.code, node_id);
        }

        if req.no_reply {
            return Ok(());
        }

        let mut reply: Reply = from_payload(&output)
            .map_err(|err| Status::internal(format!("unmarshal reply: {err}")))?;
        reply.request_id = req.id;
        reply.from_service = req.service_code;
        if let Err(err) = sess.send(&reply).await {
            // Send failures are local; the client is gone or going.
            debug!(session = %sess.id(), error = %err, "send reply");
        }
        Ok(())
    }

    /// Resolves the upstream node for a request.
    ///
    /// Stateless services go straight to the load balancer. Stateful
    /// services honor, in order: the client's node hint (client allocation
    /// only), the state table, and automatic allocation — the latter only
    /// under the `auto` policy. The returned flag says whether a successful
    /// call should memoize the mapping.
    fn pick_upstream(
        &self,
        sess: &SessionRef,
        req: &Request,
        desc: &ServiceDesc,
    ) -> Result<(Ulid, bool), Status> {
        if !desc.stateful {
            let node = self
                .inner
                .registry
                .alloc_node(desc.code, &sess.id())
                .map_err(|err| Status::unavailable(format!("pick grpc node: {err}")))?;
            return Ok((node, false));
        }

        if desc.allocation == Allocation::Client {
            if let Some(node) = req.node_id {
                return Ok((node, true));
            }
        }

        if let Some(node) = self.inner.state.find(&sess.id(), desc.code) {
            return Ok((node, false));
        }

        if desc.allocation != Allocation::Auto {
            return Err(Status::permission_denied("no node allocated"));
        }

        let node = self
            .inner
            .registry
            .alloc_node(desc.code, &sess.id())
            .map_err(|err| Status::unavailable(format!("pick grpc node: {err}")))?;
        Ok((node, true))
    }

    async fn send_rpc_error(&self, sess: &SessionRef, req: &Request, status: Status) {
        // Unknown errors carry no detail downstream: backend internals must
        // not leak to clients.
        let status = if status.code() == Code::Unknown {
            Status::new(Code::Unknown, "unknown error")
        } else {
            status
        };

        let body = RpcError {
            request_service: req.service_code,
            request_method: req.method.clone(),
            status: RpcStatus {
                code: status.code() as i32,
                message: status.message().to_string(),
            },
        };
        match Reply::with_payload(code::RPC_ERROR, &body) {
            Ok(mut reply) => {
                reply.request_id = req.id;
                if let Err(err) = sess.send(&reply).await {
                    debug!(session = %sess.id(), error = %err, "send rpc error reply");
                }
            }
            Err(err) => error!(error = %err, "encode rpc error reply"),
        }
    }

    fn log_request(
        &self,
        sess: &SessionRef,
        req: &Request,
        started: Instant,
        error: Option<&Status>,
    ) {
        match error {
            Some(status) => error!(
                req_id = req.id,
                session = %sess.id(),
                remote = %sess.remote_addr(),
                service = req.service_code,
                method = %req.method,
                node_hint = ?req.node_id,
                duration = ?started.elapsed(),
                error = %status,
                "handle request"
            ),
            None => debug!(
                req_id = req.id,
                session = %sess.id(),
                service = req.service_code,
                method = %req.method,
                duration = ?started.elapsed(),
                "handle request"
            ),
        }
    }

    fn subscribe_buses(&self) {
        // Stateful routing updates from the event bus.
        if let Some(bus) = &self.inner.event_bus {
            let mut events = bus.subscribe();
            let inner = Arc::clone(&self.inner);
            let mut done = self.inner.done.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.changed() => return,
                        event = events.recv() => match event {
                            Ok(Event::NodeAssign { session_id, service_code, node_id }) => {
                                // Only track sessions that live on this gateway.
                                if inner.sessions.load(&session_id).is_some() {
                                    inner.state.store(&session_id, service_code, node_id);
                                }
                            }
                            Ok(Event::NodeUnassign { session_id, service_code }) => {
                                inner.state.remove(&session_id, service_code);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "event bus subscriber lagged");
                            }
                            Err(_) => return,
                        }
                    }
                }
            });
        }

        // Server-initiated downstream messages.
        if let Some(bus) = &self.inner.multicast {
            let mut messages = bus.subscribe();
            let inner = Arc::clone(&self.inner);
            let mut done = self.inner.done.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.changed() => return,
                        message = messages.recv() => match message {
                            Ok(message) => {
                                let age = SystemTime::now()
                                    .duration_since(message.time)
                                    .unwrap_or_default();
                                if age > MULTICAST_STALE {
                                    debug!("dropping stale multicast");
                                    continue;
                                }

                                for session_id in &message.receiver {
                                    let Some(sess) = inner.sessions.load(session_id) else {
                                        continue;
                                    };
                                    let content = message.content.clone();
                                    inner.pool.try_submit(async move {
                                        if let Err(err) = sess.send(&content).await {
                                            debug!(error = %err, "send multicast");
                                        }
                                    });
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "multicast subscriber lagged");
                            }
                            Err(_) => return,
                        }
                    }
                }
            });
        }

        // A node leaving the cluster invalidates every mapping onto it.
        let state = Arc::clone(&self.inner.state);
        self.inner
            .registry
            .subscribe_delete(move |entry| state.clean_node(entry.id));
    }
}

fn chain_request_interceptors(
    interceptors: Vec<RequestInterceptor>,
    handler: RequestHandler,
) -> RequestHandler {
    interceptors
        .into_iter()
        .rev()
        .fold(handler, |next, interceptor| {
            Arc::new(move |sess, req| interceptor(sess, req, Arc::clone(&next)))
        })
}
