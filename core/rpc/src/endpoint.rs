// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The endpoint owns sessions, router, plugins and configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use display_error_chain::ErrorChainExt;
use futures::FutureExt;
use parking_lot::RwLock;
use tern_config::EndpointConfig;
use tern_config::component::configuration::Configuration;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::Codec;
use crate::message::MessagePool;
use crate::plugin::{Plugin, PluginContainer};
use crate::proto::{ProtoFunc, raw_proto_func, websocket_proto_func};
use crate::router::Router;
use crate::session::{Redialer, Session};
use crate::status::{Code, Status};
use crate::tfilter::FilterRegistry;
use crate::transport::{self, BoxedStream, Conn, Listener};

const POOL_CAPACITY: usize = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct EndpointInner {
    pub(crate) config: EndpointConfig,
    pub(crate) default_codec: Codec,
    pub(crate) plugins: Arc<PluginContainer>,
    pub(crate) router: Router,
    pub(crate) filters: Arc<FilterRegistry>,
    pub(crate) pool: MessagePool,
    proto_func: ProtoFunc,
    sessions: RwLock<HashMap<String, Session>>,
    session_counter: AtomicU64,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<(TlsConnector, ServerName<'static>)>,

    /// Drain signal to stop accept loops and session tasks
    drain_signal: RwLock<Option<drain::Signal>>,

    /// Drain watch handed to every task the endpoint spawns
    drain_watch: RwLock<Option<drain::Watch>>,

    cancel: CancellationToken,
}

impl EndpointInner {
    fn get_drain_watch(&self) -> Result<drain::Watch, Status> {
        self.drain_watch
            .read()
            .clone()
            .ok_or_else(|| Status::conn_closed("endpoint closed"))
    }

    /// Index `session` under a unique id derived from its peer address.
    fn register_session(&self, session: &Session) {
        let mut sessions = self.sessions.write();
        let base = session.id();
        let mut id = if base.is_empty() {
            format!("session#{}", self.session_counter.fetch_add(1, Ordering::Relaxed))
        } else {
            base.clone()
        };
        while sessions.contains_key(&id) {
            id = format!("{}#{}", base, self.session_counter.fetch_add(1, Ordering::Relaxed));
        }
        session.set_id_unindexed(id.clone());
        sessions.insert(id, session.clone());
    }

    pub(crate) fn rename_session(&self, old: &str, session: &Session) {
        let mut sessions = self.sessions.write();
        if sessions.get(old).is_some_and(|s| s.ptr_eq(session)) {
            sessions.remove(old);
        }
        if let Some(replaced) = sessions.insert(session.id(), session.clone()) {
            if !replaced.ptr_eq(session) {
                warn!(id = %session.id(), "session id reused, previous session is no longer indexed");
            }
        }
    }

    pub(crate) fn remove_session(&self, session: &Session) {
        let id = session.id();
        let mut sessions = self.sessions.write();
        if sessions.get(&id).is_some_and(|s| s.ptr_eq(session)) {
            sessions.remove(&id);
        }
    }
}

/// Builds an [`Endpoint`] from its configuration and injected parts.
pub struct EndpointBuilder {
    config: EndpointConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    filters: Option<FilterRegistry>,
    proto_func: Option<ProtoFunc>,
}

impl EndpointBuilder {
    pub fn new(config: EndpointConfig) -> Self {
        EndpointBuilder {
            config,
            plugins: Vec::new(),
            filters: None,
            proto_func: None,
        }
    }

    /// Append a plugin to the endpoint container.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Filters available to messages; gzip only when not set.
    pub fn filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Protocol for dialed and accepted connections; binary when not set.
    pub fn proto_func(mut self, proto_func: ProtoFunc) -> Self {
        self.proto_func = Some(proto_func);
        self
    }

    pub fn build(self) -> Result<Endpoint, Status> {
        self.config
            .validate()
            .map_err(|e| Status::internal(format!("invalid endpoint config: {}", e.chain())))?;

        let default_codec = Codec::from_name(&self.config.default_body_codec).ok_or_else(|| {
            Status::with_code(Code::UNSUPPORTED_CODEC_TYPE)
                .with_cause(self.config.default_body_codec.clone())
        })?;

        let mut container = PluginContainer::new();
        for plugin in self.plugins {
            container.append_right(plugin)?;
        }
        let plugins = Arc::new(container);

        let filters = match self.filters {
            Some(filters) => Arc::new(filters),
            None => FilterRegistry::shared_default(),
        };

        let tls_acceptor = transport::tls_acceptor(&self.config)?;
        let tls_connector = transport::tls_connector(&self.config)?;
        let pool = MessagePool::new(filters.clone(), self.config.max_message_size, POOL_CAPACITY);
        let (signal, watch) = drain::channel();

        let endpoint = Endpoint {
            inner: Arc::new(EndpointInner {
                default_codec,
                router: Router::new(plugins.clone()),
                plugins,
                filters,
                pool,
                proto_func: self.proto_func.unwrap_or_else(raw_proto_func),
                sessions: RwLock::new(HashMap::new()),
                session_counter: AtomicU64::new(1),
                tls_acceptor,
                tls_connector,
                drain_signal: RwLock::new(Some(signal)),
                drain_watch: RwLock::new(Some(watch)),
                cancel: CancellationToken::new(),
                config: self.config,
            }),
        };

        endpoint.inner.plugins.after_new_endpoint(&endpoint)?;
        debug!(plugins = ?endpoint.inner.plugins.names(), "endpoint created");
        Ok(endpoint)
    }
}

/// Client and server role in one object. Clones share the endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("network", &self.inner.config.network)
            .field("sessions", &self.count_session())
            .field("plugins", &self.inner.plugins.names())
            .finish()
    }
}

impl Endpoint {
    pub fn builder(config: EndpointConfig) -> EndpointBuilder {
        EndpointBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<EndpointInner>) -> Self {
        Endpoint { inner }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn plugins(&self) -> &Arc<PluginContainer> {
        &self.inner.plugins
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.inner.filters
    }

    pub fn default_body_codec(&self) -> Codec {
        self.inner.default_codec
    }

    /// Cancelled once the endpoint starts closing.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.drain_watch.read().is_none()
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Visit sessions until `f` returns false.
    pub fn range_session(&self, mut f: impl FnMut(&Session) -> bool) {
        let sessions: Vec<Session> = self.inner.sessions.read().values().cloned().collect();
        for session in &sessions {
            if !f(session) {
                break;
            }
        }
    }

    pub fn count_session(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Dial `addr` with the endpoint protocol.
    pub async fn dial(&self, addr: &str) -> Result<Session, Status> {
        self.dial_with(addr, self.inner.proto_func.clone()).await
    }

    /// Dial `addr` with a specific protocol.
    pub async fn dial_with(&self, addr: &str, proto_func: ProtoFunc) -> Result<Session, Status> {
        self.inner.get_drain_watch()?;
        let inner = &self.inner;
        let conn = transport::dial_stream(&inner.config, addr, inner.tls_connector.as_ref()).await?;

        let redialer = if inner.config.redial_enabled() {
            let weak = Arc::downgrade(&self.inner);
            let addr = addr.to_string();
            Some(Arc::new(move || {
                let weak = weak.clone();
                let addr = addr.clone();
                async move {
                    let inner = upgrade(&weak)?;
                    transport::dial_stream(&inner.config, &addr, inner.tls_connector.as_ref()).await
                }
                .boxed()
            }) as Redialer)
        } else {
            None
        };

        self.establish(conn, proto_func, redialer, true).await
    }

    /// Dial a `ws://` or `wss://` url, bridging the endpoint protocol.
    pub async fn dial_websocket(&self, url: &str) -> Result<Session, Status> {
        self.inner.get_drain_watch()?;
        let proto_func = websocket_proto_func(self.inner.proto_func.clone());
        let conn = dial_ws(&self.inner, url).await?;

        let redialer = if self.inner.config.redial_enabled() {
            let weak = Arc::downgrade(&self.inner);
            let url = url.to_string();
            Some(Arc::new(move || {
                let weak = weak.clone();
                let url = url.clone();
                async move {
                    let inner = upgrade(&weak)?;
                    dial_ws(&inner, &url).await
                }
                .boxed()
            }) as Redialer)
        } else {
            None
        };

        self.establish(conn, proto_func, redialer, true).await
    }

    /// Bind the configured listener and serve it in the background.
    /// Returns the bound address.
    pub async fn listen(&self) -> Result<String, Status> {
        self.spawn_listener(false).await
    }

    /// Like [`Endpoint::listen`], accepting WebSocket upgrades.
    pub async fn listen_websocket(&self) -> Result<String, Status> {
        self.spawn_listener(true).await
    }

    async fn spawn_listener(&self, websocket: bool) -> Result<String, Status> {
        let watch = self.inner.get_drain_watch()?;
        let listener = Listener::bind(&self.inner.config).await?;
        let addr = listener.local_addr();
        self.inner.plugins.after_listen(&addr).await?;

        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.accept_loop(listener, websocket, watch).await });
        Ok(addr)
    }

    /// Bind the configured listener and serve it until the endpoint closes.
    pub async fn listen_and_serve(&self) -> Result<(), Status> {
        let listener = Listener::bind(&self.inner.config).await?;
        self.serve_listener(listener).await
    }

    /// Serve an already opened listener until the endpoint closes.
    pub async fn serve_listener(&self, listener: Listener) -> Result<(), Status> {
        let watch = self.inner.get_drain_watch()?;
        self.inner.plugins.after_listen(&listener.local_addr()).await?;
        self.accept_loop(listener, false, watch).await;
        Ok(())
    }

    async fn accept_loop(&self, listener: Listener, websocket: bool, watch: drain::Watch) {
        let addr = listener.local_addr();
        info!(%addr, websocket, "listening");
        let mut shutdown = std::pin::pin!(watch.signaled());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(%addr, "listener stopped");
                    break;
                }
                res = listener.accept() => match res {
                    Ok(conn) => {
                        let endpoint = self.clone();
                        tokio::spawn(async move {
                            let peer = conn.peer_addr().map(String::from);
                            if let Err(st) = endpoint.accept_conn(conn, websocket).await {
                                debug!(?peer, error = %st, "connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(%addr, error = %e.chain(), "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn accept_conn(&self, conn: Conn, websocket: bool) -> Result<Session, Status> {
        let conn = match &self.inner.tls_acceptor {
            Some(acceptor) => transport::accept_tls(acceptor, conn).await?,
            None => conn,
        };
        let conn = if websocket {
            let local = conn.local_addr().map(String::from);
            let peer = conn.peer_addr().map(String::from);
            let stream = conn.into_stream("websocket")?;
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|e| {
                    Status::with_code(Code::WRONG_CONN)
                        .with_cause(format!("websocket handshake: {}", e))
                })?;
            Conn::from_websocket(ws).with_addrs(local, peer)
        } else {
            conn
        };
        self.serve_conn(conn).await
    }

    /// Serve one already established connection as an accepted session.
    pub async fn serve_conn(&self, conn: Conn) -> Result<Session, Status> {
        let proto_func = if conn.is_websocket() {
            websocket_proto_func(self.inner.proto_func.clone())
        } else {
            self.inner.proto_func.clone()
        };
        self.establish(conn, proto_func, None, false).await
    }

    async fn establish(
        &self,
        conn: Conn,
        proto_func: ProtoFunc,
        redialer: Option<Redialer>,
        dialed: bool,
    ) -> Result<Session, Status> {
        let watch = self.inner.get_drain_watch()?;
        let session = Session::new(self.inner.clone(), proto_func, conn, redialer)?;
        self.inner.register_session(&session);

        let handshake = if dialed {
            self.inner.plugins.after_dial(&session, false).await
        } else {
            self.inner.plugins.after_accept(&session).await
        };
        if let Err(st) = handshake {
            debug!(session = %session.id(), error = %st, "handshake failed");
            session.close().await;
            return Err(st);
        }

        session.activate(watch);
        debug!(session = %session.id(), dialed, "session active");
        Ok(session)
    }

    /// Run the close hooks, close every session and wait for the
    /// endpoint tasks to stop.
    pub async fn close(&self) -> Result<(), Status> {
        let signal = self
            .inner
            .drain_signal
            .write()
            .take()
            .ok_or_else(|| Status::conn_closed("endpoint already closed"))?;
        self.inner.drain_watch.write().take();

        if let Err(st) = self.inner.plugins.before_close_endpoint(self).await {
            warn!(error = %st, "close hook failed");
        }
        self.inner.cancel.cancel();

        let sessions: Vec<Session> = self.inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }

        tokio::time::timeout(DRAIN_TIMEOUT, signal.drain())
            .await
            .map_err(|_| Status::internal("timeout waiting for endpoint tasks to stop"))?;
        info!("endpoint closed");
        Ok(())
    }
}

fn upgrade(weak: &Weak<EndpointInner>) -> Result<Arc<EndpointInner>, Status> {
    weak.upgrade()
        .ok_or_else(|| Status::dial_failed("endpoint dropped"))
}

/// Open a WebSocket client connection to `url`.
async fn dial_ws(inner: &EndpointInner, url: &str) -> Result<Conn, Status> {
    let parsed = Url::parse(url).map_err(|e| Status::dial_failed(format!("{}: {}", url, e)))?;
    let secure = match parsed.scheme() {
        "ws" => false,
        "wss" => true,
        other => {
            return Err(Status::dial_failed(format!("unsupported websocket scheme {}", other)));
        }
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| Status::dial_failed(format!("{}: missing host", url)))?;
    let port = parsed.port_or_known_default().unwrap_or(80);
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let tls = if secure {
        let connector = inner
            .tls_connector
            .as_ref()
            .ok_or_else(|| Status::dial_failed("wss needs a tls configuration with ca_file"))?;
        Some(connector)
    } else {
        None
    };

    let conn = transport::dial_stream(&inner.config, &addr, tls).await?;
    let local = conn.local_addr().map(String::from);
    let peer = conn.peer_addr().map(String::from);
    let stream: BoxedStream = conn.into_stream("websocket")?;

    let handshake = tokio_tungstenite::client_async(url, stream);
    let (ws, _) = tokio::time::timeout(inner.config.dial_timeout, handshake)
        .await
        .map_err(|_| Status::dial_failed(format!("{}: websocket handshake timeout", url)))?
        .map_err(|e| Status::dial_failed(format!("{}: {}", url, e)))?;
    Ok(Conn::from_websocket(ws).with_addrs(local, peer))
}
