// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Raw connections and listeners handed to protocols.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use display_error_chain::ErrorChainExt;
use tern_config::{EndpointConfig, Network};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::status::{Code, Status};

pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

pub enum ConnKind {
    Stream(BoxedStream),
    WebSocket(Box<WebSocketStream<BoxedStream>>),
}

/// A connected transport, byte stream or WebSocket.
pub struct Conn {
    kind: ConnKind,
    local_addr: Option<String>,
    peer_addr: Option<String>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("websocket", &self.is_websocket())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Conn {
    pub fn from_stream(stream: impl IoStream) -> Self {
        Conn {
            kind: ConnKind::Stream(Box::new(stream)),
            local_addr: None,
            peer_addr: None,
        }
    }

    pub fn from_websocket(ws: WebSocketStream<BoxedStream>) -> Self {
        Conn {
            kind: ConnKind::WebSocket(Box::new(ws)),
            local_addr: None,
            peer_addr: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<String>, peer: Option<String>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    pub fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.kind, ConnKind::WebSocket(_))
    }

    pub fn into_kind(self) -> ConnKind {
        self.kind
    }

    /// Byte stream of the connection; WebSocket connections are rejected.
    pub fn into_stream(self, proto: &'static str) -> Result<BoxedStream, Status> {
        match self.kind {
            ConnKind::Stream(s) => Ok(s),
            ConnKind::WebSocket(_) => Err(Status::with_code(Code::WRONG_CONN).with_cause(
                format!("{} protocol needs a byte stream, got a websocket", proto),
            )),
        }
    }
}

pub(crate) fn io_dial_error(addr: &str, err: io::Error) -> Status {
    Status::dial_failed(format!("{}: {}", addr, err.chain()))
}

fn tcp_family_matches(network: Network, addr: &SocketAddr) -> bool {
    match network {
        Network::Tcp4 => addr.is_ipv4(),
        Network::Tcp6 => addr.is_ipv6(),
        _ => true,
    }
}

async fn connect_tcp(config: &EndpointConfig, addr: &str) -> Result<TcpStream, Status> {
    let local: Option<SocketAddr> = match config.local_addr() {
        Some(local) => Some(
            local
                .parse()
                .map_err(|e| Status::dial_failed(format!("invalid local address {}: {}", local, e)))?,
        ),
        None => None,
    };

    let candidates = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| io_dial_error(addr, e))?
        .filter(|a| tcp_family_matches(config.network, a));

    let mut last_err = None;
    for candidate in candidates {
        let socket = if candidate.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| io_dial_error(addr, e))?;

        if let Some(local) = local {
            socket.bind(local).map_err(|e| io_dial_error(addr, e))?;
        }

        match socket.connect(candidate).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                debug!(%candidate, error = %e.chain(), "connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => io_dial_error(addr, e),
        None => Status::dial_failed(format!(
            "{}: no {} address found",
            addr, config.network
        )),
    })
}

/// Open a byte stream to `addr` following the configured network, wrapping
/// it in TLS when a connector is given.
pub(crate) async fn dial_stream(
    config: &EndpointConfig,
    addr: &str,
    tls: Option<&(TlsConnector, ServerName<'static>)>,
) -> Result<Conn, Status> {
    if !config.network.is_supported() {
        return Err(Status::dial_failed(format!(
            "unsupported network: {}",
            config.network
        )));
    }

    let dial = async {
        match config.network {
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(addr)
                    .await
                    .map_err(|e| io_dial_error(addr, e))?;
                Ok::<_, Status>(
                    Conn::from_stream(stream).with_addrs(None, Some(format!("unix:{}", addr))),
                )
            }
            _ => {
                let stream = connect_tcp(config, addr).await?;
                let local = stream.local_addr().ok().map(|a| a.to_string());
                let peer = stream.peer_addr().ok().map(|a| a.to_string());
                let conn = match tls {
                    Some((connector, name)) => {
                        let tls_stream = connector
                            .connect(name.clone(), stream)
                            .await
                            .map_err(|e| io_dial_error(addr, e))?;
                        Conn::from_stream(tls_stream)
                    }
                    None => Conn::from_stream(stream),
                };
                Ok::<_, Status>(conn.with_addrs(local, peer))
            }
        }
    };

    tokio::time::timeout(config.dial_timeout, dial)
        .await
        .map_err(|_| Status::dial_failed(format!("{}: dial timeout", addr)))?
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, String),
}

impl Listener {
    pub async fn bind(config: &EndpointConfig) -> Result<Listener, Status> {
        match config.network {
            Network::Kcp | Network::Quic => Err(Status::with_code(Code::WRONG_CONN)
                .with_cause(format!("unsupported network: {}", config.network))),
            #[cfg(unix)]
            Network::Unix => {
                let path = config
                    .unix_path
                    .clone()
                    .ok_or_else(|| Status::with_code(Code::WRONG_CONN).with_cause("missing unix_path"))?;
                let listener = tokio::net::UnixListener::bind(&path)
                    .map_err(|e| Status::with_code(Code::WRONG_CONN).with_cause(e.to_string()))?;
                Ok(Listener::Unix(listener, path))
            }
            _ => {
                let addr = config.listen_addr();
                let listener = TcpListener::bind(&addr).await.map_err(|e| {
                    Status::with_code(Code::WRONG_CONN).with_cause(format!("{}: {}", addr, e))
                })?;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Listener::Unix(_, path) => path.clone(),
        }
    }

    pub async fn accept(&self) -> io::Result<Conn> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                let local = stream.local_addr().ok().map(|a| a.to_string());
                Ok(Conn::from_stream(stream).with_addrs(local, Some(peer.to_string())))
            }
            #[cfg(unix)]
            Listener::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                Ok(Conn::from_stream(stream).with_addrs(Some(path.clone()), None))
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Self {
        Listener::Tcp(l)
    }
}

/// Run the server side TLS handshake on a freshly accepted byte stream.
pub(crate) async fn accept_tls(acceptor: &TlsAcceptor, conn: Conn) -> Result<Conn, Status> {
    let local = conn.local_addr.clone();
    let peer = conn.peer_addr.clone();
    let stream = conn.into_stream("tls")?;
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Status::with_code(Code::WRONG_CONN).with_cause(format!("tls handshake: {}", e)))?;
    Ok(Conn::from_stream(tls_stream).with_addrs(local, peer))
}

pub(crate) fn tls_acceptor(config: &EndpointConfig) -> Result<Option<TlsAcceptor>, Status> {
    match &config.tls {
        Some(tls) if tls.has_server_identity() => {
            let server = tls
                .load_server_config()
                .map_err(|e| Status::internal(format!("tls server config: {}", e.chain())))?;
            Ok(Some(TlsAcceptor::from(server)))
        }
        _ => Ok(None),
    }
}

pub(crate) fn tls_connector(
    config: &EndpointConfig,
) -> Result<Option<(TlsConnector, ServerName<'static>)>, Status> {
    match &config.tls {
        Some(tls) if tls.ca_file.is_some() => {
            let client = tls
                .load_client_config()
                .map_err(|e| Status::internal(format!("tls client config: {}", e.chain())))?;
            let name = tls
                .server_name()
                .map_err(|e| Status::internal(e.to_string()))?;
            Ok(Some((TlsConnector::from(Arc::clone(&client)), name)))
        }
        _ => Ok(None),
    }
}
