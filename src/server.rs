//! The acceptor: listens, screens, and launches one task per flow.

use crate::ca::CertificateStore;
use crate::connection::ConnectionFlow;
use crate::connector::{Connector, TlsVersion};
use crate::errors::{Error, ProxyCode, Result};
use crate::interceptor::InterceptorHandler;
use crate::services::{run_flow, ServiceContext};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Configuration for the proxy engine.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Directory holding the root certificate and key
  pub ca_storage_path: PathBuf,
  /// Upper bound on a parsed HTTP body
  pub max_body_size: usize,
  /// Upper bound on a reassembled WebSocket message
  pub max_ws_message_size: usize,
  /// Timeout for upstream TCP connects
  pub connect_timeout: Option<Duration>,
  /// `TCP_NODELAY` on upstream sockets
  pub nodelay: bool,
  /// `SO_KEEPALIVE` on upstream sockets
  pub keepalive: bool,
  /// Minimum TLS version offered on the upstream leg
  pub min_tls_version: Option<TlsVersion>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".snare"),
      max_body_size: 16 * 1024 * 1024,
      max_ws_message_size: 16 * 1024 * 1024,
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      min_tls_version: None,
    }
  }
}

/// The intercepting proxy server.
pub struct ProxyServer {
  config: Arc<ProxyConfig>,
  store: Arc<CertificateStore>,
  interceptors: Arc<RwLock<InterceptorHandler>>,
}

impl ProxyServer {
  /// Creates a server, loading or generating the CA under the configured
  /// storage directory.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let store = Arc::new(CertificateStore::new(&config.ca_storage_path).await?);
    Ok(Self {
      config: Arc::new(config),
      store,
      interceptors: Arc::new(RwLock::new(InterceptorHandler::new())),
    })
  }

  /// The interceptor chain; add hooks before calling
  /// [`run`](Self::run).
  pub fn interceptor_handler(&self) -> Arc<RwLock<InterceptorHandler>> {
    self.interceptors.clone()
  }

  /// The root certificate in PEM form, for client trust stores.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.store.ca_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.store.ca_cert_path()
  }

  /// Binds `addr` and serves until the task is dropped.
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = Self::listener(addr).await?;
    self.serve(listener).await
  }

  /// Builds the accept socket. An IPv6 address listens dual-stack where
  /// the platform allows it.
  pub async fn listener(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse().map_err(|_| ProxyCode::InvalidOption)?;
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
      .map_err(|_| Error::from(ProxyCode::AcceptorError))?;
    if addr.is_ipv6() {
      socket.set_only_v6(false).map_err(|error| {
        tracing::error!("dual-stack setup failed: {}", error);
        Error::from(ProxyCode::Ipv6Error)
      })?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
      .bind(&addr.into())
      .map_err(|_| Error::from(ProxyCode::AcceptorError))?;
    socket
      .listen(1024)
      .map_err(|_| Error::from(ProxyCode::AcceptorError))?;
    TcpListener::from_std(socket.into()).map_err(|_| ProxyCode::AcceptorError.into())
  }

  /// Serves an already-bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let own_addr = listener.local_addr().ok();
    tracing::info!(addr = ?own_addr, "proxy listening");
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          if own_addr == Some(peer) {
            tracing::warn!(%peer, "{}", Error::from(ProxyCode::SelfConnect));
            continue;
          }
          let ctx = ServiceContext {
            config: self.config.clone(),
            store: self.store.clone(),
            interceptors: self.interceptors.clone(),
            connector: Connector::new(
              self.config.connect_timeout,
              self.config.nodelay,
              self.config.keepalive,
            ),
            own_addr,
          };
          let flow = ConnectionFlow::new(stream, peer);
          tokio::spawn(run_flow(flow, ctx));
        }
        Err(error) => {
          tracing::error!("accept failed: {}", error);
        }
      }
    }
  }
}
