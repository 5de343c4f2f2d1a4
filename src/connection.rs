//! The connection pair: one client half, one server half, owned together.
//!
//! A [`ConnectionFlow`] exists for exactly one client session. Each half is
//! a TCP stream that may be upgraded to TLS in place; the client half is
//! the TLS server role, the server half the TLS client role. Services
//! borrow the flow for the duration of their state and hand it back whole.

use crate::connector::Connector;
use crate::errors::{ProxyCode, Result, TlsCode};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A stream that replays buffered bytes before reading from its inner
/// stream. Lets the TLS acceptor see ClientHello bytes the proxy already
/// consumed for inspection.
#[derive(Debug)]
pub struct Rewind<S> {
  prefix: Option<Bytes>,
  inner: S,
}

impl<S> Rewind<S> {
  pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
    let prefix = if prefix.is_empty() {
      None
    } else {
      Some(prefix)
    };
    Rewind { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if let Some(mut prefix) = this.prefix.take() {
      let take = prefix.len().min(buf.remaining());
      buf.put_slice(&prefix.split_to(take));
      if !prefix.is_empty() {
        this.prefix = Some(prefix);
      }
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// The client half's transport: plain TCP, intercepted TLS, or closed.
#[derive(Debug)]
pub enum ClientStream {
  /// Accepted socket before any TLS
  Tcp(TcpStream),
  /// After the downstream handshake with a minted leaf
  Tls(Box<tokio_rustls::server::TlsStream<Rewind<TcpStream>>>),
  /// No transport; reads yield EOF, writes fail
  Closed,
}

/// The server half's transport: plain TCP, upstream TLS, or closed.
#[derive(Debug)]
pub enum ServerStream {
  /// Outbound socket before any TLS
  Tcp(TcpStream),
  /// After the upstream handshake
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
  /// No transport; reads yield EOF, writes fail
  Closed,
}

macro_rules! stream_io {
  ($name:ident) => {
    impl AsyncRead for $name {
      fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
      ) -> Poll<io::Result<()>> {
        match self.get_mut() {
          $name::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
          $name::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
          $name::Closed => Poll::Ready(Ok(())),
        }
      }
    }

    impl AsyncWrite for $name {
      fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
      ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
          $name::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
          $name::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
          $name::Closed => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
      }

      fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
          $name::Tcp(stream) => Pin::new(stream).poll_flush(cx),
          $name::Tls(stream) => Pin::new(stream).poll_flush(cx),
          $name::Closed => Poll::Ready(Ok(())),
        }
      }

      fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
          $name::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
          $name::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
          $name::Closed => Poll::Ready(Ok(())),
        }
      }
    }
  };
}

stream_io!(ClientStream);
stream_io!(ServerStream);

/// The accepted side of a flow.
#[derive(Debug)]
pub struct ClientConnection {
  pub(crate) stream: ClientStream,
  pub(crate) input: BytesMut,
  peer: SocketAddr,
}

impl ClientConnection {
  pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
    ClientConnection {
      stream: ClientStream::Tcp(stream),
      input: BytesMut::with_capacity(8 * 1024),
      peer,
    }
  }

  /// The client's socket address.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }

  /// Whether the downstream handshake has completed.
  pub fn is_tls(&self) -> bool {
    matches!(self.stream, ClientStream::Tls(_))
  }

  /// Performs the TLS server handshake toward the client, replaying
  /// `prefix` (the inspected ClientHello bytes) before the socket.
  ///
  /// Any bytes sitting in the parse buffer are replayed first as well.
  pub(crate) async fn establish_tls(
    &mut self,
    acceptor: TlsAcceptor,
    prefix: Bytes,
  ) -> Result<()> {
    match std::mem::replace(&mut self.stream, ClientStream::Closed) {
      ClientStream::Tcp(tcp) => {
        let mut replay = BytesMut::from(&self.input.split()[..]);
        replay.extend_from_slice(&prefix);
        let rewound = Rewind::new(replay.freeze(), tcp);
        match acceptor.accept(rewound).await {
          Ok(tls) => {
            self.stream = ClientStream::Tls(Box::new(tls));
            Ok(())
          }
          Err(error) => {
            tracing::debug!(peer = %self.peer, "downstream handshake failed: {}", error);
            Err(TlsCode::DownstreamHandshakeFailed.into())
          }
        }
      }
      other => {
        self.stream = other;
        Err(ProxyCode::InvalidOperation.into())
      }
    }
  }

  /// The negotiated ALPN protocol, after TLS.
  pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
    match &self.stream {
      ClientStream::Tls(tls) => tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
      _ => None,
    }
  }

  pub(crate) async fn close(&mut self) {
    let _ = self.stream.shutdown().await;
    self.stream = ClientStream::Closed;
  }
}

/// The upstream side of a flow.
#[derive(Debug)]
pub struct ServerConnection {
  pub(crate) stream: ServerStream,
  pub(crate) input: BytesMut,
}

impl ServerConnection {
  pub(crate) fn new() -> Self {
    ServerConnection {
      stream: ServerStream::Closed,
      input: BytesMut::with_capacity(8 * 1024),
    }
  }

  /// Whether an upstream transport is established.
  pub fn connected(&self) -> bool {
    !matches!(self.stream, ServerStream::Closed)
  }

  /// Whether the upstream handshake has completed.
  pub fn is_tls(&self) -> bool {
    matches!(self.stream, ServerStream::Tls(_))
  }

  pub(crate) async fn connect(
    &mut self,
    connector: &Connector,
    host: &str,
    port: u16,
    own_addr: Option<SocketAddr>,
  ) -> Result<()> {
    let stream = connector.connect(host, port, own_addr).await?;
    self.stream = ServerStream::Tcp(stream);
    self.input.clear();
    Ok(())
  }

  /// Performs the TLS client handshake toward the real server.
  pub(crate) async fn establish_tls(
    &mut self,
    connector: TlsConnector,
    server_name: ServerName<'static>,
  ) -> Result<()> {
    match std::mem::replace(&mut self.stream, ServerStream::Closed) {
      ServerStream::Tcp(tcp) => match connector.connect(server_name, tcp).await {
        Ok(tls) => {
          self.stream = ServerStream::Tls(Box::new(tls));
          Ok(())
        }
        Err(error) => {
          tracing::debug!("upstream handshake failed: {}", error);
          Err(TlsCode::UpstreamHandshakeFailed.into())
        }
      },
      other => {
        self.stream = other;
        Err(ProxyCode::InvalidOperation.into())
      }
    }
  }

  /// The negotiated ALPN protocol, after TLS.
  pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
    match &self.stream {
      ServerStream::Tls(tls) => tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
      _ => None,
    }
  }

  /// The upstream leaf certificate in DER form, after TLS.
  pub fn peer_certificate(&self) -> Option<Vec<u8>> {
    match &self.stream {
      ServerStream::Tls(tls) => tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec()),
      _ => None,
    }
  }

  pub(crate) async fn disconnect(&mut self) {
    let _ = self.stream.shutdown().await;
    self.stream = ServerStream::Closed;
    self.input.clear();
  }
}

/// A client connection and a server connection handled as one unit, plus
/// the currently intended upstream target.
#[derive(Debug)]
pub struct ConnectionFlow {
  /// The accepted half
  pub client: ClientConnection,
  /// The upstream half
  pub server: ServerConnection,
  target_host: String,
  target_port: u16,
}

impl ConnectionFlow {
  /// Wraps a freshly accepted socket.
  pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
    ConnectionFlow {
      client: ClientConnection::new(stream, peer),
      server: ServerConnection::new(),
      target_host: String::new(),
      target_port: 0,
    }
  }

  /// The intended upstream host.
  pub fn target_host(&self) -> &str {
    &self.target_host
  }

  /// The intended upstream port.
  pub fn target_port(&self) -> u16 {
    self.target_port
  }

  /// Whether a target has been chosen.
  pub fn has_target(&self) -> bool {
    !self.target_host.is_empty()
  }

  /// Sets the upstream target. A connected upstream pointing elsewhere is
  /// disconnected first; reconnection happens on the next
  /// [`connect_server`](Self::connect_server).
  pub async fn set_target(&mut self, host: &str, port: u16) {
    if self.server.connected() && (self.target_host != host || self.target_port != port) {
      self.server.disconnect().await;
    }
    self.target_host = host.to_string();
    self.target_port = port;
  }

  /// Connects the upstream half to the current target, unless it already
  /// is.
  pub async fn connect_server(
    &mut self,
    connector: &Connector,
    own_addr: Option<SocketAddr>,
  ) -> Result<()> {
    if !self.has_target() {
      return Err(ProxyCode::ServerNotConnected.into());
    }
    if self.server.connected() {
      return Ok(());
    }
    self
      .server
      .connect(connector, &self.target_host, self.target_port, own_addr)
      .await
  }

  /// Closes both halves.
  pub async fn disconnect(&mut self) {
    self.client.close().await;
    self.server.disconnect().await;
  }
}

impl ClientConnection {
  /// Moves any buffered-but-unparsed bytes out of the streambuf.
  pub(crate) fn take_buffered(&mut self) -> BytesMut {
    self.input.split()
  }
}

impl ServerConnection {
  /// Moves any buffered-but-unparsed bytes out of the streambuf.
  pub(crate) fn take_buffered(&mut self) -> BytesMut {
    self.input.split()
  }
}
