//! Outbound TCP dialing and upstream TLS configuration.

use crate::errors::{ProxyCode, Result, TlsCode};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// A minimum TLS protocol version for intercepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
  /// TLS 1.2
  Tls12,
  /// TLS 1.3
  Tls13,
}

/// Dials upstream servers.
#[derive(Debug, Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for Connector {
  fn default() -> Self {
    Connector {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
    }
  }
}

impl Connector {
  /// A connector with the given socket options.
  pub fn new(connect_timeout: Option<Duration>, nodelay: bool, keepalive: bool) -> Self {
    Connector {
      connect_timeout,
      nodelay,
      keepalive,
    }
  }

  /// Resolves `host:port` and connects, trying each resolved address.
  ///
  /// An address equal to `own_addr` (the proxy's own listener) is rejected
  /// with a self-connect error instead of dialed.
  pub async fn connect(
    &self,
    host: &str,
    port: u16,
    own_addr: Option<SocketAddr>,
  ) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
      return Err(ProxyCode::Io.into());
    }
    let mut last_error = None;
    for addr in addrs {
      if Some(addr) == own_addr {
        return Err(ProxyCode::SelfConnect.into());
      }
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(error) => last_error = Some(error),
      }
    }
    Err(last_error.unwrap_or_else(|| ProxyCode::Io.into()))
  }

  /// Connects to a resolved address.
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    if self.keepalive {
      socket.set_keepalive(true)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??,
    };
    Ok(stream)
  }
}

/// Builds the rustls client configuration for the upstream leg of an
/// intercepted connection, offering the client's ALPN set unchanged.
///
/// With `roots` set, upstream certificates are verified against them;
/// otherwise any upstream certificate is accepted, which is the usual
/// posture for an intercepting proxy whose clients make the trust
/// decision against the minted leaf.
pub(crate) fn upstream_tls_config(
  alpn: Vec<Vec<u8>>,
  roots: Option<rustls::RootCertStore>,
  min_tls_version: Option<TlsVersion>,
) -> Result<TlsConnector> {
  let mut versions = rustls::ALL_VERSIONS.to_vec();
  if let Some(min) = min_tls_version {
    versions.retain(|v| match v.version {
      rustls::ProtocolVersion::TLSv1_2 => min <= TlsVersion::Tls12,
      rustls::ProtocolVersion::TLSv1_3 => min <= TlsVersion::Tls13,
      _ => false,
    });
  }
  if versions.is_empty() {
    return Err(TlsCode::TlsContextError.into());
  }
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let builder = rustls::ClientConfig::builder_with_provider(provider)
    .with_protocol_versions(&versions)
    .map_err(|_| TlsCode::TlsContextError)?;
  let mut config = match roots {
    Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
    None => builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth(),
  };
  config.alpn_protocols = alpn;
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any upstream certificate. Interception decouples the client's
/// trust decision from the upstream's identity; verification is opt-in
/// through the proxy configuration.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
