//! End-to-end tests: a real proxy instance between a raw client socket and
//! a stub upstream server.

use snare::{ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
  let dir = std::env::temp_dir().join(format!("snare-test-{}-{}", tag, std::process::id()));
  let _ = std::fs::remove_dir_all(&dir);
  dir
}

async fn start_proxy(tag: &str) -> (SocketAddr, Arc<ProxyServer>) {
  init_tracing();
  let config = ProxyConfig {
    ca_storage_path: temp_dir(tag),
    max_body_size: 1024 * 1024,
    ..ProxyConfig::default()
  };
  let proxy = Arc::new(ProxyServer::new(config).await.unwrap());
  let listener = ProxyServer::listener("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = proxy.clone();
  tokio::spawn(async move {
    let _ = server.serve(listener).await;
  });
  (addr, proxy)
}

/// Accepts one connection, records the request head, and answers with a
/// canned response.
async fn stub_upstream(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
      if stream.read_exact(&mut byte).await.is_err() {
        break;
      }
      head.push(byte[0]);
    }
    stream.write_all(response).await.unwrap();
    stream.shutdown().await.ok();
    let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
  });
  (addr, rx)
}

async fn read_to_end(stream: &mut TcpStream) -> String {
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn absolute_form_get_is_rewritten_to_origin_form() {
  let (upstream, request_rx) = stub_upstream(
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
  )
  .await;
  let (proxy, _server) = start_proxy("absolute").await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
    upstream.port(),
    upstream.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let seen = request_rx.await.unwrap();
  assert!(
    seen.starts_with("GET /hello HTTP/1.1\r\n"),
    "upstream saw: {seen}"
  );
  assert!(seen.contains(&format!("Host: 127.0.0.1:{}\r\n", upstream.port())));

  let response = read_to_end(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
  assert!(response.ends_with("ok"));
}

#[tokio::test]
async fn chunked_upstream_bodies_are_reframed_with_content_length() {
  let (upstream, _request_rx) = stub_upstream(
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
  )
  .await;
  let (proxy, _server) = start_proxy("chunked").await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/stream HTTP/1.1\r\nHost: x\r\n\r\n",
    upstream.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let response = read_to_end(&mut client).await;
  assert!(response.contains("Content-Length: 11\r\n"), "{response}");
  assert!(!response.to_lowercase().contains("transfer-encoding"));
  assert!(response.ends_with("hello world"), "{response}");
}

#[tokio::test]
async fn oversized_declared_bodies_get_413_without_an_upstream_connection() {
  let touched = Arc::new(AtomicBool::new(false));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream = listener.local_addr().unwrap();
  {
    let touched = touched.clone();
    tokio::spawn(async move {
      if listener.accept().await.is_ok() {
        touched.store(true, Ordering::SeqCst);
      }
    });
  }
  let (proxy, _server) = start_proxy("toolarge").await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "POST http://127.0.0.1:{}/up HTTP/1.1\r\nHost: x\r\nContent-Length: 1073741824\r\n\r\n",
    upstream.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let response = read_to_end(&mut client).await;
  assert!(
    response.starts_with("HTTP/1.1 413 "),
    "expected 413, got: {response}"
  );
  tokio::time::sleep(std::time::Duration::from_millis(100)).await;
  assert!(!touched.load(Ordering::SeqCst), "upstream socket was opened");
}

#[tokio::test]
async fn malformed_requests_get_400() {
  let (proxy, _server) = start_proxy("badreq").await;
  let mut client = TcpStream::connect(proxy).await.unwrap();
  client
    .write_all(b"BREW http://example.test/ HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let response = read_to_end(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 400 "), "{response}");
}

#[tokio::test]
async fn proxying_to_the_proxy_itself_is_refused() {
  let (proxy, _server) = start_proxy("selfconnect").await;
  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/loop HTTP/1.1\r\nHost: x\r\n\r\n",
    proxy.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_to_end(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 502 "), "{response}");
}

mod tls_intercept {
  use super::*;
  use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
  use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
  use tokio_rustls::{TlsAcceptor, TlsConnector};

  /// A TLS upstream with a throwaway self-signed certificate for
  /// 127.0.0.1, speaking http/1.1 over ALPN.
  async fn tls_upstream(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::default();
    params.subject_alt_names = vec![rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap())];
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(vec![cert_der], key_der)
      .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut tls = acceptor.accept(stream).await.unwrap();
      let mut head = Vec::new();
      let mut byte = [0u8; 1];
      while !head.ends_with(b"\r\n\r\n") {
        if tls.read_exact(&mut byte).await.is_err() {
          break;
        }
        head.push(byte[0]);
      }
      tls.write_all(response).await.unwrap();
      tls.shutdown().await.ok();
      let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
    });
    (addr, rx)
  }

  fn client_tls_config(ca_pem: &str) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
      roots.add(cert.unwrap()).unwrap();
    }
    let mut config = ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
  }

  #[tokio::test]
  async fn connect_is_intercepted_with_a_minted_leaf() {
    let (upstream, request_rx) = tls_upstream(
      b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret",
    )
    .await;
    let (proxy, server) = start_proxy("tls").await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let connect = format!(
      "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
      port = upstream.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    // Read exactly the CONNECT reply; the TLS handshake follows on the
    // same bytes.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
      client.read_exact(&mut byte).await.unwrap();
      head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200 "), "{head}");

    // Handshake against the minted leaf, trusting only the proxy's CA.
    let config = client_tls_config(&server.ca_cert_pem().unwrap());
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::IpAddress("127.0.0.1".parse::<std::net::IpAddr>().unwrap().into());
    let mut tls = connector.connect(server_name, client).await.unwrap();

    // ALPN mirrored the upstream's choice back to the client.
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    tls
      .write_all(b"GET /secure HTTP/1.1\r\nHost: intercepted\r\n\r\n")
      .await
      .unwrap();
    let seen = request_rx.await.unwrap();
    assert!(seen.starts_with("GET /secure HTTP/1.1\r\n"), "{seen}");

    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("secret"), "{response}");
  }
}
