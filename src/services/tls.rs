//! The TLS interception service.
//!
//! Reads the client's ClientHello without completing a handshake, mirrors
//! its SNI and ALPN toward the real server, synthesizes a downstream
//! context around a leaf minted for the names the upstream certificate
//! actually covers, and finishes both handshakes before dispatching to the
//! next service.

use super::{Handoff, ServiceContext};
use crate::connection::ConnectionFlow;
use crate::connector::upstream_tls_config;
use crate::errors::{Error, Result, TlsCode};
use bytes::BytesMut;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tls_parser::nom::Err as NomErr;
use tls_parser::{
  parse_tls_extensions, parse_tls_plaintext, SNIType, TlsExtension, TlsMessage,
  TlsMessageHandshake,
};
use tokio::io::AsyncReadExt;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Upper bound on buffered ClientHello bytes.
const MAX_CLIENT_HELLO: usize = 16 * 1024;
/// Upper bound on SAN entries mirrored from the upstream leaf.
const MAX_SAN_NAMES: usize = 32;

/// What the ClientHello advertised.
#[derive(Debug, Default)]
struct ClientHelloInfo {
  sni: Option<String>,
  alpn: Vec<Vec<u8>>,
}

pub(crate) async fn run(flow: &mut ConnectionFlow, ctx: &ServiceContext) -> Result<Handoff> {
  // 1. Inspect the ClientHello. The bytes are consumed here and replayed
  // into the downstream handshake later.
  let mut hello_bytes = flow.client.take_buffered();
  let hello = read_client_hello(flow, &mut hello_bytes).await?;

  // 2. Choose the target: CONNECT already set one; a transparent flow
  // falls back to SNI on the TLS default port.
  if !flow.has_target() {
    match &hello.sni {
      Some(host) => {
        let host = host.clone();
        flow.set_target(&host, 443).await;
      }
      None => return Err(TlsCode::InvalidClientHello.into()),
    }
  }

  // 3. Mirror upstream: same SNI, the client's ALPN set.
  let sni = hello
    .sni
    .clone()
    .unwrap_or_else(|| flow.target_host().to_string());
  flow
    .connect_server(&ctx.connector, ctx.own_addr)
    .await
    .map_err(|error| match error {
      Error::Proxy(crate::errors::ProxyCode::SelfConnect) => error,
      _ => TlsCode::UpstreamConnectError.into(),
    })?;
  let connector = upstream_tls_config(
    hello.alpn.clone(),
    None,
    ctx.config.min_tls_version,
  )?;
  let server_name = server_name_for(&sni)?;
  flow.server.establish_tls(connector, server_name).await?;
  let negotiated = flow.server.alpn_protocol();

  // 4. Determine the names the minted leaf must cover: SNI plus the
  // upstream leaf's subject names, bounded.
  let mut names: BTreeSet<String> = BTreeSet::new();
  names.insert(sni.clone());
  let mut primary = sni.clone();
  if let Some(der) = flow.server.peer_certificate() {
    let (cn, sans) = upstream_names(&der);
    if hello.sni.is_none() {
      if let Some(cn) = cn {
        primary = cn;
      }
    }
    for san in sans.into_iter().take(MAX_SAN_NAMES) {
      names.insert(san);
    }
  }

  // 5. Leaf lookup or mint, then the downstream handshake with the
  // client's negotiated protocol.
  let (chain, key) = ctx.store.leaf_for(&primary, &names).await?;
  let mut server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|error| {
      tracing::error!("downstream TLS context: {}", error);
      Error::from(TlsCode::TlsContextError)
    })?;
  if let Some(protocol) = &negotiated {
    server_config.alpn_protocols = vec![protocol.clone()];
  }
  let acceptor = TlsAcceptor::from(Arc::new(server_config));
  flow
    .client
    .establish_tls(acceptor, hello_bytes.freeze())
    .await?;

  // 6. Post-handshake dispatch: http/1.* parses, everything else (any
  // other protocol, or no ALPN at all) is copied opaquely.
  match negotiated.as_deref() {
    Some(protocol) if protocol.starts_with(b"http/1.") => Ok(Handoff::Http),
    _ => Ok(Handoff::Tunnel),
  }
}

/// Accumulates bytes until a full ClientHello parses, leaving everything
/// in `buffer` for replay.
async fn read_client_hello(
  flow: &mut ConnectionFlow,
  buffer: &mut BytesMut,
) -> Result<ClientHelloInfo> {
  loop {
    if !buffer.is_empty() {
      match parse_client_hello(buffer)? {
        Some(info) => return Ok(info),
        None => {
          if buffer.len() > MAX_CLIENT_HELLO {
            return Err(TlsCode::InvalidClientHello.into());
          }
        }
      }
    }
    let n = (&mut flow.client.stream).read_buf(buffer).await?;
    if n == 0 {
      return Err(TlsCode::InvalidClientHello.into());
    }
  }
}

/// Parses a buffered TLS record as a ClientHello. `Ok(None)` means more
/// bytes are needed.
fn parse_client_hello(bytes: &[u8]) -> Result<Option<ClientHelloInfo>> {
  let record = match parse_tls_plaintext(bytes) {
    Ok((_, record)) => record,
    Err(NomErr::Incomplete(_)) => return Ok(None),
    Err(_) => return Err(TlsCode::InvalidClientHello.into()),
  };
  let Some(TlsMessage::Handshake(TlsMessageHandshake::ClientHello(client_hello))) =
    record.msg.first()
  else {
    return Err(TlsCode::InvalidClientHello.into());
  };
  let mut info = ClientHelloInfo::default();
  let Some(ext_data) = client_hello.ext else {
    return Ok(Some(info));
  };
  let Ok((_, extensions)) = parse_tls_extensions(ext_data) else {
    return Err(TlsCode::InvalidClientHello.into());
  };
  for extension in extensions {
    match extension {
      TlsExtension::SNI(entries) => {
        for (kind, data) in entries {
          if kind == SNIType::HostName {
            if let Ok(host) = std::str::from_utf8(data) {
              info.sni = Some(host.to_string());
              break;
            }
          }
        }
      }
      TlsExtension::ALPN(protocols) => {
        info.alpn = protocols.iter().map(|p| p.to_vec()).collect();
      }
      _ => {}
    }
  }
  Ok(Some(info))
}

/// Builds the upstream `ServerName`, as a DNS name or IP literal.
fn server_name_for(host: &str) -> Result<ServerName<'static>> {
  if let Ok(ip) = host.parse::<IpAddr>() {
    return Ok(ServerName::IpAddress(ip.into()));
  }
  ServerName::try_from(host.to_string()).map_err(|_| TlsCode::InvalidClientHello.into())
}

/// Subject CN and SAN entries of an upstream leaf certificate.
fn upstream_names(der: &[u8]) -> (Option<String>, Vec<String>) {
  use x509_parser::extensions::GeneralName;
  use x509_parser::parse_x509_certificate;

  let Ok((_, cert)) = parse_x509_certificate(der) else {
    return (None, Vec::new());
  };
  let cn = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|attr| attr.as_str().ok())
    .map(str::to_string);
  let mut names = Vec::new();
  if let Ok(Some(san)) = cert.subject_alternative_name() {
    for name in &san.value.general_names {
      match name {
        GeneralName::DNSName(dns) => names.push((*dns).to_string()),
        GeneralName::IPAddress(bytes) => match bytes.len() {
          4 => {
            let octets: [u8; 4] = (*bytes).try_into().unwrap_or_default();
            names.push(IpAddr::from(octets).to_string());
          }
          16 => {
            let octets: [u8; 16] = (*bytes).try_into().unwrap_or_default();
            names.push(IpAddr::from(octets).to_string());
          }
          _ => {}
        },
        _ => {}
      }
    }
  }
  (cn, names)
}

#[cfg(test)]
mod tests {
  use super::*;

  // A minimal ClientHello with SNI example.test and ALPN [h2, http/1.1],
  // captured from a rustls client handshake would be long; build one by
  // hand instead with just the fields the parser reads.
  fn sample_client_hello() -> Vec<u8> {
    let mut extensions: Vec<u8> = Vec::new();

    // server_name extension.
    let host = b"example.test";
    let mut sni_entry = vec![0x00];
    sni_entry.extend((host.len() as u16).to_be_bytes());
    sni_entry.extend(host);
    let mut sni_list = Vec::new();
    sni_list.extend((sni_entry.len() as u16).to_be_bytes());
    sni_list.extend(&sni_entry);
    extensions.extend([0x00, 0x00]);
    extensions.extend((sni_list.len() as u16).to_be_bytes());
    extensions.extend(&sni_list);

    // ALPN extension.
    let mut protocols = Vec::new();
    for name in [&b"h2"[..], &b"http/1.1"[..]] {
      protocols.push(name.len() as u8);
      protocols.extend_from_slice(name);
    }
    let mut alpn_body = Vec::new();
    alpn_body.extend((protocols.len() as u16).to_be_bytes());
    alpn_body.extend(&protocols);
    extensions.extend([0x00, 0x10]);
    extensions.extend((alpn_body.len() as u16).to_be_bytes());
    extensions.extend(&alpn_body);

    // ClientHello body: version, random, session id, one cipher suite,
    // null compression, extensions.
    let mut body = Vec::new();
    body.extend([0x03, 0x03]);
    body.extend([0u8; 32]);
    body.push(0x00);
    body.extend([0x00, 0x02, 0x13, 0x01]);
    body.extend([0x01, 0x00]);
    body.extend((extensions.len() as u16).to_be_bytes());
    body.extend(&extensions);

    // Handshake header + record header.
    let mut handshake = vec![0x01];
    handshake.extend(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend(&body);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend((handshake.len() as u16).to_be_bytes());
    record.extend(&handshake);
    record
  }

  #[test]
  fn parses_sni_and_alpn_from_a_client_hello() {
    let record = sample_client_hello();
    let info = parse_client_hello(&record).unwrap().unwrap();
    assert_eq!(info.sni.as_deref(), Some("example.test"));
    assert_eq!(info.alpn, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
  }

  #[test]
  fn partial_records_ask_for_more_data() {
    let record = sample_client_hello();
    assert!(parse_client_hello(&record[..3]).unwrap().is_none());
    assert!(parse_client_hello(&record[..record.len() - 4])
      .unwrap()
      .is_none());
  }

  #[test]
  fn non_handshake_records_are_invalid() {
    // An application-data record instead of a handshake.
    let bogus = [0x17u8, 0x03, 0x03, 0x00, 0x01, 0x00];
    assert!(parse_client_hello(&bogus).is_err());
  }

  #[test]
  fn server_names_accept_hosts_and_ip_literals() {
    assert!(matches!(
      server_name_for("example.test").unwrap(),
      ServerName::DnsName(_)
    ));
    assert!(matches!(
      server_name_for("127.0.0.1").unwrap(),
      ServerName::IpAddress(_)
    ));
  }
}
