//! The HTTP/1 exchange service.
//!
//! Runs request/response pairs over an established flow: parses a request
//! off the client, routes it per its target form, forwards it upstream,
//! relays the response, and decides whether the connection survives the
//! exchange. CONNECT and 101-upgrade exchanges hand the flow off to the
//! TLS ingress or the WebSocket service.

use super::{Handoff, ServiceContext, WebsocketContext};
use crate::connection::ConnectionFlow;
use crate::errors::{Error, HttpCode, Result};
use crate::headers::HeaderMap;
use crate::parser::{BodyFraming, MessageReader};
use crate::request::Request;
use crate::response::Response;
use crate::url::TargetForm;
use crate::websocket::ExtensionData;
use base64::{prelude::BASE64_STANDARD, Engine};
use http::{Method, StatusCode, Version};
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

/// RFC 6455 §1.3 accept-key GUID.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that must not travel beyond this hop.
const HOP_BY_HOP: [&str; 6] = [
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "keep-alive",
  "te",
  "trailers",
];

pub(crate) async fn run(flow: &mut ConnectionFlow, ctx: &ServiceContext) -> Result<Handoff> {
  loop {
    let request = {
      let mut reader = MessageReader::new(&mut flow.client.stream, &mut flow.client.input);
      match reader.read_request(ctx.config.max_body_size).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(Handoff::Done),
        Err(Error::Http(HttpCode::BodySizeTooLarge)) => {
          // Reject before any upstream socket is opened.
          respond(flow, StatusCode::PAYLOAD_TOO_LARGE).await?;
          return Ok(Handoff::Done);
        }
        Err(Error::Http(code)) => {
          tracing::debug!(peer = %flow.client.peer_addr(), "bad request: {}", code);
          respond(flow, StatusCode::BAD_REQUEST).await?;
          return Ok(Handoff::Done);
        }
        Err(error) => return Err(error),
      }
    };

    match request.target().form {
      TargetForm::Authority => {
        // CONNECT: acknowledge, remember the target, and re-sniff the
        // tunneled bytes.
        let host = request.target().netloc.host.clone();
        let port = match request.target().netloc.port {
          Some(port) => port,
          None => {
            respond(flow, StatusCode::BAD_REQUEST).await?;
            return Ok(Handoff::Done);
          }
        };
        flow.set_target(&host, port).await;
        flow
          .client
          .stream
          .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
          .await?;
        flow.client.stream.flush().await?;
        return Ok(Handoff::Ingress);
      }
      TargetForm::Asterisk => {
        respond(flow, StatusCode::BAD_REQUEST).await?;
        return Ok(Handoff::Done);
      }
      TargetForm::Absolute => {
        let host = request.target().netloc.host.clone();
        let port = request.target().port_or_default();
        flow.set_target(&host, port).await;
      }
      TargetForm::Origin => {
        if !flow.has_target() {
          respond(flow, StatusCode::BAD_REQUEST).await?;
          return Ok(Handoff::Done);
        }
      }
    }

    match exchange(flow, ctx, request).await? {
      Some(handoff) => return Ok(handoff),
      None => continue,
    }
  }
}

/// Forwards one request and relays its response. Returns `Some(handoff)`
/// to leave the HTTP service, `None` to parse the next request.
async fn exchange(
  flow: &mut ConnectionFlow,
  ctx: &ServiceContext,
  mut request: Request,
) -> Result<Option<Handoff>> {
  request.rewrite_to_origin_form();
  for name in HOP_BY_HOP {
    request.headers_mut().remove(name);
  }
  // Read the connection semantics before they are stripped. The upgrade
  // path keeps `Connection`/`Upgrade` verbatim for the 101 handshake.
  let upgrade_requested = wants_websocket_upgrade(&request);
  let client_wants_close = wants_close(request.version(), request.headers());
  if !upgrade_requested {
    strip_connection_headers(request.headers_mut());
  }

  let request = {
    let interceptors = ctx.interceptors.read().await;
    match interceptors.process_request(request).await? {
      Some(request) => request,
      None => {
        respond(flow, StatusCode::FORBIDDEN).await?;
        return Ok(None);
      }
    }
  };

  if let Err(error) = flow.connect_server(&ctx.connector, ctx.own_addr).await {
    tracing::debug!(
      host = flow.target_host(),
      port = flow.target_port(),
      "upstream connect failed: {}",
      error
    );
    respond(flow, StatusCode::BAD_GATEWAY).await?;
    return Ok(Some(Handoff::Done));
  }
  let mut forwarded = flow.server.stream.write_all(&request.to_raw()).await;
  if forwarded.is_ok() {
    forwarded = flow.server.stream.flush().await;
  }
  if forwarded.is_err() {
    respond(flow, StatusCode::BAD_GATEWAY).await?;
    return Ok(Some(Handoff::Done));
  }

  let (response, framing) = {
    let mut reader = MessageReader::new(&mut flow.server.stream, &mut flow.server.input);
    match reader
      .read_response(request.method(), ctx.config.max_body_size)
      .await
    {
      Ok(parsed) => parsed,
      Err(error) => {
        tracing::debug!(host = flow.target_host(), "bad upstream response: {}", error);
        respond(flow, StatusCode::BAD_GATEWAY).await?;
        return Ok(Some(Handoff::Done));
      }
    }
  };

  let response = {
    let interceptors = ctx.interceptors.read().await;
    match interceptors.process_response(response).await? {
      Some(response) => response,
      None => {
        respond(flow, StatusCode::FORBIDDEN).await?;
        return Ok(None);
      }
    }
  };

  if response.status() == StatusCode::SWITCHING_PROTOCOLS {
    if upgrade_requested && upgrade_is_accepted(&request, &response) {
      let extensions = ExtensionData::from_headers(response.headers())?;
      flow.client.stream.write_all(&response.to_raw()).await?;
      flow.client.stream.flush().await?;
      return Ok(Some(Handoff::Websocket(WebsocketContext { extensions })));
    }
    // A 101 the client did not ask for, or with a bad accept key, cannot
    // be relayed as a byte stream we understand.
    tracing::debug!(host = flow.target_host(), "rejecting unverified 101 upgrade");
    respond(flow, StatusCode::BAD_GATEWAY).await?;
    return Ok(Some(Handoff::Done));
  }

  flow.client.stream.write_all(&response.to_raw()).await?;
  flow.client.stream.flush().await?;

  let server_wants_close =
    wants_close(response.version(), response.headers()) || framing == BodyFraming::ReadToEof;
  if client_wants_close || server_wants_close {
    return Ok(Some(Handoff::Done));
  }
  Ok(None)
}

/// `Connection` is hop-by-hop, and so is every header its value names
/// (RFC 7230 §6.1): `Connection: close, X-Foo` removes `X-Foo` too.
fn strip_connection_headers(headers: &mut HeaderMap) {
  let named: Vec<String> = headers
    .get_all("connection")
    .flat_map(|value| value.split(','))
    .map(|token| token.trim().to_string())
    .filter(|token| !token.is_empty())
    .collect();
  for token in named {
    headers.remove(&token);
  }
  headers.remove("connection");
}

/// Writes a minimal synthesized response and flushes it.
async fn respond(flow: &mut ConnectionFlow, status: StatusCode) -> Result<()> {
  let mut response = Response::new(status);
  response.headers_mut().append("Content-Length", "0");
  response.headers_mut().append("Connection", "close");
  flow.client.stream.write_all(&response.to_raw()).await?;
  flow.client.stream.flush().await?;
  Ok(())
}

/// Connection persistence per RFC 7230 §6.3: HTTP/1.1 defaults to
/// keep-alive unless `close` is present; HTTP/1.0 defaults to close unless
/// `keep-alive` is present.
fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  if headers.contains_token("connection", "close") {
    return true;
  }
  version == Version::HTTP_10 && !headers.contains_token("connection", "keep-alive")
}

/// Whether the request asks for a WebSocket upgrade.
fn wants_websocket_upgrade(request: &Request) -> bool {
  request.method() == Method::GET
    && request.headers().contains_token("connection", "upgrade")
    && request.headers().contains_token("upgrade", "websocket")
    && request.headers().contains("sec-websocket-key")
}

/// Whether a 101 response correctly accepts the request's upgrade: the
/// `Upgrade` header names websocket and the accept key matches the
/// RFC 6455 computation.
fn upgrade_is_accepted(request: &Request, response: &Response) -> bool {
  if !response.headers().contains_token("upgrade", "websocket") {
    return false;
  }
  let (Some(key), Some(accept)) = (
    request.headers().get("sec-websocket-key"),
    response.headers().get("sec-websocket-accept"),
  ) else {
    return false;
  };
  accept == compute_accept_key(key)
}

/// `base64(sha1(key ++ GUID))`.
fn compute_accept_key(key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(key.as_bytes());
  hasher.update(WEBSOCKET_GUID.as_bytes());
  BASE64_STANDARD.encode(hasher.finalize())
}
