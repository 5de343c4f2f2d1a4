//! Protocol services and the per-flow state machine.
//!
//! A service is the state entity that currently owns a flow. Each runs its
//! protocol until it completes an atomic unit, then hands the flow off to
//! the next service by name. The driver loop below realizes the
//! transitions; handoffs never leave the flow's task.

pub(crate) mod http;
pub(crate) mod tls;
pub(crate) mod tunnel;
pub(crate) mod websocket;

use crate::ca::CertificateStore;
use crate::connection::ConnectionFlow;
use crate::connector::Connector;
use crate::errors::{ProxyCode, Result};
use crate::interceptor::InterceptorHandler;
use crate::server::ProxyConfig;
use crate::websocket::ExtensionData;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

/// Everything a service needs besides the flow itself.
pub(crate) struct ServiceContext {
  pub config: Arc<ProxyConfig>,
  pub store: Arc<CertificateStore>,
  pub interceptors: Arc<RwLock<InterceptorHandler>>,
  pub connector: Connector,
  /// The proxy's own listening address, for self-connect rejection.
  pub own_addr: Option<SocketAddr>,
}

/// The next owner of a flow, named by the service handing it off.
#[derive(Debug)]
pub(crate) enum Handoff {
  /// Sniff the next bytes and pick a service
  Ingress,
  /// Plaintext or decrypted HTTP/1 exchanges
  Http,
  /// TLS interception handshake
  Tls,
  /// Opaque byte copying
  Tunnel,
  /// WebSocket frame inspection after a 101 upgrade
  Websocket(WebsocketContext),
  /// Both halves are done
  Done,
}

/// State carried from the HTTP upgrade into the WebSocket service.
#[derive(Debug)]
pub(crate) struct WebsocketContext {
  /// Extensions the server accepted in its 101 response
  pub extensions: Vec<ExtensionData>,
}

/// Drives one flow through services until it reaches the terminal state.
pub(crate) async fn run_flow(mut flow: ConnectionFlow, ctx: ServiceContext) {
  let peer = flow.client.peer_addr();
  let mut state = Handoff::Ingress;
  loop {
    let next = match state {
      Handoff::Ingress => ingress(&mut flow).await,
      Handoff::Http => http::run(&mut flow, &ctx).await,
      Handoff::Tls => tls::run(&mut flow, &ctx).await,
      Handoff::Tunnel => tunnel::run(&mut flow).await,
      Handoff::Websocket(context) => websocket::run(&mut flow, &ctx, context).await,
      Handoff::Done => break,
    };
    state = match next {
      Ok(handoff) => handoff,
      Err(error) => {
        if error.is_proxy() {
          tracing::debug!(%peer, "flow ended: {}", error);
        } else {
          tracing::warn!(%peer, "flow failed: {}", error);
        }
        break;
      }
    };
  }
  flow.disconnect().await;
  tracing::trace!(%peer, "flow closed");
}

/// Classifies the first bytes of a (possibly tunneled) client stream:
/// a TLS record begins with the handshake content type 0x16, an HTTP
/// request with an ASCII method letter; anything else is tunneled
/// opaquely when a target is known.
async fn ingress(flow: &mut ConnectionFlow) -> Result<Handoff> {
  if flow.client.input.is_empty() {
    let n = (&mut flow.client.stream)
      .read_buf(&mut flow.client.input)
      .await?;
    if n == 0 {
      return Ok(Handoff::Done);
    }
  }
  match flow.client.input[0] {
    0x16 => Ok(Handoff::Tls),
    b if b.is_ascii_uppercase() => Ok(Handoff::Http),
    _ if flow.has_target() => Ok(Handoff::Tunnel),
    _ => Err(ProxyCode::InvalidOperation.into()),
  }
}
