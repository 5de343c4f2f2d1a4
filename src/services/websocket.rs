//! The WebSocket frame inspection service.
//!
//! After a verified 101 upgrade the flow carries WebSocket frames in both
//! directions. Each direction is folded through its own manager: frames
//! are parsed, reassembled, surfaced as completed units, and re-serialized
//! toward the opposite endpoint with direction-correct masking. A close
//! frame from either side is forwarded and ends the flow; a protocol
//! violation answers with a close frame carrying the appropriate code.

use super::{Handoff, ServiceContext, WebsocketContext};
use crate::connection::ConnectionFlow;
use crate::errors::{Error, Result, WebsocketCode};
use crate::websocket::{CloseCode, CloseFrame, CompletedFrame, Endpoint, WebsocketManager};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) async fn run(
  flow: &mut ConnectionFlow,
  ctx: &ServiceContext,
  context: WebsocketContext,
) -> Result<Handoff> {
  let max = ctx.config.max_ws_message_size;
  let mut from_client = WebsocketManager::new(Endpoint::Client, &context.extensions, max);
  let mut from_server = WebsocketManager::new(Endpoint::Server, &context.extensions, max);

  let client = &mut flow.client;
  let server = &mut flow.server;
  let mut client_in = client.take_buffered();
  let mut server_in = server.take_buffered();

  // Frames may already sit behind the upgrade response.
  match relay(&mut from_client, &mut client_in, &mut server.stream).await {
    Ok(true) => return Ok(Handoff::Done),
    Ok(false) => {}
    Err(error) => {
      return fail(error, &mut from_client, &mut from_server, client, server).await;
    }
  }
  match relay(&mut from_server, &mut server_in, &mut client.stream).await {
    Ok(true) => return Ok(Handoff::Done),
    Ok(false) => {}
    Err(error) => {
      return fail(error, &mut from_client, &mut from_server, client, server).await;
    }
  }

  enum Side {
    Client,
    Server,
    Eof,
  }

  loop {
    let side = tokio::select! {
      read = (&mut client.stream).read_buf(&mut client_in) => {
        if read? == 0 { Side::Eof } else { Side::Client }
      }
      read = (&mut server.stream).read_buf(&mut server_in) => {
        if read? == 0 { Side::Eof } else { Side::Server }
      }
    };
    let closed = match side {
      Side::Eof => return Ok(Handoff::Done),
      Side::Client => relay(&mut from_client, &mut client_in, &mut server.stream).await,
      Side::Server => relay(&mut from_server, &mut server_in, &mut client.stream).await,
    };
    match closed {
      Ok(true) => return Ok(Handoff::Done),
      Ok(false) => {}
      Err(error) => {
        return fail(error, &mut from_client, &mut from_server, client, server).await;
      }
    }
  }
}

/// Parses whatever complete frames `input` holds and re-serializes them to
/// `dest`. Returns `true` when a close frame went through.
async fn relay<D>(
  manager: &mut WebsocketManager,
  input: &mut BytesMut,
  dest: &mut D,
) -> Result<bool>
where
  D: AsyncWrite + Unpin,
{
  let frames = manager.parse(input)?;
  let mut closed = false;
  let mut wire = BytesMut::new();
  for frame in &frames {
    if let CompletedFrame::Close(close) = frame {
      tracing::debug!(code = %close.code, reason = %close.reason, "websocket close");
      closed = true;
    }
    manager.serialize(frame, &mut wire)?;
    if closed {
      break;
    }
  }
  if !wire.is_empty() {
    dest.write_all(&wire).await?;
    dest.flush().await?;
  }
  Ok(closed)
}

/// Answers a protocol violation: a close frame with the matching status
/// code goes to both sides, best effort, then the error ends the flow.
async fn fail(
  error: Error,
  from_client: &mut WebsocketManager,
  from_server: &mut WebsocketManager,
  client: &mut crate::connection::ClientConnection,
  server: &mut crate::connection::ServerConnection,
) -> Result<Handoff> {
  let close = CompletedFrame::Close(CloseFrame {
    code: close_code_for(&error),
    reason: String::new(),
  });
  let mut to_client = BytesMut::new();
  if from_server.serialize(&close, &mut to_client).is_ok() {
    let _ = client.stream.write_all(&to_client).await;
  }
  let mut to_server = BytesMut::new();
  if from_client.serialize(&close, &mut to_server).is_ok() {
    let _ = server.stream.write_all(&to_server).await;
  }
  Err(error)
}

/// RFC 6455 §7.4 status for a protocol failure: 1007 for payload
/// problems, 1009 for size violations, 1002 otherwise.
fn close_code_for(error: &Error) -> CloseCode {
  match error {
    Error::Websocket(WebsocketCode::DeflateError) => CloseCode::INVALID_PAYLOAD,
    Error::Websocket(WebsocketCode::PayloadTooLarge) => CloseCode::MESSAGE_TOO_BIG,
    _ => CloseCode::PROTOCOL_ERROR,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn close_codes_map_by_error_kind() {
    assert_eq!(
      close_code_for(&Error::Websocket(WebsocketCode::DeflateError)),
      CloseCode::INVALID_PAYLOAD
    );
    assert_eq!(
      close_code_for(&Error::Websocket(WebsocketCode::PayloadTooLarge)),
      CloseCode::MESSAGE_TOO_BIG
    );
    assert_eq!(
      close_code_for(&Error::Websocket(WebsocketCode::UnexpectedOpcode)),
      CloseCode::PROTOCOL_ERROR
    );
    assert_eq!(
      close_code_for(&Error::Websocket(WebsocketCode::InvalidFrame)),
      CloseCode::PROTOCOL_ERROR
    );
  }
}
