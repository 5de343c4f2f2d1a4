//! Opaque byte tunneling between the two halves of a flow.

use super::Handoff;
use crate::connection::ConnectionFlow;
use crate::errors::{ProxyCode, Result};
use tokio::io::{AsyncWriteExt, copy};

/// Copies bytes in both directions until either side closes.
///
/// Bytes already buffered from protocol sniffing are flushed to the
/// opposite side before the copy loops start.
pub(crate) async fn run(flow: &mut ConnectionFlow) -> Result<Handoff> {
  if !flow.server.connected() {
    return Err(ProxyCode::ServerNotConnected.into());
  }

  let buffered = flow.client.take_buffered();
  if !buffered.is_empty() {
    flow.server.stream.write_all(&buffered).await?;
  }
  let buffered = flow.server.take_buffered();
  if !buffered.is_empty() {
    flow.client.stream.write_all(&buffered).await?;
  }

  let (mut client_read, mut client_write) = tokio::io::split(&mut flow.client.stream);
  let (mut server_read, mut server_write) = tokio::io::split(&mut flow.server.stream);

  let client_to_server = copy(&mut client_read, &mut server_write);
  let server_to_client = copy(&mut server_read, &mut client_write);

  tokio::select! {
    _ = client_to_server => {},
    _ = server_to_client => {},
  }

  Ok(Handoff::Done)
}
