//! permessage-deflate message transforms (RFC 7692).
//!
//! Compression operates on reassembled message payloads, not individual
//! frames. The sender strips the trailing `0x00 0x00 0xFF 0xFF` of each
//! sync flush; the receiver appends it back before inflating. The
//! `*_no_context_takeover` parameters reset the codec state between
//! messages.

use crate::errors::{Result, WebsocketCode};
use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Sync-flush trailer removed from and restored to every message.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Inflates message payloads, keeping the sliding window between messages
/// unless context takeover was disabled.
#[derive(Debug)]
pub struct MessageInflater {
  inner: Decompress,
  reset_context: bool,
}

impl MessageInflater {
  /// `reset_context` mirrors the negotiated `*_no_context_takeover`
  /// parameter for the compressing endpoint.
  pub fn new(reset_context: bool) -> Self {
    MessageInflater {
      inner: Decompress::new(false),
      reset_context,
    }
  }

  /// Inflates one message payload, bounded by `max_size`.
  pub fn inflate(&mut self, payload: &[u8], max_size: usize) -> Result<Bytes> {
    let mut data = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
    data.extend_from_slice(payload);
    data.extend_from_slice(&DEFLATE_TAIL);

    let mut output = Vec::with_capacity(payload.len().saturating_mul(2).max(256));
    let mut consumed = 0usize;
    loop {
      let before_in = self.inner.total_in();
      if output.len() == output.capacity() {
        output.reserve(output.capacity().max(1024));
      }
      let status = self
        .inner
        .decompress_vec(&data[consumed..], &mut output, FlushDecompress::Sync)
        .map_err(|_| WebsocketCode::DeflateError)?;
      consumed += (self.inner.total_in() - before_in) as usize;
      if output.len() > max_size {
        return Err(WebsocketCode::PayloadTooLarge.into());
      }
      match status {
        Status::StreamEnd => break,
        Status::Ok | Status::BufError => {
          if consumed >= data.len() && output.len() < output.capacity() {
            break;
          }
        }
      }
    }
    if self.reset_context {
      self.inner.reset(false);
    }
    Ok(Bytes::from(output))
  }
}

/// Deflates message payloads, symmetric to [`MessageInflater`].
#[derive(Debug)]
pub struct MessageDeflater {
  inner: Compress,
  reset_context: bool,
}

impl MessageDeflater {
  /// `reset_context` mirrors the negotiated `*_no_context_takeover`
  /// parameter for this direction.
  pub fn new(reset_context: bool) -> Self {
    MessageDeflater {
      inner: Compress::new(Compression::default(), false),
      reset_context,
    }
  }

  /// Deflates one message payload, stripping the sync-flush trailer.
  pub fn deflate(&mut self, payload: &[u8]) -> Result<Bytes> {
    let mut output = Vec::with_capacity(payload.len() / 2 + 64);
    let mut consumed = 0usize;
    loop {
      let before_in = self.inner.total_in();
      if output.len() == output.capacity() {
        output.reserve(output.capacity().max(1024));
      }
      let status = self
        .inner
        .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
        .map_err(|_| WebsocketCode::DeflateError)?;
      consumed += (self.inner.total_in() - before_in) as usize;
      match status {
        Status::StreamEnd => break,
        Status::Ok | Status::BufError => {
          if consumed >= payload.len() && output.len() < output.capacity() {
            break;
          }
        }
      }
    }
    if output.ends_with(&DEFLATE_TAIL) {
      output.truncate(output.len() - DEFLATE_TAIL.len());
    }
    if self.reset_context {
      self.inner.reset();
    }
    Ok(Bytes::from(output))
  }
}
