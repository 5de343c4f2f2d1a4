//! WebSocket frame codec.
//!
//! Parses frames off a streambuf and serializes frames onto one. A codec is
//! bound to the endpoint whose wire it reads: frames from the client MUST
//! be masked, frames from the server MUST NOT be (RFC 6455 §5.1), and
//! frames the proxy re-serializes toward the opposite endpoint follow the
//! same rule with a fresh key.

use super::frame::{Endpoint, Frame, Opcode};
use crate::errors::{Result, WebsocketCode};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

/// Frame parser/serializer for one direction of a proxied connection.
#[derive(Debug)]
pub struct FrameCodec {
  origin: Endpoint,
  max_payload: usize,
}

impl FrameCodec {
  /// A codec for frames originating at `origin`.
  pub fn new(origin: Endpoint, max_payload: usize) -> Self {
    FrameCodec { origin, max_payload }
  }

  /// The endpoint this codec reads from.
  pub fn origin(&self) -> Endpoint {
    self.origin
  }

  /// Parses one frame, or returns `None` when `input` does not yet hold a
  /// complete frame. Consumes nothing until a whole frame is available.
  pub fn parse(&self, input: &mut BytesMut) -> Result<Option<Frame>> {
    if input.len() < 2 {
      return Ok(None);
    }
    let b0 = input[0];
    let b1 = input[1];
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    let rsv2 = b0 & 0x20 != 0;
    let rsv3 = b0 & 0x10 != 0;
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;
    let len7 = (b1 & 0x7F) as usize;

    let length_bytes = match len7 {
      126 => 2,
      127 => 8,
      _ => 0,
    };
    let header_len = 2 + length_bytes + if masked { 4 } else { 0 };
    if input.len() < header_len {
      return Ok(None);
    }

    let payload_len = match len7 {
      126 => u16::from_be_bytes([input[2], input[3]]) as u64,
      127 => u64::from_be_bytes([
        input[2], input[3], input[4], input[5], input[6], input[7], input[8], input[9],
      ]),
      n => n as u64,
    };
    if payload_len > self.max_payload as u64 {
      return Err(WebsocketCode::PayloadTooLarge.into());
    }
    let payload_len = payload_len as usize;

    if opcode.is_control() && (!fin || payload_len > 125) {
      return Err(WebsocketCode::InvalidFrame.into());
    }
    if masked != self.origin.masks_frames() {
      return Err(WebsocketCode::InvalidFrame.into());
    }

    if input.len() < header_len + payload_len {
      return Ok(None);
    }

    input.advance(2 + length_bytes);
    let mut mask_key = [0u8; 4];
    if masked {
      mask_key.copy_from_slice(&input.split_to(4));
    }
    let mut payload = input.split_to(payload_len);
    if masked {
      apply_mask(&mut payload, mask_key);
    }

    Ok(Some(Frame {
      fin,
      rsv1,
      rsv2,
      rsv3,
      opcode,
      masked,
      mask_key,
      payload: payload.freeze(),
    }))
  }

  /// Serializes a frame for the wire toward the opposite endpoint.
  ///
  /// Header bits are packed `FIN|RSV1..3|opcode`, then mask bit and
  /// length, then the masking key when this direction masks, then the
  /// payload.
  pub fn serialize(&self, frame: &Frame, output: &mut BytesMut) -> Result<()> {
    if frame.opcode.is_control() && frame.payload.len() > 125 {
      return Err(WebsocketCode::InvalidFrame.into());
    }
    let mut b0 = frame.opcode.as_u8();
    if frame.fin {
      b0 |= 0x80;
    }
    if frame.rsv1 {
      b0 |= 0x40;
    }
    if frame.rsv2 {
      b0 |= 0x20;
    }
    if frame.rsv3 {
      b0 |= 0x10;
    }
    output.put_u8(b0);

    let mask = self.origin.masks_frames();
    let mask_bit = if mask { 0x80u8 } else { 0 };
    let len = frame.payload.len();
    if len <= 125 {
      output.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
      output.put_u8(mask_bit | 126);
      output.put_u16(len as u16);
    } else {
      output.put_u8(mask_bit | 127);
      output.put_u64(len as u64);
    }

    if mask {
      let key: [u8; 4] = rand::thread_rng().gen();
      output.put_slice(&key);
      let start = output.len();
      output.put_slice(&frame.payload);
      apply_mask(&mut output[start..], key);
    } else {
      output.put_slice(&frame.payload);
    }
    Ok(())
  }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
  for (index, byte) in data.iter_mut().enumerate() {
    *byte ^= key[index % 4];
  }
}
