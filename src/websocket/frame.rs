//! WebSocket wire frame model.

use crate::errors::{Result, WebsocketCode};
use bytes::Bytes;
use std::fmt;

/// An endpoint of the WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
  /// The downstream browser or client program
  Client,
  /// The upstream real server
  Server,
}

impl Endpoint {
  /// The opposite endpoint.
  pub fn flip(self) -> Endpoint {
    match self {
      Endpoint::Client => Endpoint::Server,
      Endpoint::Server => Endpoint::Client,
    }
  }

  /// Whether frames originating here must be masked on the wire.
  pub fn masks_frames(self) -> bool {
    self == Endpoint::Client
  }
}

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
  /// Continuation of a fragmented message
  Continuation,
  /// Text message data
  Text,
  /// Binary message data
  Binary,
  /// Connection close
  Close,
  /// Ping
  Ping,
  /// Pong
  Pong,
}

impl Opcode {
  /// Decodes the low nibble of the first frame byte.
  pub fn from_u8(value: u8) -> Result<Opcode> {
    match value {
      0x0 => Ok(Opcode::Continuation),
      0x1 => Ok(Opcode::Text),
      0x2 => Ok(Opcode::Binary),
      0x8 => Ok(Opcode::Close),
      0x9 => Ok(Opcode::Ping),
      0xA => Ok(Opcode::Pong),
      _ => Err(WebsocketCode::InvalidOpcode.into()),
    }
  }

  /// The wire nibble.
  pub fn as_u8(self) -> u8 {
    match self {
      Opcode::Continuation => 0x0,
      Opcode::Text => 0x1,
      Opcode::Binary => 0x2,
      Opcode::Close => 0x8,
      Opcode::Ping => 0x9,
      Opcode::Pong => 0xA,
    }
  }

  /// Whether this is a control opcode (close, ping, pong).
  pub fn is_control(self) -> bool {
    matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
  }
}

/// A close status code (RFC 6455 §7.4).
///
/// The set is open-ended: registered and private-use codes pass through
/// unchanged, so this is a thin wrapper rather than a closed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
  /// 1000, normal closure.
  pub const NORMAL: CloseCode = CloseCode(1000);
  /// 1001, going away.
  pub const GOING_AWAY: CloseCode = CloseCode(1001);
  /// 1002, protocol error.
  pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
  /// 1005, reserved: no status code was present. Never sent on the wire.
  pub const NO_STATUS_RCVD: CloseCode = CloseCode(1005);
  /// 1007, payload inconsistent with message type.
  pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
  /// 1009, message too big.
  pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);

  /// The numeric value.
  pub fn value(self) -> u16 {
    self.0
  }

  /// Whether this code may be written to the wire (1005 and 1006 are
  /// reserved for local use).
  pub fn is_sendable(self) -> bool {
    !matches!(self.0, 1005 | 1006)
  }
}

impl fmt::Display for CloseCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A single parsed WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  /// Final fragment flag
  pub fin: bool,
  /// Extension bit 1; permessage-deflate marks compressed messages here
  pub rsv1: bool,
  /// Extension bit 2
  pub rsv2: bool,
  /// Extension bit 3
  pub rsv3: bool,
  /// Frame opcode
  pub opcode: Opcode,
  /// Whether the payload arrived masked
  pub masked: bool,
  /// The masking key, meaningful only when `masked`
  pub mask_key: [u8; 4],
  /// The unmasked payload
  pub payload: Bytes,
}

impl Frame {
  /// A complete unfragmented data or control frame.
  pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Frame {
    Frame {
      fin: true,
      rsv1: false,
      rsv2: false,
      rsv3: false,
      opcode,
      masked: false,
      mask_key: [0; 4],
      payload: payload.into(),
    }
  }

  /// A close frame; the code is omitted from the payload when it cannot be
  /// sent on the wire (RFC 6455 §7.4.1).
  pub fn close(code: CloseCode, reason: &str) -> Frame {
    let payload = if code.is_sendable() {
      let mut bytes = Vec::with_capacity(2 + reason.len());
      bytes.extend_from_slice(&code.value().to_be_bytes());
      bytes.extend_from_slice(reason.as_bytes());
      Bytes::from(bytes)
    } else {
      Bytes::new()
    };
    Frame::new(Opcode::Close, payload)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn opcode_nibbles_round_trip() {
    for value in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
      assert_eq!(Opcode::from_u8(value).unwrap().as_u8(), value);
    }
    for reserved in [0x3u8, 0x7, 0xB, 0xF] {
      assert!(Opcode::from_u8(reserved).is_err());
    }
  }

  #[test]
  fn control_opcodes_are_classified() {
    assert!(Opcode::Close.is_control());
    assert!(Opcode::Ping.is_control());
    assert!(Opcode::Pong.is_control());
    assert!(!Opcode::Text.is_control());
    assert!(!Opcode::Continuation.is_control());
  }

  #[test]
  fn unsendable_close_codes_produce_empty_payloads() {
    let frame = Frame::close(CloseCode::NO_STATUS_RCVD, "ignored");
    assert!(frame.payload.is_empty());

    let frame = Frame::close(CloseCode::NORMAL, "bye");
    assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
    assert_eq!(&frame.payload[2..], b"bye");
  }
}
