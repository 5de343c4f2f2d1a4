//! Frame stream management: folds wire frames into completed units.
//!
//! A manager owns one direction of a proxied WebSocket connection. It
//! drives the frame codec over the input streambuf, reassembles fragmented
//! messages, inflates compressed ones, passes control frames through
//! immediately, and serializes completed units back to wire frames with
//! direction-correct masking.

use super::codec::FrameCodec;
use super::deflate::{MessageDeflater, MessageInflater};
use super::extensions::ExtensionData;
use super::frame::{CloseCode, Endpoint, Frame, Opcode};
use crate::errors::{Result, WebsocketCode};
use bytes::{Bytes, BytesMut};

/// A text or binary payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
  /// UTF-8 text
  Text,
  /// Opaque bytes
  Binary,
}

/// A fully reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
  /// Text or binary
  pub kind: MessageKind,
  /// The defragmented and, when negotiated, inflated payload
  pub payload: Bytes,
  /// Whether the final fragment has been folded in
  pub finished: bool,
}

/// A ping control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
  /// Application payload, at most 125 bytes
  pub payload: Bytes,
}

/// A pong control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongFrame {
  /// Application payload, at most 125 bytes
  pub payload: Bytes,
}

/// A close control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
  /// The parsed status code; [`CloseCode::NO_STATUS_RCVD`] when the
  /// payload was empty
  pub code: CloseCode,
  /// The UTF-8 close reason, possibly empty
  pub reason: String,
}

/// A completed unit delivered to consumers: a reassembled message or a
/// single control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletedFrame {
  /// A reassembled data message
  Message(MessageFrame),
  /// A ping
  Ping(PingFrame),
  /// A pong
  Pong(PongFrame),
  /// A close
  Close(CloseFrame),
}

/// In-progress reassembly of a fragmented message.
#[derive(Debug)]
struct Accumulator {
  kind: MessageKind,
  payload: BytesMut,
  compressed: bool,
}

/// Manager for one direction of a proxied WebSocket connection.
pub struct WebsocketManager {
  codec: FrameCodec,
  accumulator: Option<Accumulator>,
  inflater: Option<MessageInflater>,
  deflater: Option<MessageDeflater>,
  max_message_size: usize,
}

impl WebsocketManager {
  /// A manager for frames originating at `origin`, honoring the extensions
  /// negotiated during the upgrade.
  pub fn new(origin: Endpoint, extensions: &[ExtensionData], max_message_size: usize) -> Self {
    let deflate = extensions
      .iter()
      .find(|e| e.name() == "permessage-deflate");
    let (inflater, deflater) = match deflate {
      Some(ext) => {
        // The compressor whose output we inflate belongs to `origin`; the
        // proxy's own compressor re-serializes toward the opposite side.
        // Both follow the takeover parameter of the originating endpoint.
        let no_takeover = match origin {
          Endpoint::Client => ext.has_param("client_no_context_takeover"),
          Endpoint::Server => ext.has_param("server_no_context_takeover"),
        };
        (
          Some(MessageInflater::new(no_takeover)),
          Some(MessageDeflater::new(no_takeover)),
        )
      }
      None => (None, None),
    };
    WebsocketManager {
      codec: FrameCodec::new(origin, max_message_size),
      accumulator: None,
      inflater,
      deflater,
      max_message_size,
    }
  }

  /// The endpoint this manager reads from.
  pub fn origin(&self) -> Endpoint {
    self.codec.origin()
  }

  /// Parses as many completed frames as `input` allows.
  ///
  /// Stops when the buffer holds no further complete frame, or right after
  /// a close frame; bytes behind a close are left untouched.
  pub fn parse(&mut self, input: &mut BytesMut) -> Result<Vec<CompletedFrame>> {
    let mut completed = Vec::new();
    while let Some(frame) = self.codec.parse(input)? {
      if frame.rsv2 || frame.rsv3 {
        return Err(WebsocketCode::InvalidFrame.into());
      }
      match frame.opcode {
        Opcode::Ping => completed.push(CompletedFrame::Ping(PingFrame {
          payload: frame.payload,
        })),
        Opcode::Pong => completed.push(CompletedFrame::Pong(PongFrame {
          payload: frame.payload,
        })),
        Opcode::Close => {
          completed.push(CompletedFrame::Close(Self::process_close_frame(&frame)?));
          break;
        }
        Opcode::Text | Opcode::Binary => {
          if self.accumulator.is_some() {
            return Err(WebsocketCode::UnexpectedOpcode.into());
          }
          let kind = if frame.opcode == Opcode::Text {
            MessageKind::Text
          } else {
            MessageKind::Binary
          };
          if frame.rsv1 && self.inflater.is_none() {
            return Err(WebsocketCode::InvalidFrame.into());
          }
          if frame.fin {
            let payload = self.finish_payload(frame.payload, frame.rsv1)?;
            completed.push(CompletedFrame::Message(MessageFrame {
              kind,
              payload,
              finished: true,
            }));
          } else {
            self.accumulator = Some(Accumulator {
              kind,
              payload: BytesMut::from(&frame.payload[..]),
              compressed: frame.rsv1,
            });
          }
        }
        Opcode::Continuation => {
          // RSV1 is only legal on the first fragment.
          if frame.rsv1 {
            return Err(WebsocketCode::InvalidFrame.into());
          }
          let accumulator = self
            .accumulator
            .as_mut()
            .ok_or(WebsocketCode::UnexpectedOpcode)?;
          if accumulator.payload.len() + frame.payload.len() > self.max_message_size {
            return Err(WebsocketCode::PayloadTooLarge.into());
          }
          accumulator.payload.extend_from_slice(&frame.payload);
          if frame.fin {
            let accumulator = self.accumulator.take().unwrap();
            let payload =
              self.finish_payload(accumulator.payload.freeze(), accumulator.compressed)?;
            completed.push(CompletedFrame::Message(MessageFrame {
              kind: accumulator.kind,
              payload,
              finished: true,
            }));
          }
        }
      }
    }
    Ok(completed)
  }

  /// Serializes a completed unit onto `output` as a single wire frame, with
  /// masking decided by the direction and deflation applied when
  /// negotiated.
  pub fn serialize(&mut self, frame: &CompletedFrame, output: &mut BytesMut) -> Result<()> {
    match frame {
      CompletedFrame::Message(message) => {
        let opcode = match message.kind {
          MessageKind::Text => Opcode::Text,
          MessageKind::Binary => Opcode::Binary,
        };
        let mut wire = Frame::new(opcode, message.payload.clone());
        if let Some(deflater) = &mut self.deflater {
          wire.payload = deflater.deflate(&message.payload)?;
          wire.rsv1 = true;
        }
        self.codec.serialize(&wire, output)
      }
      CompletedFrame::Ping(ping) => {
        self
          .codec
          .serialize(&Frame::new(Opcode::Ping, ping.payload.clone()), output)
      }
      CompletedFrame::Pong(pong) => {
        self
          .codec
          .serialize(&Frame::new(Opcode::Pong, pong.payload.clone()), output)
      }
      CompletedFrame::Close(close) => {
        self
          .codec
          .serialize(&Frame::close(close.code, &close.reason), output)
      }
    }
  }

  fn finish_payload(&mut self, payload: Bytes, compressed: bool) -> Result<Bytes> {
    if payload.len() > self.max_message_size {
      return Err(WebsocketCode::PayloadTooLarge.into());
    }
    if compressed {
      let inflater = self
        .inflater
        .as_mut()
        .ok_or(WebsocketCode::InvalidFrame)?;
      inflater.inflate(&payload, self.max_message_size)
    } else {
      Ok(payload)
    }
  }

  /// Applies RFC 6455 §5.5.1 to a close payload: empty means no status was
  /// received, one byte is malformed, otherwise a big-endian code followed
  /// by a UTF-8 reason.
  fn process_close_frame(frame: &Frame) -> Result<CloseFrame> {
    match frame.payload.len() {
      0 => Ok(CloseFrame {
        code: CloseCode::NO_STATUS_RCVD,
        reason: String::new(),
      }),
      1 => Err(WebsocketCode::InvalidFrame.into()),
      _ => {
        let code = CloseCode(u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
        let reason = String::from_utf8_lossy(&frame.payload[2..]).into_owned();
        Ok(CloseFrame { code, reason })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;

  const MAX: usize = 1 << 20;

  fn wire_frame(fin: bool, rsv1: bool, opcode: Opcode, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    let frame = Frame {
      fin,
      rsv1,
      rsv2: false,
      rsv3: false,
      opcode,
      masked: false,
      mask_key: [0; 4],
      payload: Bytes::copy_from_slice(payload),
    };
    FrameCodec::new(Endpoint::Server, MAX)
      .serialize(&frame, &mut out)
      .unwrap();
    out
  }

  fn server_manager() -> WebsocketManager {
    WebsocketManager::new(Endpoint::Server, &[], MAX)
  }

  #[test]
  fn single_frame_messages_complete_immediately() {
    let mut manager = server_manager();
    let mut input = wire_frame(true, false, Opcode::Text, b"hi");
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(
      frames,
      vec![CompletedFrame::Message(MessageFrame {
        kind: MessageKind::Text,
        payload: Bytes::from_static(b"hi"),
        finished: true,
      })]
    );
  }

  #[test]
  fn fragmented_messages_are_reassembled() {
    let mut manager = server_manager();
    let mut input = BytesMut::new();
    input.extend_from_slice(&wire_frame(false, false, Opcode::Text, b"foo"));
    input.extend_from_slice(&wire_frame(false, false, Opcode::Continuation, b"bar"));
    input.extend_from_slice(&wire_frame(true, false, Opcode::Continuation, b"baz"));
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(frames.len(), 1);
    match &frames[0] {
      CompletedFrame::Message(message) => {
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(&message.payload[..], b"foobarbaz");
        assert!(message.finished);
      }
      other => panic!("expected a message, got {:?}", other),
    }
  }

  #[test]
  fn control_frames_interleave_without_disturbing_reassembly() {
    let mut manager = server_manager();
    let mut input = BytesMut::new();
    input.extend_from_slice(&wire_frame(false, false, Opcode::Text, b"fir"));
    input.extend_from_slice(&wire_frame(true, false, Opcode::Ping, b"check"));
    input.extend_from_slice(&wire_frame(true, false, Opcode::Continuation, b"st"));
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(
      frames[0],
      CompletedFrame::Ping(PingFrame {
        payload: Bytes::from_static(b"check")
      })
    );
    match &frames[1] {
      CompletedFrame::Message(message) => assert_eq!(&message.payload[..], b"first"),
      other => panic!("expected a message, got {:?}", other),
    }
  }

  #[test]
  fn a_second_data_frame_mid_message_is_unexpected() {
    let mut manager = server_manager();
    let mut input = BytesMut::new();
    input.extend_from_slice(&wire_frame(false, false, Opcode::Text, b"a"));
    input.extend_from_slice(&wire_frame(true, false, Opcode::Binary, b"b"));
    let err = manager.parse(&mut input).unwrap_err();
    assert_eq!(err, Error::Websocket(WebsocketCode::UnexpectedOpcode));
  }

  #[test]
  fn continuation_without_a_message_is_unexpected() {
    let mut manager = server_manager();
    let mut input = wire_frame(true, false, Opcode::Continuation, b"x");
    let err = manager.parse(&mut input).unwrap_err();
    assert_eq!(err, Error::Websocket(WebsocketCode::UnexpectedOpcode));
  }

  #[test]
  fn close_with_code_and_reason() {
    let mut manager = server_manager();
    let mut payload = 1000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"bye");
    let mut input = wire_frame(true, false, Opcode::Close, &payload);
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(
      frames,
      vec![CompletedFrame::Close(CloseFrame {
        code: CloseCode::NORMAL,
        reason: "bye".to_string(),
      })]
    );
  }

  #[test]
  fn empty_close_payload_means_no_status_received() {
    let mut manager = server_manager();
    let mut input = wire_frame(true, false, Opcode::Close, b"");
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(
      frames,
      vec![CompletedFrame::Close(CloseFrame {
        code: CloseCode::NO_STATUS_RCVD,
        reason: String::new(),
      })]
    );
  }

  #[test]
  fn one_byte_close_payload_is_invalid() {
    let mut manager = server_manager();
    let mut input = wire_frame(true, false, Opcode::Close, &[0x03]);
    let err = manager.parse(&mut input).unwrap_err();
    assert_eq!(err, Error::Websocket(WebsocketCode::InvalidFrame));
  }

  #[test]
  fn frames_after_a_close_stay_buffered() {
    let mut manager = server_manager();
    let mut input = BytesMut::new();
    input.extend_from_slice(&wire_frame(true, false, Opcode::Close, b""));
    let trailing = wire_frame(true, false, Opcode::Text, b"late");
    input.extend_from_slice(&trailing);
    let frames = manager.parse(&mut input).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(&input[..], &trailing[..]);
  }

  #[test]
  fn compressed_messages_inflate_on_parse_and_deflate_on_serialize() {
    let extensions = vec![ExtensionData::new("permessage-deflate")];
    // Two managers on the same direction simulate the peer's compressor
    // and the proxy's decompressor sharing negotiated parameters.
    let mut sender = WebsocketManager::new(Endpoint::Server, &extensions, MAX);
    let mut receiver = WebsocketManager::new(Endpoint::Server, &extensions, MAX);

    let message = CompletedFrame::Message(MessageFrame {
      kind: MessageKind::Text,
      payload: Bytes::from_static(b"inflate me, inflate me, inflate me"),
      finished: true,
    });
    let mut wire = BytesMut::new();
    sender.serialize(&message, &mut wire).unwrap();

    let frames = receiver.parse(&mut wire).unwrap();
    assert_eq!(frames, vec![message]);
  }

  #[test]
  fn rsv1_without_negotiated_deflate_is_invalid() {
    let mut manager = server_manager();
    let mut input = wire_frame(true, true, Opcode::Text, b"\x00");
    let err = manager.parse(&mut input).unwrap_err();
    assert_eq!(err, Error::Websocket(WebsocketCode::InvalidFrame));
  }

  #[test]
  fn oversized_reassembled_messages_are_rejected() {
    let mut manager = WebsocketManager::new(Endpoint::Server, &[], 8);
    let mut input = BytesMut::new();
    input.extend_from_slice(&wire_frame(false, false, Opcode::Binary, b"12345"));
    input.extend_from_slice(&wire_frame(true, false, Opcode::Continuation, b"67890"));
    let err = manager.parse(&mut input).unwrap_err();
    assert_eq!(err, Error::Websocket(WebsocketCode::PayloadTooLarge));
  }

  #[test]
  fn close_frames_serialize_their_code_and_reason() {
    let mut manager = server_manager();
    let mut wire = BytesMut::new();
    manager
      .serialize(
        &CompletedFrame::Close(CloseFrame {
          code: CloseCode::NORMAL,
          reason: "done".to_string(),
        }),
        &mut wire,
      )
      .unwrap();
    let parsed = manager.parse(&mut wire).unwrap();
    assert_eq!(
      parsed,
      vec![CompletedFrame::Close(CloseFrame {
        code: CloseCode::NORMAL,
        reason: "done".to_string(),
      })]
    );
  }

  #[test]
  fn no_status_close_serializes_an_empty_payload() {
    let mut manager = server_manager();
    let mut wire = BytesMut::new();
    manager
      .serialize(
        &CompletedFrame::Close(CloseFrame {
          code: CloseCode::NO_STATUS_RCVD,
          reason: String::new(),
        }),
        &mut wire,
      )
      .unwrap();
    // Header only: an empty close frame is two bytes on the server wire.
    assert_eq!(&wire[..], &[0x88, 0x00]);
  }
}
