//! WebSocket framing, extension negotiation, and message reassembly
//! (RFC 6455, with permessage-deflate per RFC 7692).

mod codec;
mod deflate;
mod extensions;
mod frame;
mod manager;

pub use codec::FrameCodec;
pub use deflate::{MessageDeflater, MessageInflater};
pub use extensions::ExtensionData;
pub use frame::{CloseCode, Endpoint, Frame, Opcode};
pub use manager::{
  CloseFrame, CompletedFrame, MessageFrame, MessageKind, PingFrame, PongFrame, WebsocketManager,
};
