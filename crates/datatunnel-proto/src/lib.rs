//! Datatunnel protocol definitions
//!
//! This crate defines the control-stream message model, the frame codec used
//! to carry it over a byte stream, the binary argument coder for RPC payloads,
//! and the handshake that opens every tunneled TCP connection.

pub mod codec;
pub mod handshake;
pub mod messages;
pub mod rpc;
pub mod value;

pub use codec::{CodecError, ControlCodec};
pub use handshake::{read_handshake, write_handshake, Handshake, HandshakeError};
pub use messages::{Body, ControlStreamMessage, Header, MessageKind, StatusCode};
pub use rpc::{Credential, NewConnectionEvent, ServiceInfo};
pub use value::{ArgList, Json, Message, StructFormat, ValueKind, ValueShape, WireValue};

/// Maximum control-stream frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
