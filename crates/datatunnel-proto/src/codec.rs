//! Codec for framing control-stream messages on a byte stream

use crate::messages::ControlStreamMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid type: {0}")]
    InvalidType(String),

    #[error("Invalid argument count: expected {expected}, got {got}")]
    InvalidArgNum { expected: usize, got: usize },

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-stream message codec
///
/// Format: `[length: u32 BE][payload: bincode serialized ControlStreamMessage]`
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    const LENGTH_SIZE: usize = 4;

    /// Encode a message into a complete frame
    pub fn encode_frame(msg: &ControlStreamMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > crate::MAX_FRAME_SIZE as usize {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::LENGTH_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed. Consumed bytes are removed
    /// from the buffer only when a whole frame is available.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<ControlStreamMessage>, CodecError> {
        if buf.len() < Self::LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if length > crate::MAX_FRAME_SIZE as usize {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::LENGTH_SIZE + length {
            buf.reserve(Self::LENGTH_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::LENGTH_SIZE);
        let payload = buf.split_to(length);
        let msg = bincode::deserialize(&payload)?;

        Ok(Some(msg))
    }
}

impl Decoder for ControlCodec {
    type Item = ControlStreamMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_frame(src)
    }
}

impl Encoder<ControlStreamMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlStreamMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = Self::encode_frame(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StatusCode;

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlStreamMessage::request(1, "Authenticate", 1, vec![Bytes::from("id")]);
        let encoded = ControlCodec::encode_frame(&msg).unwrap();

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert!(ControlCodec::decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(ControlCodec::decode_frame(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = ControlStreamMessage::notify(3, "NewConnection", 1, vec![]);
        let msg2 = ControlStreamMessage::error_response(3, StatusCode::FORBIDDEN, "denied");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ControlCodec::encode_frame(&msg1).unwrap());
        buf.extend_from_slice(&ControlCodec::encode_frame(&msg2).unwrap());

        let mut codec = ControlCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);
        buf.extend_from_slice(&[0u8; 16]);

        let err = ControlCodec::decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge(_)));
    }

    #[test]
    fn test_encoder_trait_matches_frame() {
        let msg = ControlStreamMessage::response(9, vec![Bytes::from_static(&[0, 0, 0, 1])]);
        let mut dst = BytesMut::new();
        ControlCodec.encode(msg.clone(), &mut dst).unwrap();
        assert_eq!(dst.freeze(), ControlCodec::encode_frame(&msg).unwrap());
    }
}
