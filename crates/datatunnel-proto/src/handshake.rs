//! Tunnel handshake framing
//!
//! Sent once on every tunneled TCP connection, before any application bytes:
//!
//! ```text
//! fingerprint (8) | version (2) | value count (2) | total value bytes (8)
//! then for each value: length (4) | bytes
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed magic opening every handshake
pub const FINGERPRINT: [u8; 8] = *b"\0Zhiting";

/// Handshake framing version
pub const VERSION: u16 = 1;

/// Size of the fixed header preceding the values
pub const HEADER_SIZE: usize = 20;

/// Upper bound on `total value bytes` accepted from a peer
pub const MAX_VALUES_SIZE: u64 = 1024 * 1024;

const VALUE_LENGTH_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    #[error("unsupported handshake version: {0}")]
    UnsupportedVersion(u16),

    #[error("handshake values too large: {0} bytes")]
    TooLarge(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded handshake: an ordered list of binary values
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Handshake {
    pub values: Vec<Bytes>,
}

impl Handshake {
    pub fn new(values: Vec<Bytes>) -> Self {
        Self { values }
    }

    /// Handshake carrying a single tunnel key
    pub fn with_key(key: impl Into<Bytes>) -> Self {
        Self {
            values: vec![key.into()],
        }
    }

    /// The tunnel key, i.e. the first value
    pub fn key(&self) -> Option<&Bytes> {
        self.values.first()
    }

    pub fn encode(&self) -> Result<Bytes, HandshakeError> {
        if self.values.len() > u16::MAX as usize {
            return Err(HandshakeError::InvalidPackage(format!(
                "too many values: {}",
                self.values.len()
            )));
        }

        let total: usize = self
            .values
            .iter()
            .map(|v| VALUE_LENGTH_SIZE + v.len())
            .sum();
        if total as u64 > MAX_VALUES_SIZE {
            return Err(HandshakeError::TooLarge(total as u64));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + total);
        buf.put_slice(&FINGERPRINT);
        buf.put_u16(VERSION);
        buf.put_u16(self.values.len() as u16);
        buf.put_u64(total as u64);
        for value in &self.values {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }

        Ok(buf.freeze())
    }

    /// Decode a complete handshake frame held in memory
    pub fn decode(frame: &[u8]) -> Result<Self, HandshakeError> {
        if frame.len() < HEADER_SIZE {
            return Err(HandshakeError::InvalidPackage(format!(
                "short header: {} bytes",
                frame.len()
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&frame[..HEADER_SIZE]);
        let (count, total) = parse_header(&header)?;

        let body = &frame[HEADER_SIZE..];
        if body.len() as u64 != total {
            return Err(HandshakeError::InvalidPackage(format!(
                "declared {} value bytes, found {}",
                total,
                body.len()
            )));
        }

        parse_values(body, count)
    }
}

/// Validate the fixed header and return (value count, total value bytes)
fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(u16, u64), HandshakeError> {
    if header[..8] != FINGERPRINT {
        return Err(HandshakeError::InvalidPackage(
            "fingerprint mismatch".to_string(),
        ));
    }

    let mut rest = &header[8..];
    let version = rest.get_u16();
    if version != VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }

    let count = rest.get_u16();
    let total = rest.get_u64();
    if total > MAX_VALUES_SIZE {
        return Err(HandshakeError::TooLarge(total));
    }

    Ok((count, total))
}

fn parse_values(mut body: &[u8], count: u16) -> Result<Handshake, HandshakeError> {
    let mut values = Vec::with_capacity(count as usize);

    for index in 0..count {
        if body.len() < VALUE_LENGTH_SIZE {
            return Err(HandshakeError::InvalidPackage(format!(
                "value {} is missing its length",
                index
            )));
        }
        let length = body.get_u32() as usize;
        if body.len() < length {
            return Err(HandshakeError::InvalidPackage(format!(
                "value {} declares {} bytes, {} remain",
                index,
                length,
                body.len()
            )));
        }
        values.push(Bytes::copy_from_slice(&body[..length]));
        body.advance(length);
    }

    if !body.is_empty() {
        return Err(HandshakeError::InvalidPackage(format!(
            "{} trailing bytes after {} values",
            body.len(),
            count
        )));
    }

    Ok(Handshake { values })
}

/// Write a handshake to a freshly opened connection
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let frame = handshake.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a handshake from a freshly accepted connection
///
/// The fingerprint is checked before any value bytes are read. Exactly the
/// declared number of value bytes is then consumed, so application bytes
/// that follow the handshake stay in the stream.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (count, total) = parse_header(&header)?;

    let mut body = vec![0u8; total as usize];
    reader.read_exact(&mut body).await?;

    parse_values(&body, count)
}
