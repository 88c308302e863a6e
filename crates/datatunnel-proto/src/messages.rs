//! Control-stream message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a control-stream message
///
/// Carried on the wire as a raw `u8` so that a peer speaking a newer
/// protocol revision can be answered with `UNKNOWN_MESSAGE_TYPE` instead of
/// failing frame decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Notify = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Response),
            2 => Ok(MessageKind::Notify),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => f.write_str("REQUEST"),
            MessageKind::Response => f.write_str("RESPONSE"),
            MessageKind::Notify => f.write_str("NOTIFY"),
        }
    }
}

/// Wire-level status code carried on RESPONSE messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    pub const SERVER_ERROR: StatusCode = StatusCode(1);
    pub const UNKNOWN_MESSAGE_TYPE: StatusCode = StatusCode(2);
    pub const FORBIDDEN: StatusCode = StatusCode(3);
    pub const METHOD_NOT_FOUND: StatusCode = StatusCode(4);
    pub const VERSION_NOT_SUPPORTED: StatusCode = StatusCode(5);
    pub const INVALID_ARG_NUM: StatusCode = StatusCode(6);
    pub const INVALID_ARG_TYPE: StatusCode = StatusCode(7);

    /// First code available to application handlers
    pub const APPLICATION_BASE: u32 = 10000;

    /// The long-term credential presented to `Authenticate` was rejected
    pub const INVALID_CREDENTIAL: StatusCode = StatusCode(Self::APPLICATION_BASE + 1);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    pub fn is_application(&self) -> bool {
        self.0 >= Self::APPLICATION_BASE
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            StatusCode::OK => "ok",
            StatusCode::SERVER_ERROR => "server error",
            StatusCode::UNKNOWN_MESSAGE_TYPE => "unknown message type",
            StatusCode::FORBIDDEN => "forbidden",
            StatusCode::METHOD_NOT_FOUND => "method not found",
            StatusCode::VERSION_NOT_SUPPORTED => "version not supported",
            StatusCode::INVALID_ARG_NUM => "invalid arg count",
            StatusCode::INVALID_ARG_TYPE => "invalid arg type",
            StatusCode::INVALID_CREDENTIAL => "invalid credential",
            _ if self.is_application() => "application error",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.as_str())
    }
}

/// Message header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Raw [`MessageKind`] discriminant
    pub kind: u8,
    /// Assigned by the sender of a REQUEST or NOTIFY, echoed on the RESPONSE
    pub id: u64,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Body {
    /// Registered overload to invoke; 0 selects the highest registered version
    pub version: u32,
    pub method: String,
    /// One opaque payload per positional argument or return value
    pub values: Vec<Bytes>,
    /// Only meaningful on RESPONSE
    pub status_code: StatusCode,
    pub reason: String,
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::OK
    }
}

/// The framed unit exchanged on the control stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStreamMessage {
    pub header: Header,
    pub body: Body,
}

impl ControlStreamMessage {
    pub fn request(id: u64, method: &str, version: u32, values: Vec<Bytes>) -> Self {
        Self::call(MessageKind::Request, id, method, version, values)
    }

    pub fn notify(id: u64, method: &str, version: u32, values: Vec<Bytes>) -> Self {
        Self::call(MessageKind::Notify, id, method, version, values)
    }

    fn call(kind: MessageKind, id: u64, method: &str, version: u32, values: Vec<Bytes>) -> Self {
        Self {
            header: Header {
                kind: kind as u8,
                id,
            },
            body: Body {
                version,
                method: method.to_string(),
                values,
                ..Body::default()
            },
        }
    }

    /// Successful RESPONSE carrying the encoded return values
    pub fn response(id: u64, values: Vec<Bytes>) -> Self {
        Self {
            header: Header {
                kind: MessageKind::Response as u8,
                id,
            },
            body: Body {
                values,
                ..Body::default()
            },
        }
    }

    /// Failed RESPONSE carrying a status code and reason
    pub fn error_response(id: u64, status_code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            header: Header {
                kind: MessageKind::Response as u8,
                id,
            },
            body: Body {
                status_code,
                reason: reason.into(),
                ..Body::default()
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    /// Decoded message kind, or the raw discriminant if it is unknown
    pub fn kind(&self) -> Result<MessageKind, u8> {
        MessageKind::try_from(self.header.kind)
    }

    pub fn method(&self) -> &str {
        &self.body.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ControlStreamMessage::request(
            7,
            "Authenticate",
            1,
            vec![Bytes::from_static(b"abc"), Bytes::new()],
        );
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlStreamMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
        assert_eq!(deserialized.kind(), Ok(MessageKind::Request));
        assert_eq!(deserialized.id(), 7);
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let mut msg = ControlStreamMessage::notify(1, "NewConnection", 1, vec![]);
        msg.header.kind = 9;

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlStreamMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized.kind(), Err(9));
    }

    #[test]
    fn test_error_response() {
        let msg = ControlStreamMessage::error_response(42, StatusCode::FORBIDDEN, "nope");
        assert_eq!(msg.kind(), Ok(MessageKind::Response));
        assert_eq!(msg.body.status_code, StatusCode::FORBIDDEN);
        assert_eq!(msg.body.reason, "nope");
        assert!(msg.body.values.is_empty());
    }

    #[test]
    fn test_status_code_classes() {
        assert!(StatusCode::OK.is_ok());
        assert!(!StatusCode::SERVER_ERROR.is_ok());
        assert!(StatusCode::INVALID_CREDENTIAL.is_application());
        assert!(!StatusCode::INVALID_ARG_TYPE.is_application());
        assert_eq!(StatusCode(10042).as_str(), "application error");
        assert!(StatusCode::METHOD_NOT_FOUND
            .to_string()
            .contains("method not found"));
    }
}
