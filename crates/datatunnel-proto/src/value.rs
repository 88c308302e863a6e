//! Binary argument coder
//!
//! Every RPC argument and return value travels as one opaque byte payload.
//! The encoding is chosen by the Rust type at each position:
//!
//! - `String`: raw UTF-8, no framing
//! - `i32` / `u32`: 4 bytes big-endian
//! - other scalars (`bool`, `u8`..`u64`, `i8`..`i64`, `f32`, `f64`):
//!   big-endian binary of their natural width
//! - `Bytes`: raw binary, passed through untouched
//! - [`Message<T>`]: structured, serialized with bincode
//! - [`Json<T>`]: structured, serialized as JSON
//! - `Vec<T>` of any serde type: bincode, allowed only as the outermost type
//! - `Option<T>`: a tag byte (0 = `None`, 1 = `Some`) followed by the inner
//!   payload, so `Some` of an empty value stays distinct from `None`
//! - `Box<T>`: unwrapped before encoding and rewrapped after decoding
//!
//! Types outside this set (maps, channels, closures, nested optionals) do not
//! implement [`WireValue`] and are rejected when a handler or caller is
//! declared, not when a message arrives.

use crate::codec::CodecError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializer used for structured values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructFormat {
    Binary,
    Json,
}

/// Encoding strategy selected for a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Int32,
    /// Fixed-width big-endian scalar of the given byte width
    Scalar(u8),
    Raw,
    Structured(StructFormat),
    /// List encoded as a whole with bincode
    Sequence,
}

/// Declared shape of one argument or return position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueShape {
    pub kind: ValueKind,
    pub optional: bool,
}

impl ValueShape {
    pub const fn required(kind: ValueKind) -> Self {
        Self {
            kind,
            optional: false,
        }
    }
}

/// A value that can be carried as a single RPC payload
pub trait WireValue: Sized + Send + 'static {
    fn shape() -> ValueShape;

    fn encode(&self) -> Result<Bytes, CodecError>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Marker for values that are not themselves a pointer wrapper
///
/// Only these may be wrapped in `Option` or `Box`, which keeps indirection
/// at most one level deep.
pub trait Direct: WireValue {}

fn expect_width<const N: usize>(bytes: &[u8], ty: &str) -> Result<[u8; N], CodecError> {
    bytes.try_into().map_err(|_| {
        CodecError::InvalidType(format!(
            "expected {} bytes for {}, got {}",
            N,
            ty,
            bytes.len()
        ))
    })
}

impl WireValue for String {
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Text)
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::InvalidType(format!("text is not valid UTF-8: {}", e)))
    }
}
impl Direct for String {}

macro_rules! impl_scalar {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl WireValue for $ty {
                fn shape() -> ValueShape {
                    ValueShape::required($kind)
                }

                fn encode(&self) -> Result<Bytes, CodecError> {
                    Ok(Bytes::copy_from_slice(&self.to_be_bytes()))
                }

                fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    Ok(<$ty>::from_be_bytes(expect_width(bytes, stringify!($ty))?))
                }
            }
            impl Direct for $ty {}
        )*
    };
}

impl_scalar! {
    i32 => ValueKind::Int32,
    u32 => ValueKind::Int32,
    u8 => ValueKind::Scalar(1),
    i8 => ValueKind::Scalar(1),
    u16 => ValueKind::Scalar(2),
    i16 => ValueKind::Scalar(2),
    u64 => ValueKind::Scalar(8),
    i64 => ValueKind::Scalar(8),
    f32 => ValueKind::Scalar(4),
    f64 => ValueKind::Scalar(8),
}

impl WireValue for bool {
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Scalar(1))
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(&[u8::from(*self)]))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let [b] = expect_width::<1>(bytes, "bool")?;
        Ok(b != 0)
    }
}
impl Direct for bool {}

impl WireValue for Bytes {
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Raw)
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
impl Direct for Bytes {}

/// Structured value serialized with bincode
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message<T>(pub T);

impl<T> WireValue for Message<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Structured(StructFormat::Binary))
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(&self.0)?))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Message(bincode::deserialize(bytes)?))
    }
}
impl<T> Direct for Message<T> where T: Serialize + DeserializeOwned + Send + 'static {}

/// Structured value serialized as JSON, for types without a binary schema
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> WireValue for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Structured(StructFormat::Json))
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}
impl<T> Direct for Json<T> where T: Serialize + DeserializeOwned + Send + 'static {}

/// Implements [`WireValue`] for a serde type using the binary serializer,
/// so it can be used directly as an argument without the [`Message`] wrapper.
#[macro_export]
macro_rules! wire_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::value::WireValue for $ty {
                fn shape() -> $crate::value::ValueShape {
                    $crate::value::ValueShape::required($crate::value::ValueKind::Structured(
                        $crate::value::StructFormat::Binary,
                    ))
                }

                fn encode(&self) -> Result<::bytes::Bytes, $crate::codec::CodecError> {
                    Ok(::bytes::Bytes::from(::bincode::serialize(self)?))
                }

                fn decode(bytes: &[u8]) -> Result<Self, $crate::codec::CodecError> {
                    Ok(::bincode::deserialize(bytes)?)
                }
            }
            impl $crate::value::Direct for $ty {}
        )*
    };
}

impl<T> WireValue for Vec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn shape() -> ValueShape {
        ValueShape::required(ValueKind::Sequence)
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Leading byte of an encoded `Option`
const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

impl<T: Direct> WireValue for Option<T> {
    fn shape() -> ValueShape {
        ValueShape {
            optional: true,
            ..T::shape()
        }
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            Some(value) => {
                let inner = value.encode()?;
                let mut buf = BytesMut::with_capacity(1 + inner.len());
                buf.put_u8(PRESENT);
                buf.extend_from_slice(&inner);
                Ok(buf.freeze())
            }
            None => Ok(Bytes::from_static(&[ABSENT])),
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.split_first() {
            Some((&PRESENT, rest)) => T::decode(rest).map(Some),
            Some((&ABSENT, [])) => Ok(None),
            Some((&ABSENT, rest)) => Err(CodecError::InvalidType(format!(
                "absent optional carries {} trailing bytes",
                rest.len()
            ))),
            Some((tag, _)) => Err(CodecError::InvalidType(format!(
                "invalid optional tag {}",
                tag
            ))),
            None => Err(CodecError::InvalidType(
                "optional value is missing its tag".to_string(),
            )),
        }
    }
}

impl<T: Direct> WireValue for Box<T> {
    fn shape() -> ValueShape {
        T::shape()
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        (**self).encode()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        T::decode(bytes).map(Box::new)
    }
}

/// An ordered list of positional values, expressed as a tuple
pub trait ArgList: Sized + Send + 'static {
    fn shape() -> Vec<ValueShape>;

    fn encode_all(&self) -> Result<Vec<Bytes>, CodecError>;

    fn decode_all(values: &[Bytes]) -> Result<Self, CodecError>;
}

impl ArgList for () {
    fn shape() -> Vec<ValueShape> {
        Vec::new()
    }

    fn encode_all(&self) -> Result<Vec<Bytes>, CodecError> {
        Ok(Vec::new())
    }

    fn decode_all(values: &[Bytes]) -> Result<Self, CodecError> {
        if !values.is_empty() {
            return Err(CodecError::InvalidArgNum {
                expected: 0,
                got: values.len(),
            });
        }
        Ok(())
    }
}

fn at_position(position: usize, err: CodecError) -> CodecError {
    match err {
        CodecError::InvalidType(detail) => {
            CodecError::InvalidType(format!("value {}: {}", position, detail))
        }
        CodecError::Serialization(e) => {
            CodecError::InvalidType(format!("value {}: {}", position, e))
        }
        CodecError::Json(e) => CodecError::InvalidType(format!("value {}: {}", position, e)),
        other => other,
    }
}

macro_rules! impl_arg_list {
    ($len:expr; $($ty:ident $idx:tt),+) => {
        impl<$($ty: WireValue),+> ArgList for ($($ty,)+) {
            fn shape() -> Vec<ValueShape> {
                vec![$($ty::shape()),+]
            }

            fn encode_all(&self) -> Result<Vec<Bytes>, CodecError> {
                Ok(vec![$(self.$idx.encode().map_err(|e| at_position($idx, e))?),+])
            }

            fn decode_all(values: &[Bytes]) -> Result<Self, CodecError> {
                if values.len() != $len {
                    return Err(CodecError::InvalidArgNum {
                        expected: $len,
                        got: values.len(),
                    });
                }
                Ok(($($ty::decode(&values[$idx]).map_err(|e| at_position($idx, e))?,)+))
            }
        }
    };
}

impl_arg_list!(1; A 0);
impl_arg_list!(2; A 0, B 1);
impl_arg_list!(3; A 0, B 1, C 2);
impl_arg_list!(4; A 0, B 1, C 2, D 3);
impl_arg_list!(5; A 0, B 1, C 2, D 3, E 4);
impl_arg_list!(6; A 0, B 1, C 2, D 3, E 4, F 5);
