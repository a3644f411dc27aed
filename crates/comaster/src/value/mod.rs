// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type-erased register value.
//!
//! A [`Value`] holds exactly one of the scalar kinds a register can declare,
//! or an owned string. It always knows its own [`Kind`]:
//!
//! - [`Value::get`] extracts only through the stored kind (no implicit cast).
//! - [`Value::convert_to`] applies the checked conversion table in
//!   [`convert`] and either produces an exact result or an error.
//!
//! # Example
//!
//! ```
//! use comaster::value::{Kind, Value};
//!
//! let v = Value::from(300u16);
//! assert_eq!(v.get::<u16>().unwrap(), 300);
//! assert!(v.get::<i32>().is_err());                 // wrong kind
//! assert!(v.convert_to(Kind::UInt8).is_err());      // 300 does not fit u8
//! assert_eq!(v.convert::<i32>().unwrap(), 300);     // widening is fine
//! ```

pub mod convert;

use crate::error::{Error, Result};
use std::fmt;

/// Declared scalar kind of a register (or of a [`Value`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Signed 8-bit.
    Int8,
    /// Signed 16-bit.
    Int16,
    /// Signed 32-bit.
    Int32,
    /// Signed 64-bit.
    Int64,
    /// Unsigned 8-bit.
    UInt8,
    /// Unsigned 16-bit.
    UInt16,
    /// Unsigned 32-bit.
    UInt32,
    /// Unsigned 64-bit.
    UInt64,
    /// IEEE-754 single.
    Float32,
    /// IEEE-754 double.
    Float64,
    /// Visible string / octet string.
    String,
}

impl Kind {
    /// Encoded size on the wire, `None` for variable-length strings.
    #[must_use]
    pub const fn size(self) -> Option<usize> {
        match self {
            Kind::Int8 | Kind::UInt8 => Some(1),
            Kind::Int16 | Kind::UInt16 => Some(2),
            Kind::Int32 | Kind::UInt32 | Kind::Float32 => Some(4),
            Kind::Int64 | Kind::UInt64 | Kind::Float64 => Some(8),
            Kind::String => None,
        }
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 | Kind::Float32 | Kind::Float64
        )
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Kind::Float32 | Kind::Float64 | Kind::String)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Kind::Float32 | Kind::Float64)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Int8 => "int8",
            Kind::Int16 => "int16",
            Kind::Int32 => "int32",
            Kind::Int64 => "int64",
            Kind::UInt8 => "uint8",
            Kind::UInt16 => "uint16",
            Kind::UInt32 => "uint32",
            Kind::UInt64 => "uint64",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::String => "string",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A register value: one scalar kind or an owned string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl Value {
    /// Stored kind.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Value::Int8(_) => Kind::Int8,
            Value::Int16(_) => Kind::Int16,
            Value::Int32(_) => Kind::Int32,
            Value::Int64(_) => Kind::Int64,
            Value::UInt8(_) => Kind::UInt8,
            Value::UInt16(_) => Kind::UInt16,
            Value::UInt32(_) => Kind::UInt32,
            Value::UInt64(_) => Kind::UInt64,
            Value::Float32(_) => Kind::Float32,
            Value::Float64(_) => Kind::Float64,
            Value::String(_) => Kind::String,
        }
    }

    /// Zero (or empty string) of the given kind.
    #[must_use]
    pub fn zero(kind: Kind) -> Self {
        match kind {
            Kind::Int8 => Value::Int8(0),
            Kind::Int16 => Value::Int16(0),
            Kind::Int32 => Value::Int32(0),
            Kind::Int64 => Value::Int64(0),
            Kind::UInt8 => Value::UInt8(0),
            Kind::UInt16 => Value::UInt16(0),
            Kind::UInt32 => Value::UInt32(0),
            Kind::UInt64 => Value::UInt64(0),
            Kind::Float32 => Value::Float32(0.0),
            Kind::Float64 => Value::Float64(0.0),
            Kind::String => Value::String(String::new()),
        }
    }

    /// Encoded size in bytes (string length for strings).
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            other => other.kind().size().unwrap_or(0),
        }
    }

    /// Exact-kind extraction.
    pub fn get<T: Scalar>(&self) -> Result<T> {
        T::from_value(self).ok_or(Error::KindMismatch {
            expected: T::KIND,
            found: self.kind(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Checked conversion to another kind (see [`convert`] for the rules).
    pub fn convert_to(&self, kind: Kind) -> Result<Value> {
        convert::convert(self, kind)
    }

    /// Checked conversion followed by exact extraction.
    pub fn convert<T: Scalar>(&self) -> Result<T> {
        self.convert_to(T::KIND)?.get::<T>()
    }

    /// Replace the content with `other` converted to `self`'s kind.
    ///
    /// On error `self` is left untouched.
    pub fn assign(&mut self, other: &Value) -> Result<()> {
        let converted = other.convert_to(self.kind())?;
        *self = converted;
        Ok(())
    }

    /// Little-endian wire encoding.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Value::Int8(v) => v.to_le_bytes().to_vec(),
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::UInt8(v) => v.to_le_bytes().to_vec(),
            Value::UInt16(v) => v.to_le_bytes().to_vec(),
            Value::UInt32(v) => v.to_le_bytes().to_vec(),
            Value::UInt64(v) => v.to_le_bytes().to_vec(),
            Value::Float32(v) => v.to_le_bytes().to_vec(),
            Value::Float64(v) => v.to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a value of `kind` from little-endian bytes.
    ///
    /// Returns the value and the number of bytes consumed. Strings consume the
    /// whole slice; trailing NUL padding is dropped.
    pub fn from_le_bytes(kind: Kind, bytes: &[u8]) -> Result<(Value, usize)> {
        let Some(size) = kind.size() else {
            return Ok((decode_string(bytes), bytes.len()));
        };

        if bytes.len() < size {
            return Err(Error::Truncated {
                kind,
                needed: size,
                available: bytes.len(),
            });
        }

        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes[..size]);
        let value = match kind {
            Kind::Int8 => Value::Int8(raw[0] as i8),
            Kind::UInt8 => Value::UInt8(raw[0]),
            Kind::Int16 => Value::Int16(i16::from_le_bytes([raw[0], raw[1]])),
            Kind::UInt16 => Value::UInt16(u16::from_le_bytes([raw[0], raw[1]])),
            Kind::Int32 => Value::Int32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::UInt32 => Value::UInt32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::Float32 => Value::Float32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::Int64 => Value::Int64(i64::from_le_bytes(raw)),
            Kind::UInt64 => Value::UInt64(u64::from_le_bytes(raw)),
            Kind::Float64 => Value::Float64(f64::from_le_bytes(raw)),
            Kind::String => return Ok((decode_string(bytes), bytes.len())),
        };
        Ok((value, size))
    }

    /// Parse a textual value of `kind`.
    ///
    /// Decimal text goes through the checked conversion table. `0x`-prefixed
    /// hex text is taken as the raw little-endian bit pattern of the kind, so
    /// `0xFFFF` parses as `-1` for [`Kind::Int16`].
    pub fn parse(kind: Kind, text: &str) -> Result<Value> {
        let text = text.trim();
        if kind == Kind::String {
            return Ok(Value::String(text.to_string()));
        }

        if let Some(hex) = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            let bits = u64::from_str_radix(hex, 16)
                .map_err(|e| Error::Schema(format!("bad hex '{}': {}", text, e)))?;
            let size = kind.size().unwrap_or(8);
            if size < 8 && bits >> (size * 8) != 0 {
                return Err(Error::OutOfRange {
                    target: kind,
                    value: text.to_string(),
                });
            }
            return Value::from_le_bytes(kind, &bits.to_le_bytes()).map(|(v, _)| v);
        }

        if kind.is_float() {
            let f: f64 = text
                .parse()
                .map_err(|e| Error::Schema(format!("bad number '{}': {}", text, e)))?;
            return Value::Float64(f).convert_to(kind);
        }

        let i: i128 = text
            .parse()
            .map_err(|e| Error::Schema(format!("bad integer '{}': {}", text, e)))?;
        convert::from_integer(i, kind)
    }
}

fn decode_string(bytes: &[u8]) -> Value {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |pos| pos + 1);
    if end < bytes.len() {
        log::trace!("[value] string: {} trailing NUL bytes dropped", bytes.len() - end);
    }
    match String::from_utf8(bytes[..end].to_vec()) {
        Ok(text) => Value::String(text),
        Err(e) => {
            log::warn!(
                "[value] string is not UTF-8 (byte {}), invalid sequences replaced",
                e.utf8_error().valid_up_to()
            );
            Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// Rust types that map one-to-one onto a [`Kind`].
pub trait Scalar: Sized {
    /// Matching kind.
    const KIND: Kind;

    /// Exact-kind extraction.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            const KIND: Kind = Kind::$variant;

            #[inline]
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            #[inline]
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_scalar!(i8, Int8);
impl_scalar!(i16, Int16);
impl_scalar!(i32, Int32);
impl_scalar!(i64, Int64);
impl_scalar!(u8, UInt8);
impl_scalar!(u16, UInt16);
impl_scalar!(u32, UInt32);
impl_scalar!(u64, UInt64);
impl_scalar!(f32, Float32);
impl_scalar!(f64, Float64);
impl_scalar!(String, String);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
