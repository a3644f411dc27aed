// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Checked conversion table between value kinds.
//!
//! | source \ target | integer                  | float32            | float64     | string |
//! |-----------------|--------------------------|--------------------|-------------|--------|
//! | integer         | range-checked            | exact only         | exact only  | reject |
//! | float           | integral and in range    | finite, <= f32::MAX| always      | reject |
//! | string          | reject                   | reject             | reject      | copy   |
//!
//! "exact only" means the integer must survive the round trip through the
//! float unchanged (e.g. `u64::MAX` into `float64` is rejected).
//! Narrowing a double into a single may lose precision but never magnitude.

use super::{Kind, Value};
use crate::error::{Error, Result};

/// Numeric class of a value, widened for comparison.
enum Wide {
    Int(i128),
    Float(f64),
    Text,
}

fn widen(value: &Value) -> Wide {
    match *value {
        Value::Int8(v) => Wide::Int(i128::from(v)),
        Value::Int16(v) => Wide::Int(i128::from(v)),
        Value::Int32(v) => Wide::Int(i128::from(v)),
        Value::Int64(v) => Wide::Int(i128::from(v)),
        Value::UInt8(v) => Wide::Int(i128::from(v)),
        Value::UInt16(v) => Wide::Int(i128::from(v)),
        Value::UInt32(v) => Wide::Int(i128::from(v)),
        Value::UInt64(v) => Wide::Int(i128::from(v)),
        Value::Float32(v) => Wide::Float(f64::from(v)),
        Value::Float64(v) => Wide::Float(v),
        Value::String(_) => Wide::Text,
    }
}

/// Convert `value` to `target` following the table above.
pub fn convert(value: &Value, target: Kind) -> Result<Value> {
    let source = value.kind();
    if source == target {
        return Ok(value.clone());
    }

    match widen(value) {
        Wide::Text => Err(Error::IncompatibleKinds {
            from: source,
            to: target,
        }),
        _ if target == Kind::String => Err(Error::IncompatibleKinds {
            from: source,
            to: target,
        }),
        Wide::Int(i) => from_integer(i, target),
        Wide::Float(f) => from_float(f, target),
    }
}

fn out_of_range(target: Kind, value: impl ToString) -> Error {
    Error::OutOfRange {
        target,
        value: value.to_string(),
    }
}

/// Integer into any numeric kind.
pub(crate) fn from_integer(i: i128, target: Kind) -> Result<Value> {
    let range = || out_of_range(target, i);
    Ok(match target {
        Kind::Int8 => Value::Int8(i8::try_from(i).map_err(|_| range())?),
        Kind::Int16 => Value::Int16(i16::try_from(i).map_err(|_| range())?),
        Kind::Int32 => Value::Int32(i32::try_from(i).map_err(|_| range())?),
        Kind::Int64 => Value::Int64(i64::try_from(i).map_err(|_| range())?),
        Kind::UInt8 => Value::UInt8(u8::try_from(i).map_err(|_| range())?),
        Kind::UInt16 => Value::UInt16(u16::try_from(i).map_err(|_| range())?),
        Kind::UInt32 => Value::UInt32(u32::try_from(i).map_err(|_| range())?),
        Kind::UInt64 => Value::UInt64(u64::try_from(i).map_err(|_| range())?),
        Kind::Float32 => {
            let f = i as f32;
            if f.is_finite() && f as i128 == i {
                Value::Float32(f)
            } else {
                return Err(range());
            }
        }
        Kind::Float64 => {
            let f = i as f64;
            if f.is_finite() && f as i128 == i {
                Value::Float64(f)
            } else {
                return Err(range());
            }
        }
        Kind::String => {
            return Err(Error::IncompatibleKinds {
                from: Kind::Int64,
                to: Kind::String,
            })
        }
    })
}

fn from_float(f: f64, target: Kind) -> Result<Value> {
    match target {
        Kind::Float64 => Ok(Value::Float64(f)),
        Kind::Float32 => {
            if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                Err(out_of_range(target, f))
            } else {
                Ok(Value::Float32(f as f32))
            }
        }
        _ => {
            // Integers accept only integral, finite floats; the range check
            // itself is shared with the integer path.
            if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 1.0e38 {
                return Err(out_of_range(target, f));
            }
            from_integer(f as i128, target).map_err(|_| out_of_range(target, f))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_into_unsigned_is_range_error() {
        for target in [Kind::UInt8, Kind::UInt16, Kind::UInt32, Kind::UInt64] {
            let err = Value::Int32(-1).convert_to(target).unwrap_err();
            assert!(matches!(err, Error::OutOfRange { .. }), "{:?}", target);
        }
        let err = Value::Float64(-3.0).convert_to(Kind::UInt16).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_double_to_single() {
        let v = Value::Float64(1234.5).convert_to(Kind::Float32).unwrap();
        assert_eq!(v, Value::Float32(1234.5));

        let err = Value::Float64(1.0e300).convert_to(Kind::Float32).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_string_numeric_rejected() {
        let err = Value::from("42").convert_to(Kind::Int32).unwrap_err();
        assert!(matches!(err, Error::IncompatibleKinds { .. }));
        let err = Value::Int32(42).convert_to(Kind::String).unwrap_err();
        assert!(matches!(err, Error::IncompatibleKinds { .. }));
        assert_eq!(
            Value::from("x").convert_to(Kind::String).unwrap(),
            Value::from("x")
        );
    }

    #[test]
    fn test_integer_widening_and_narrowing() {
        assert_eq!(
            Value::UInt8(255).convert_to(Kind::Int16).unwrap(),
            Value::Int16(255)
        );
        assert_eq!(
            Value::Int64(-128).convert_to(Kind::Int8).unwrap(),
            Value::Int8(-128)
        );
        assert!(Value::Int64(-129).convert_to(Kind::Int8).is_err());
        assert!(Value::UInt32(70_000).convert_to(Kind::UInt16).is_err());
    }

    #[test]
    fn test_float_to_integer_requires_integral() {
        assert_eq!(
            Value::Float32(12.0).convert_to(Kind::UInt8).unwrap(),
            Value::UInt8(12)
        );
        assert!(Value::Float32(12.5).convert_to(Kind::UInt8).is_err());
        assert!(Value::Float64(f64::NAN).convert_to(Kind::Int32).is_err());
        assert!(Value::Float64(f64::INFINITY).convert_to(Kind::Int64).is_err());
    }

    #[test]
    fn test_integer_to_float_exact_only() {
        assert_eq!(
            Value::Int32(-7).convert_to(Kind::Float64).unwrap(),
            Value::Float64(-7.0)
        );
        assert!(Value::UInt64(u64::MAX).convert_to(Kind::Float64).is_err());
        assert!(Value::UInt32(16_777_217).convert_to(Kind::Float32).is_err());
    }

    #[test]
    fn test_random_in_range_roundtrip_through_i64() {
        for _ in 0..256 {
            let n = fastrand::i32(..);
            let wide = Value::Int32(n).convert_to(Kind::Int64).unwrap();
            assert_eq!(wide.convert::<i32>().unwrap(), n);
        }
    }
}
