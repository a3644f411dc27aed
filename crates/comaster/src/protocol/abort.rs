// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Standard register-transfer abort codes.

use std::fmt;

/// 32-bit abort code carried in bytes 4..8 of an abort frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbortCode(pub u32);

impl AbortCode {
    pub const TOGGLE_NOT_ALTERNATED: Self = Self(0x0503_0000);
    pub const TIMED_OUT: Self = Self(0x0504_0000);
    pub const INVALID_COMMAND: Self = Self(0x0504_0001);
    pub const OUT_OF_MEMORY: Self = Self(0x0504_0005);
    pub const UNSUPPORTED_ACCESS: Self = Self(0x0601_0000);
    pub const READ_WRITE_ONLY: Self = Self(0x0601_0001);
    pub const WRITE_READ_ONLY: Self = Self(0x0601_0002);
    pub const OBJECT_NOT_FOUND: Self = Self(0x0602_0000);
    pub const NOT_MAPPABLE: Self = Self(0x0604_0041);
    pub const MAPPING_TOO_LONG: Self = Self(0x0604_0042);
    pub const PARAMETER_INCOMPATIBLE: Self = Self(0x0604_0043);
    pub const INTERNAL_INCOMPATIBLE: Self = Self(0x0604_0047);
    pub const LENGTH_MISMATCH: Self = Self(0x0607_0010);
    pub const LENGTH_TOO_HIGH: Self = Self(0x0607_0012);
    pub const LENGTH_TOO_LOW: Self = Self(0x0607_0013);
    pub const SUBINDEX_NOT_FOUND: Self = Self(0x0609_0011);
    pub const VALUE_RANGE_EXCEEDED: Self = Self(0x0609_0030);
    pub const VALUE_TOO_HIGH: Self = Self(0x0609_0031);
    pub const VALUE_TOO_LOW: Self = Self(0x0609_0032);
    pub const GENERAL_ERROR: Self = Self(0x0800_0000);
    pub const LOCAL_CONTROL: Self = Self(0x0800_0021);
    pub const DEVICE_STATE: Self = Self(0x0800_0022);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Human-readable meaning; vendor-specific codes are reported as such.
    pub fn description(self) -> &'static str {
        match self.0 {
            0x0503_0000 => "toggle bit not alternated",
            0x0504_0000 => "transfer protocol timed out",
            0x0504_0001 => "client/server command specifier not valid or unknown",
            0x0504_0005 => "out of memory",
            0x0601_0000 => "unsupported access to an object",
            0x0601_0001 => "attempt to read a write-only object",
            0x0601_0002 => "attempt to write a read-only object",
            0x0602_0000 => "object does not exist in the object dictionary",
            0x0604_0041 => "object cannot be mapped to the PDO",
            0x0604_0042 => "number and length of mapped objects exceed PDO length",
            0x0604_0043 => "general parameter incompatibility",
            0x0604_0047 => "general internal incompatibility in the device",
            0x0607_0010 => "data type does not match, length of service parameter does not match",
            0x0607_0012 => "data type does not match, length of service parameter too high",
            0x0607_0013 => "data type does not match, length of service parameter too low",
            0x0609_0011 => "sub-index does not exist",
            0x0609_0030 => "value range of parameter exceeded",
            0x0609_0031 => "value of parameter written too high",
            0x0609_0032 => "value of parameter written too low",
            0x0800_0000 => "general error",
            0x0800_0021 => "data cannot be transferred or stored because of local control",
            0x0800_0022 => "data cannot be transferred or stored because of the present device state",
            _ => "unknown or vendor-specific abort code",
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} ({})", self.0, self.description())
    }
}

impl From<u32> for AbortCode {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptions() {
        assert_eq!(
            AbortCode::OBJECT_NOT_FOUND.to_string(),
            "0x06020000 (object does not exist in the object dictionary)"
        );
        assert_eq!(AbortCode(0x0609_0031).description(), "value of parameter written too high");
        assert_eq!(AbortCode(0x0F00_FFC0).description(), "unknown or vendor-specific abort code");
    }
}
