// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-exact wire codec: register transfers, broadcast channels, node-state
//! commands, broadcast trigger and async status frames.
//!
//! Everything here is pure (frame in, frame out); the state machines live in
//! [`crate::engine`].

pub mod abort;
pub mod nmt;
pub mod pdo;
pub mod sdo;

pub use abort::AbortCode;
pub use nmt::{NmtCommand, NmtState};
pub use pdo::{Pdo, PdoDirection, Transmission};

use crate::config::{
    COB_EMCY, COB_NMT, COB_NMT_ERROR, COB_RPDO1, COB_SDO_REPLY, COB_SDO_REQUEST, COB_SYNC,
    COB_TPDO1,
};
use crate::transport::Frame;

/// Zero-length broadcast trigger frame.
pub fn sync_frame() -> Frame {
    let mut frame = Frame::with_data(COB_SYNC, [0; 8]);
    frame.len = 0;
    frame
}

/// Decoded async status (emergency) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emergency {
    /// 16-bit error code; 0 means "error reset".
    pub code: u16,
    /// Copy of the peer's error register (0x1001).
    pub error_register: u8,
    /// Profile/vendor-defined bytes.
    pub vendor: [u8; 5],
}

impl Emergency {
    pub fn parse(frame: &Frame) -> Self {
        let mut vendor = [0u8; 5];
        vendor.copy_from_slice(&frame.data[3..8]);
        Self {
            code: frame.u16_at(0),
            error_register: frame.data[2],
            vendor,
        }
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        self.code == 0
    }
}

/// One-line classification of a frame by identifier band (bus traces).
pub fn describe(frame: &Frame) -> String {
    let node = frame.node();
    match frame.id {
        COB_NMT => match NmtCommand::from_code(frame.data[0]) {
            Some(cmd) => format!("NMT {:?} node {}", cmd, frame.data[1]),
            None => "NMT ?".to_string(),
        },
        COB_SYNC => "SYNC".to_string(),
        _ => match frame.function() {
            COB_EMCY => {
                let emcy = Emergency::parse(frame);
                format!("EMCY node {} code 0x{:04X}", node, emcy.code)
            }
            f if f == COB_SDO_REPLY => match sdo::parse_reply(frame) {
                Ok(reply) => format!("SDO reply node {} {:?}", node, reply),
                Err(_) => format!("SDO reply node {} (malformed)", node),
            },
            f if f == COB_SDO_REQUEST => format!(
                "SDO request node {} cs 0x{:02X} {}",
                node,
                frame.data[0],
                sdo::addressed_register(frame)
            ),
            f if f == COB_NMT_ERROR => {
                if frame.rtr {
                    format!("GUARD request node {}", node)
                } else {
                    format!("STATE node {} {}", node, NmtState::from_byte(frame.data[0]))
                }
            }
            f if (COB_TPDO1..=0x480).contains(&f) && (f - COB_TPDO1) % 0x100 == 0 => {
                format!("TPDO{} node {}", (f - COB_TPDO1) / 0x100 + 1, node)
            }
            f if (COB_RPDO1..=0x500).contains(&f) && (f - COB_RPDO1) % 0x100 == 0 => {
                format!("RPDO{} node {}", (f - COB_RPDO1) / 0x100 + 1, node)
            }
            _ => "?".to_string(),
        },
    }
}
