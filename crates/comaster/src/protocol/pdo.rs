// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast channel (PDO) addressing.
//!
//! | channel | communication | mapping  | default identifier (n <= 4) |
//! |---------|---------------|----------|-----------------------------|
//! | RX n    | 0x1400+n-1    | 0x1600+n-1 | 0x200 + 0x100*(n-1) + node |
//! | TX n    | 0x1800+n-1    | 0x1A00+n-1 | 0x180 + 0x100*(n-1) + node |
//!
//! RX channels carry master -> peer data, TX channels peer -> master.

use crate::config::{COB_RPDO1, COB_TPDO1, PDO_COUNT};
use crate::dictionary::RegisterId;
use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Data direction, named from the peer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdoDirection {
    /// Received by the peer (master writes).
    Rx,
    /// Transmitted by the peer (master reads).
    Tx,
}

/// One broadcast channel: direction + number 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pdo {
    direction: PdoDirection,
    number: u8,
}

impl Pdo {
    pub fn new(direction: PdoDirection, number: u8) -> Result<Self> {
        if number == 0 || number > PDO_COUNT {
            return Err(Error::InvalidPdo(format!(
                "channel number {} outside 1..={}",
                number, PDO_COUNT
            )));
        }
        Ok(Self { direction, number })
    }

    pub fn rx(number: u8) -> Result<Self> {
        Self::new(PdoDirection::Rx, number)
    }

    pub fn tx(number: u8) -> Result<Self> {
        Self::new(PdoDirection::Tx, number)
    }

    /// All 16 channels, RX first.
    pub fn all() -> impl Iterator<Item = Pdo> {
        [PdoDirection::Rx, PdoDirection::Tx]
            .into_iter()
            .flat_map(|direction| (1..=PDO_COUNT).map(move |number| Pdo { direction, number }))
    }

    #[inline]
    pub fn direction(self) -> PdoDirection {
        self.direction
    }

    #[inline]
    pub fn number(self) -> u8 {
        self.number
    }

    /// Dense position 0..16 (RX 1..8 then TX 1..8).
    #[inline]
    pub fn slot(self) -> usize {
        let base = match self.direction {
            PdoDirection::Rx => 0,
            PdoDirection::Tx => usize::from(PDO_COUNT),
        };
        base + usize::from(self.number - 1)
    }

    /// Communication parameter record index.
    pub fn comm_index(self) -> u16 {
        let base = match self.direction {
            PdoDirection::Rx => 0x1400,
            PdoDirection::Tx => 0x1800,
        };
        base + u16::from(self.number - 1)
    }

    /// Mapping parameter record index.
    pub fn map_index(self) -> u16 {
        let base = match self.direction {
            PdoDirection::Rx => 0x1600,
            PdoDirection::Tx => 0x1A00,
        };
        base + u16::from(self.number - 1)
    }

    /// Identifier entry (comm sub1).
    pub fn cob_register(self) -> RegisterId {
        RegisterId::new(self.comm_index(), 1)
    }

    /// Predefined identifier; only channels 1..=4 have one.
    pub fn default_cob(self, node_id: u8) -> Option<u16> {
        if self.number > 4 {
            return None;
        }
        let base = match self.direction {
            PdoDirection::Rx => COB_RPDO1,
            PdoDirection::Tx => COB_TPDO1,
        };
        Some(base + 0x100 * u16::from(self.number - 1) + u16::from(node_id))
    }
}

impl fmt::Display for Pdo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            PdoDirection::Rx => "RPDO",
            PdoDirection::Tx => "TPDO",
        };
        write!(f, "{}{}", dir, self.number)
    }
}

/// 32-bit mapping entry `index << 16 | subindex << 8 | bit length`.
#[inline]
pub fn mapping_entry(id: RegisterId, bits: u8) -> u32 {
    (u32::from(id.index()) << 16) | (u32::from(id.subindex()) << 8) | u32::from(bits)
}

/// Inverse of [`mapping_entry`].
#[inline]
pub fn parse_mapping_entry(entry: u32) -> (RegisterId, u8) {
    (
        RegisterId::new((entry >> 16) as u16, (entry >> 8) as u8),
        entry as u8,
    )
}

/// Transmission behaviour of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmission {
    /// Transmit once every `every` broadcast triggers (1..=240).
    Synchronous { every: u8 },
    /// Transmit on an internal event (`event_type` 254 or 255), at most once
    /// per `inhibit` and at least once per `event_timer` when idle.
    Asynchronous {
        event_type: u8,
        inhibit: Duration,
        event_timer: Duration,
    },
}

impl Transmission {
    /// Inhibit time in 100 µs units, saturated to 16 bits.
    pub(crate) fn inhibit_units(inhibit: Duration) -> u16 {
        (inhibit.as_micros() / 100).min(u128::from(u16::MAX)) as u16
    }

    /// Event timer in ms, saturated to 16 bits.
    pub(crate) fn timer_millis(timer: Duration) -> u16 {
        timer.as_millis().min(u128::from(u16::MAX)) as u16
    }
}
