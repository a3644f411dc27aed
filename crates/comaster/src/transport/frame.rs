// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CAN frame with request-correlation metadata.

use crate::error::{Error, Result};
use std::fmt;
use std::time::Instant;

/// Largest standard (11-bit) identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// One CAN frame.
///
/// Besides the wire fields (`id`, `rtr`, `len`, `data`) a frame carries the
/// correlation metadata used by the request queue: when `wait_answer` is set
/// the queue holds every later frame until a frame with identifier
/// `desired_answer` is received (or the reply timeout fires). `tag` lets
/// the sender recognise the answer to one particular request; it never
/// travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub rtr: bool,
    pub len: u8,
    pub data: [u8; 8],
    pub desired_answer: u16,
    pub wait_answer: bool,
    pub sent: bool,
    pub received: bool,
    pub timestamp: Option<Instant>,
    pub tag: u64,
}

impl Frame {
    /// Data frame with up to 8 payload bytes.
    pub fn new(id: u16, payload: &[u8]) -> Result<Self> {
        if id > MAX_STANDARD_ID {
            return Err(Error::InvalidFrame(format!("identifier 0x{:X} is not 11-bit", id)));
        }
        if payload.len() > 8 {
            return Err(Error::InvalidFrame(format!(
                "payload of {} bytes (max 8)",
                payload.len()
            )));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            rtr: false,
            len: payload.len() as u8,
            data,
            desired_answer: 0,
            wait_answer: false,
            sent: false,
            received: false,
            timestamp: None,
            tag: 0,
        })
    }

    /// Full 8-byte frame; infallible for identifiers built from the bands.
    pub(crate) fn with_data(id: u16, data: [u8; 8]) -> Self {
        Self {
            id: id & MAX_STANDARD_ID,
            rtr: false,
            len: 8,
            data,
            desired_answer: 0,
            wait_answer: false,
            sent: false,
            received: false,
            timestamp: None,
            tag: 0,
        }
    }

    /// Remote-request frame (no payload).
    pub fn remote(id: u16) -> Self {
        let mut frame = Self::with_data(id, [0; 8]);
        frame.rtr = true;
        frame.len = 0;
        frame
    }

    /// Hold the queue until a frame with `answer_id` arrives.
    #[must_use]
    pub fn expect_answer(mut self, answer_id: u16) -> Self {
        self.wait_answer = true;
        self.desired_answer = answer_id;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len.min(8))]
    }

    /// Node id encoded in the low 7 bits.
    #[inline]
    pub fn node(&self) -> u8 {
        (self.id & 0x7F) as u8
    }

    /// Function code (identifier band without the node id).
    #[inline]
    pub fn function(&self) -> u16 {
        self.id & 0x780
    }

    /// Copy with only the wire fields (what actually travels on a bus).
    pub fn wire_copy(&self) -> Self {
        let mut frame = Self::with_data(self.id, self.data);
        frame.rtr = self.rtr;
        frame.len = self.len.min(8);
        frame
    }

    #[inline]
    pub(crate) fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        let end = (offset + 4).min(8);
        raw[..end - offset].copy_from_slice(&self.data[offset..end]);
        u32::from_le_bytes(raw)
    }

    #[inline]
    pub(crate) fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} [{}]", self.id, self.len)?;
        if self.rtr {
            return f.write_str(" RTR");
        }
        for b in self.payload() {
            write!(f, " {:02X}", b)?;
        }
        Ok(())
    }
}
