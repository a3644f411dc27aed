// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-state commands and reported states.

use crate::config::{COB_NMT, COB_NMT_ERROR};
use crate::transport::Frame;
use std::fmt;

/// Node-state command (byte 0 of the command frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NmtCommand {
    Start,
    Stop,
    EnterPreOperational,
    ResetApplication,
    ResetCommunication,
}

impl NmtCommand {
    pub const fn code(self) -> u8 {
        match self {
            NmtCommand::Start => 0x01,
            NmtCommand::Stop => 0x02,
            NmtCommand::EnterPreOperational => 0x80,
            NmtCommand::ResetApplication => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => NmtCommand::Start,
            0x02 => NmtCommand::Stop,
            0x80 => NmtCommand::EnterPreOperational,
            0x81 => NmtCommand::ResetApplication,
            0x82 => NmtCommand::ResetCommunication,
            _ => return None,
        })
    }

    /// Command frame; node 0 addresses every node.
    pub fn frame(self, node_id: u8) -> Frame {
        let mut frame = Frame::with_data(COB_NMT, [self.code(), node_id, 0, 0, 0, 0, 0, 0]);
        frame.len = 2;
        frame
    }
}

/// Node guarding request for `node_id`, answered on the same identifier.
pub fn guard_request(node_id: u8) -> Frame {
    let id = COB_NMT_ERROR + u16::from(node_id);
    Frame::remote(id).expect_answer(id)
}

/// State reported by a node in guard/heartbeat frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NmtState {
    /// Boot-up message.
    Initializing,
    Stopped,
    Operational,
    PreOperational,
    /// Never heard from the node.
    Unknown,
}

impl NmtState {
    /// Decode `data[0]` of a guard/heartbeat frame (toggle bit ignored).
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x7F {
            0x00 => NmtState::Initializing,
            0x04 => NmtState::Stopped,
            0x05 => NmtState::Operational,
            0x7F => NmtState::PreOperational,
            _ => NmtState::Unknown,
        }
    }

    pub const fn code(self) -> Option<u8> {
        match self {
            NmtState::Initializing => Some(0x00),
            NmtState::Stopped => Some(0x04),
            NmtState::Operational => Some(0x05),
            NmtState::PreOperational => Some(0x7F),
            NmtState::Unknown => None,
        }
    }
}

impl fmt::Display for NmtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NmtState::Initializing => "initializing",
            NmtState::Stopped => "stopped",
            NmtState::Operational => "operational",
            NmtState::PreOperational => "pre-operational",
            NmtState::Unknown => "unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame() {
        let f = NmtCommand::Start.frame(5);
        assert_eq!(f.id, 0);
        assert_eq!(f.payload(), &[0x01, 0x05]);
        assert_eq!(NmtCommand::ResetCommunication.frame(0).payload(), &[0x82, 0x00]);
        for cmd in [
            NmtCommand::Start,
            NmtCommand::Stop,
            NmtCommand::EnterPreOperational,
            NmtCommand::ResetApplication,
            NmtCommand::ResetCommunication,
        ] {
            assert_eq!(NmtCommand::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(NmtCommand::from_code(0x03), None);
    }

    #[test]
    fn test_guard_request() {
        let f = guard_request(0x22);
        assert_eq!(f.id, 0x722);
        assert!(f.rtr);
        assert_eq!(f.len, 0);
        assert_eq!(f.desired_answer, 0x722);
    }

    #[test]
    fn test_state_decode_ignores_toggle() {
        assert_eq!(NmtState::from_byte(0x85), NmtState::Operational);
        assert_eq!(NmtState::from_byte(0x7F), NmtState::PreOperational);
        assert_eq!(NmtState::from_byte(0x04), NmtState::Stopped);
        assert_eq!(NmtState::from_byte(0x00), NmtState::Initializing);
        assert_eq!(NmtState::from_byte(0x33), NmtState::Unknown);
    }
}
