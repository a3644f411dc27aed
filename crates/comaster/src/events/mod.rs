// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device events and their delivery.
//!
//! # Event ids
//!
//! | id                    | raised when                                  |
//! |-----------------------|----------------------------------------------|
//! | [`EVENT_PROTOCOL_ERROR`] | the peer aborted a register transfer      |
//! | [`EVENT_EMERGENCY`]   | an async status frame with a non-zero code   |
//! | [`EVENT_NMT_STATE`]   | the node's reported state changed            |
//! | `RegisterId::packed()`| a register value arrived (reply or broadcast)|
//!
//! # Delivery modes
//!
//! Chosen per subscription, see [`DeliveryMode`]. Only
//! [`DeliveryMode::PollDeferred`] runs callbacks on a thread the application
//! controls ([`EventBus::spin`]); the others imply concurrent access to
//! whatever state the callback touches.
//!
//! # Thread Safety
//!
//! Callbacks must be `Send + Sync` and should not block: an inline callback
//! stalls all reception on its port.

pub mod bus;

pub use bus::{EventBus, SubscriptionId};

use crate::dictionary::RegisterId;
use crate::protocol::{AbortCode, Emergency, NmtState};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A register transfer was aborted by the peer.
pub const EVENT_PROTOCOL_ERROR: u32 = 1;
/// Async status frame with a non-zero error code.
pub const EVENT_EMERGENCY: u32 = 2;
/// Node state changed.
pub const EVENT_NMT_STATE: u32 = 3;

/// Event id of value updates for `id`.
#[inline]
pub fn register_event(id: RegisterId) -> u32 {
    id.packed()
}

/// Event content.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    RegisterUpdate { id: RegisterId, value: Value },
    Abort { register: RegisterId, code: AbortCode },
    Emergency(Emergency),
    NmtState { previous: NmtState, current: NmtState },
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::RegisterUpdate { id, value } => write!(f, "{} = {}", id, value),
            Payload::Abort { register, code } => write!(f, "abort on {}: {}", register, code),
            Payload::Emergency(e) => write!(
                f,
                "emergency 0x{:04X} (error register 0x{:02X})",
                e.code, e.error_register
            ),
            Payload::NmtState { previous, current } => write!(f, "state {} -> {}", previous, current),
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: u32,
    /// Application id of the device that raised it.
    pub device_id: u16,
    pub payload: Payload,
    pub timestamp: Instant,
}

impl Event {
    pub fn new(id: u32, device_id: u16, payload: Payload) -> Self {
        Self {
            id,
            device_id,
            payload,
            timestamp: Instant::now(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[device {}] event 0x{:X}: {}", self.device_id, self.id, self.payload)
    }
}

/// Application callback.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Where and when a subscription's callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Format the event and print it on the publishing thread; no callback.
    Print,
    /// Call the callback on the publishing thread (the CAN reading thread for
    /// received data) before the next frame is processed.
    InlineOnReceive,
    /// Post the callback to the event reactor's thread.
    ReactorSync,
    /// Queue the callback until the application calls `spin`.
    PollDeferred,
}

impl DeliveryMode {
    #[inline]
    pub fn needs_callback(self) -> bool {
        !matches!(self, DeliveryMode::Print)
    }
}

/// Repeat policy of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repeat {
    Enabled,
    Disabled,
    /// Deliver once, then switch to `Disabled`.
    EnableOnce,
}
