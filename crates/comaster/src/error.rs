// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the master stack.
//!
//! Timeouts of blocking reads are *not* errors: they are reported through
//! [`ReadStatus::TimedOut`](crate::cache::ReadStatus). Everything listed here
//! is raised synchronously at the call that discovers it.

use crate::dictionary::{AccessType, RegisterId};
use crate::value::Kind;
use std::fmt;

/// Errors raised by the master stack.
#[derive(Debug)]
pub enum Error {
    // ===== Configuration Errors =====
    /// Invalid configuration value.
    Config(String),
    /// A device with this application id is already registered.
    DuplicateDevice(u16),
    /// The (port, node) pair is already owned by another device.
    DuplicateNode {
        /// Port name.
        port: String,
        /// Bus node id.
        node_id: u8,
    },
    /// Node id outside 1..=127.
    InvalidNodeId(u8),
    /// No device registered under this application id.
    DeviceNotFound(u16),
    /// No dictionary registered under this model name.
    DictionaryNotFound(String),
    /// No open port under this name.
    PortNotFound(String),

    // ===== Dictionary / Cache Errors =====
    /// (index, subindex) not present in the dictionary.
    RegisterNotFound {
        /// Object index.
        index: u16,
        /// Object subindex.
        subindex: u8,
    },
    /// Key does not belong to the dictionary it was used with.
    InvalidKey(usize),
    /// A cache cannot be built over an empty dictionary.
    EmptyDictionary,

    // ===== Value Errors =====
    /// Exact-kind extraction failed.
    KindMismatch {
        /// Kind requested by the caller.
        expected: Kind,
        /// Kind stored in the value.
        found: Kind,
    },
    /// Checked numeric conversion does not fit the target kind.
    OutOfRange {
        /// Target kind.
        target: Kind,
        /// Rendered source value.
        value: String,
    },
    /// Conversion between these kinds is never allowed (string <-> number).
    IncompatibleKinds {
        /// Source kind.
        from: Kind,
        /// Target kind.
        to: Kind,
    },
    /// Byte slice too short to decode a value of this kind.
    Truncated {
        /// Kind being decoded.
        kind: Kind,
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    // ===== Schema Errors =====
    /// Schema source could not be parsed at all.
    Schema(String),

    // ===== Protocol Errors =====
    /// Local access-rights check rejected the operation.
    AccessDenied {
        /// Register addressed.
        id: RegisterId,
        /// Declared access rights.
        access: AccessType,
    },
    /// Σ(mapped sizes) exceeds the 8-byte broadcast payload.
    MappingTooLarge {
        /// Total requested size in bytes.
        bytes: usize,
    },
    /// Broadcast channel number or direction not usable for this operation.
    InvalidPdo(String),
    /// Frame rejected before reaching the transport.
    InvalidFrame(String),
    /// Peer did not answer a mandatory request during initialisation.
    NoResponse(RegisterId),

    // ===== Transport Errors =====
    /// Driver open/send/receive failure.
    Transport(String),
    /// Operation on a closed port.
    PortClosed(String),
    /// Blocking wait attempted from the transport's own reading thread.
    WaitOnReaderThread(&'static str),

    // ===== Runtime Errors =====
    /// A callback delivery mode was configured without a callback.
    MissingCallback,
    /// Unknown subscription handle.
    SubscriptionNotFound(u64),
    /// The reactor was stopped and no longer accepts work.
    ReactorStopped,
    /// I/O error (schema file, log file, socket).
    Io(std::io::Error),
    /// YAML configuration error.
    #[cfg(feature = "config-loaders")]
    Yaml(serde_yaml::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::DuplicateDevice(id) => write!(f, "Device id {} already registered", id),
            Error::DuplicateNode { port, node_id } => {
                write!(f, "Node {} on port '{}' already registered", node_id, port)
            }
            Error::InvalidNodeId(id) => write!(f, "Invalid node id {} (expected 1..=127)", id),
            Error::DeviceNotFound(id) => write!(f, "No device with id {}", id),
            Error::DictionaryNotFound(name) => write!(f, "No dictionary for model '{}'", name),
            Error::PortNotFound(name) => write!(f, "No open port '{}'", name),
            Error::RegisterNotFound { index, subindex } => write!(
                f,
                "Register 0x{:04X}/0x{:02X} not found in dictionary",
                index, subindex
            ),
            Error::InvalidKey(key) => write!(f, "Key {} out of dictionary bounds", key),
            Error::EmptyDictionary => write!(f, "Dictionary is empty"),
            Error::KindMismatch { expected, found } => {
                write!(f, "Value holds {} but {} was requested", found, expected)
            }
            Error::OutOfRange { target, value } => {
                write!(f, "Value {} out of range for {}", value, target)
            }
            Error::IncompatibleKinds { from, to } => {
                write!(f, "Conversion from {} to {} is not allowed", from, to)
            }
            Error::Truncated {
                kind,
                needed,
                available,
            } => write!(
                f,
                "Need {} bytes to decode {}, only {} available",
                needed, kind, available
            ),
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::AccessDenied { id, access } => {
                write!(f, "Register {} is {} and cannot be written", id, access)
            }
            Error::MappingTooLarge { bytes } => {
                write!(f, "Broadcast mapping needs {} bytes (max 8)", bytes)
            }
            Error::InvalidPdo(msg) => write!(f, "Invalid broadcast channel: {}", msg),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::NoResponse(id) => write!(f, "No response reading register {}", id),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::PortClosed(name) => write!(f, "Port '{}' is closed", name),
            Error::WaitOnReaderThread(op) => write!(
                f,
                "{} cannot be called from the CAN reading thread (it would never complete)",
                op
            ),
            Error::MissingCallback => write!(f, "Delivery mode requires a callback"),
            Error::SubscriptionNotFound(id) => write!(f, "Unknown subscription {}", id),
            Error::ReactorStopped => write!(f, "Reactor stopped"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(feature = "config-loaders")]
            Error::Yaml(e) => write!(f, "YAML error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            #[cfg(feature = "config-loaders")]
            Error::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(feature = "config-loaders")]
impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(e)
    }
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Shorthand for a not-found register.
    #[inline]
    pub(crate) fn not_found(id: RegisterId) -> Self {
        Error::RegisterNotFound {
            index: id.index(),
            subindex: id.subindex(),
        }
    }

    /// True for errors that mean "register absent" (used where a missing
    /// optional register is skipped).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RegisterNotFound { .. })
    }
}
