// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # comaster - CANopen-style master protocol stack
//!
//! Manages many peer devices described by a register schema, over pluggable
//! CAN drivers: confirmed register transfers (expedited and segmented),
//! broadcast channel mapping and demultiplexing, node-state commands and
//! event delivery decoupled from reception.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use comaster::{Master, PortConfig, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let master = Master::new();
//!     master.open_port(&PortConfig::virtual_bus("can0", "sim"))?;
//!     let drive = master.create_device(1, 5, "can0", "CiA301-minimal")?;
//!
//!     let sample = drive.read_and_get((0x1000, 0), Duration::from_millis(200))?;
//!     println!("device type: {:?}", sample.get::<u32>());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  Master: reactors, ports, DictionaryRegistry, devices               |
//! +---------------------------------------------------------------------+
//! |  ProtocolEngine (one per device)                                    |
//! |    register transfers | broadcast mapping | node state | init       |
//! +---------------------------------------------------------------------+
//! |  RequestQueue (single in flight) | ValueCache | EventBus            |
//! +---------------------------------------------------------------------+
//! |  CanPort (reader thread, subscribers, trace)  |  Reactor x2         |
//! +---------------------------------------------------------------------+
//! |  CanDriver: VirtualBus | SocketCAN                                  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Master`] | Owns reactors, ports, dictionaries and devices |
//! | [`ProtocolEngine`] | Per-device request/reply, mapping and node state |
//! | [`Dictionary`] | Immutable sorted register catalogue of a model |
//! | [`Value`] | Tagged scalar-or-string register value |
//! | [`EventBus`] | Per-device subscriptions with four delivery modes |
//!
//! ## Threads
//!
//! One reader per open port, one worker per reactor (two in total: reply
//! timeouts and reactor-synchronous callbacks). Blocking calls take a finite
//! timeout and fail fast with [`Error::WaitOnReaderThread`] on a reader.

/// Minimal single-threaded event loop with cancellable alarms.
pub mod reactor;
/// Scalar-or-string register values and checked conversions.
pub mod value;
/// Register schema: descriptors, parser, registry.
pub mod dictionary;
/// Per-device register values with freshness.
pub mod cache;
/// CAN drivers and ports.
pub mod transport;
/// Single-in-flight request correlation.
pub mod queue;
/// Device events and delivery modes.
pub mod events;
/// Wire codec.
pub mod protocol;
/// Per-device protocol state machines.
pub mod engine;
/// Top-level context.
pub mod master;
/// Constants and YAML configuration.
pub mod config;
/// `log` backend.
pub mod logging;
mod error;

pub use cache::{Freshness, ReadStatus, Sample, ValueCache};
pub use config::{DeviceConfig, DriverKind, MasterConfig, PortConfig};
pub use dictionary::{
    AccessType, DeviceInfo, Dictionary, DictionaryRegistry, Key, RegisterDescriptor, RegisterId,
    RegisterRef, MINIMAL_MODEL,
};
pub use engine::{EngineOptions, MappingSlot, ProtocolEngine};
pub use error::{Error, Result};
pub use events::{DeliveryMode, Event, EventBus, EventCallback, Payload, Repeat, SubscriptionId};
pub use master::Master;
pub use protocol::{AbortCode, NmtCommand, NmtState, Pdo, PdoDirection, Transmission};
pub use reactor::Reactor;
pub use transport::{CanDriver, CanPort, DriverStatus, Frame, VirtualBus};
pub use value::{Kind, Scalar, Value};

/// comaster version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
