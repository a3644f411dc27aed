// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CAN transport layer.
//!
//! # Architecture
//!
//! ```text
//!   CanDriver (virtual bus, SocketCAN, ...)
//!        │ receive(timeout)
//!        ▼
//!   CanPort reader thread ──▶ trace queue (optional)
//!        │ synchronous fan-out, (id & mask) == (pattern & mask)
//!        ▼
//!   subscribers (one RequestQueue per device)
//! ```
//!
//! The driver is an opaque capability selected by name at start-up
//! ([`open_driver`]); the rest of the stack only sees [`CanDriver`].

pub mod frame;
pub mod port;
#[cfg(target_os = "linux")]
pub mod socketcan;
pub mod virtual_bus;

pub use frame::Frame;
pub use port::{
    CanPort, Direction, FrameCallback, PortOptions, PortStatus, SubscriberId, TraceRecord,
};
pub use virtual_bus::{VirtualBus, VirtualDriver};

use crate::config::{DriverKind, PortConfig};
use crate::error::Result;
use std::time::Duration;

/// Health reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverStatus {
    Active,
    Closed,
    /// Driver-specific error (errno for SocketCAN).
    Error(i32),
}

/// Raw frame I/O on one open channel.
///
/// `receive` must return within roughly `timeout` so the reader thread can
/// observe shutdown requests.
pub trait CanDriver: Send + Sync {
    /// Transmit one frame. Failure is a fatal transport fault.
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Next frame, `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<Frame>>;

    /// Release the channel; later calls fail with [`crate::Error::PortClosed`].
    fn close(&self) -> Result<()>;

    fn status(&self) -> DriverStatus;
}

/// Open the driver named in `config`.
pub fn open_driver(config: &PortConfig) -> Result<Box<dyn CanDriver>> {
    match config.driver {
        DriverKind::Virtual => Ok(Box::new(VirtualBus::shared(&config.channel).endpoint())),
        #[cfg(target_os = "linux")]
        DriverKind::SocketCan => Ok(Box::new(socketcan::SocketCanDriver::open(
            &config.channel,
            config.bitrate,
        )?)),
        #[cfg(not(target_os = "linux"))]
        DriverKind::SocketCan => Err(crate::error::Error::Config(
            "socketcan driver is only available on Linux".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_open_virtual_driver_by_name() {
        let config = PortConfig {
            name: "bus0".to_string(),
            driver: DriverKind::Virtual,
            channel: "transport-mod-test".to_string(),
            bitrate: None,
        };
        let a = open_driver(&config).unwrap();
        let b = open_driver(&config).unwrap();
        a.send(&Frame::new(0x123, &[1, 2]).unwrap()).unwrap();
        let got = b.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got.id, 0x123);
        assert_eq!(got.payload(), &[1, 2]);
        assert_eq!(a.status(), DriverStatus::Active);
        a.close().unwrap();
        assert_eq!(a.status(), DriverStatus::Closed);
        assert!(matches!(
            a.send(&Frame::new(0x1, &[]).unwrap()),
            Err(Error::PortClosed(_))
        ));
    }
}
