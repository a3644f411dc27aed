// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process CAN bus.
//!
//! Every [`VirtualDriver`] endpoint receives the frames sent by all *other*
//! endpoints of the same bus, like a real controller with own-message
//! reception disabled. Used for simulation and tests.

use super::{CanDriver, DriverStatus, Frame};
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

static SHARED_BUSES: OnceLock<DashMap<String, VirtualBus>> = OnceLock::new();

struct BusInner {
    name: String,
    endpoints: Mutex<Vec<(u64, Sender<Frame>)>>,
    next_endpoint: AtomicU64,
}

/// Handle to an in-process bus; cheap to clone.
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

impl VirtualBus {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.to_string(),
                endpoints: Mutex::new(Vec::new()),
                next_endpoint: AtomicU64::new(1),
            }),
        }
    }

    /// Process-wide bus registered under `name` (created on first use).
    pub fn shared(name: &str) -> Self {
        let buses = SHARED_BUSES.get_or_init(DashMap::new);
        buses
            .entry(name.to_string())
            .or_insert_with(|| VirtualBus::new(name))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach a new endpoint.
    pub fn endpoint(&self) -> VirtualDriver {
        let (tx, rx) = channel::unbounded();
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        self.inner.endpoints.lock().push((id, tx));
        VirtualDriver {
            bus: self.clone(),
            id,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    fn deliver(&self, from: u64, frame: &Frame) {
        let wire = frame.wire_copy();
        let endpoints = self.inner.endpoints.lock();
        for (id, tx) in endpoints.iter() {
            if *id != from {
                // A detached receiver is removed on close/drop; ignore races.
                let _ = tx.send(wire.clone());
            }
        }
    }

    fn detach(&self, endpoint: u64) {
        self.inner.endpoints.lock().retain(|(id, _)| *id != endpoint);
    }
}

/// One endpoint of a [`VirtualBus`].
pub struct VirtualDriver {
    bus: VirtualBus,
    id: u64,
    rx: Receiver<Frame>,
    closed: AtomicBool,
}

impl VirtualDriver {
    pub fn bus(&self) -> &VirtualBus {
        &self.bus
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PortClosed(self.bus.name().to_string()));
        }
        Ok(())
    }
}

impl CanDriver for VirtualDriver {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        log::trace!("[vbus] {} tx {}", self.bus.name(), frame);
        self.bus.deliver(self.id, frame);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.ensure_open()?;
        match self.rx.recv_timeout(timeout) {
            Ok(mut frame) => {
                frame.timestamp = Some(Instant::now());
                Ok(Some(frame))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::PortClosed(self.bus.name().to_string()))
            }
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.detach(self.id);
        }
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        if self.closed.load(Ordering::Acquire) {
            DriverStatus::Closed
        } else {
            DriverStatus::Active
        }
    }
}

impl Drop for VirtualDriver {
    fn drop(&mut self) {
        self.bus.detach(self.id);
    }
}
