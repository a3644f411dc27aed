// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Open CAN channel with a dedicated reading thread.
//!
//! # Architecture
//!
//! ```text
//! driver.receive(poll) -> trace queue -> subscribers (mask/pattern) -> callback
//! ```
//!
//! Fan-out is synchronous: every matching subscriber runs on the reading
//! thread before the next frame is pulled. A panicking callback is caught
//! and counted; it never kills the reader.
//!
//! The subscriber list is copy-on-write (`ArcSwap`), so subscribing from a
//! callback or from another thread never blocks reception.

use super::{CanDriver, DriverStatus, Frame};
use crate::config::{DEFAULT_READER_POLL, DEFAULT_TRACE_CAPACITY};
use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Callback invoked on the reading thread for each matching frame.
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Handle returned by [`CanPort::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    mask: u16,
    pattern: u16,
    callback: FrameCallback,
}

impl Subscriber {
    #[inline]
    fn matches(&self, id: u16) -> bool {
        (id & self.mask) == (self.pattern & self.mask)
    }
}

/// Direction of a traced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// One entry of the bus trace.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub direction: Direction,
    pub frame: Frame,
    pub at: Instant,
}

/// Port options.
#[derive(Debug, Clone, Copy)]
pub struct PortOptions {
    /// Upper bound of one blocking receive (shutdown latency).
    pub reader_poll: Duration,
    /// Trace queue capacity; the oldest record is dropped when full.
    pub trace_capacity: usize,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            reader_poll: DEFAULT_READER_POLL,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

/// Snapshot of port health and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub driver: DriverStatus,
    pub reader_running: bool,
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub callback_errors: u64,
    /// Last fatal receive error, if the reader stopped on one.
    pub fault: Option<String>,
}

struct PortShared {
    name: String,
    driver: Box<dyn CanDriver>,
    options: PortOptions,
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    next_subscriber: AtomicU64,
    running: AtomicBool,
    reader_id: Mutex<Option<ThreadId>>,
    trace_enabled: AtomicBool,
    /// `None` when the capacity is zero.
    trace: Option<ArrayQueue<TraceRecord>>,
    trace_signal: Mutex<()>,
    trace_ready: Condvar,
    frames_rx: AtomicU64,
    frames_tx: AtomicU64,
    callback_errors: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl PortShared {
    fn record(&self, direction: Direction, frame: &Frame) {
        let Some(trace) = &self.trace else {
            return;
        };
        if !self.trace_enabled.load(Ordering::Acquire) {
            return;
        }
        let record = TraceRecord {
            direction,
            frame: frame.clone(),
            at: Instant::now(),
        };
        if trace.force_push(record).is_some() {
            log::trace!("[port] {} trace full, oldest dropped", self.name);
        }
        let _signal = self.trace_signal.lock();
        self.trace_ready.notify_one();
    }

    fn dispatch(&self, frame: &Frame) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
        log::trace!("[port] {} rx {}", self.name, frame);
        self.record(Direction::Rx, frame);

        let subscribers = self.subscribers.load();
        for sub in subscribers.iter().filter(|s| s.matches(frame.id)) {
            let callback = &sub.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                self.callback_errors.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[port] {} subscriber {:?} panicked on {}",
                    self.name,
                    sub.id,
                    frame
                );
            }
        }
    }
}

/// One open channel plus its reading thread.
pub struct CanPort {
    shared: Arc<PortShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CanPort {
    /// Take ownership of an open driver and start the reading thread.
    pub fn start(name: &str, driver: Box<dyn CanDriver>, options: PortOptions) -> Self {
        let shared = Arc::new(PortShared {
            name: name.to_string(),
            driver,
            options,
            subscribers: ArcSwap::from_pointee(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            running: AtomicBool::new(true),
            reader_id: Mutex::new(None),
            trace_enabled: AtomicBool::new(false),
            trace: (options.trace_capacity > 0).then(|| ArrayQueue::new(options.trace_capacity)),
            trace_signal: Mutex::new(()),
            trace_ready: Condvar::new(),
            frames_rx: AtomicU64::new(0),
            frames_tx: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            fault: Mutex::new(None),
        });
        let reader_shared = Arc::clone(&shared);

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let handle = thread::Builder::new()
            .name(format!("comaster-canread-{}", name))
            .spawn(move || read_loop(&reader_shared))
            .expect("failed to spawn CAN reading thread");

        *shared.reader_id.lock() = Some(handle.thread().id());
        log::info!("[port] '{}' open", name);

        Self {
            shared,
            reader: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Hand one frame to the driver.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::PortClosed(self.shared.name.clone()));
        }
        self.shared.driver.send(frame).map_err(|e| match e {
            Error::PortClosed(_) | Error::Transport(_) => e,
            other => Error::Transport(other.to_string()),
        })?;
        self.shared.frames_tx.fetch_add(1, Ordering::Relaxed);
        log::trace!("[port] {} tx {}", self.shared.name, frame);
        self.shared.record(Direction::Tx, frame);
        Ok(())
    }

    /// Register a callback for frames with `(id & mask) == (pattern & mask)`.
    pub fn subscribe(&self, mask: u16, pattern: u16, callback: FrameCallback) -> SubscriberId {
        let id = SubscriberId(self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscriber {
            id,
            mask,
            pattern,
            callback,
        });
        self.shared.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&sub));
            next
        });
        log::debug!(
            "[port] {} subscribe {:?} mask=0x{:03X} pattern=0x{:03X}",
            self.shared.name,
            id,
            mask,
            pattern
        );
        id
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let previous = self.shared.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|s| s.id == id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load().len()
    }

    /// True when called from this port's reading thread.
    pub fn is_reader_thread(&self) -> bool {
        *self.shared.reader_id.lock() == Some(thread::current().id())
    }

    /// Start or stop recording traffic into the trace queue.
    pub fn trace_enable(&self, enabled: bool) {
        self.shared.trace_enabled.store(enabled, Ordering::Release);
        if let (false, Some(trace)) = (enabled, &self.shared.trace) {
            while trace.pop().is_some() {}
        }
    }

    /// Oldest trace record, waiting up to `timeout` for one.
    pub fn trace_pop(&self, timeout: Duration) -> Option<TraceRecord> {
        let trace = self.shared.trace.as_ref()?;
        let deadline = Instant::now() + timeout;
        let mut signal = self.shared.trace_signal.lock();
        loop {
            if let Some(record) = trace.pop() {
                return Some(record);
            }
            if self
                .shared
                .trace_ready
                .wait_until(&mut signal, deadline)
                .timed_out()
            {
                return trace.pop();
            }
        }
    }

    pub fn status(&self) -> PortStatus {
        PortStatus {
            driver: self.shared.driver.status(),
            reader_running: self.shared.running.load(Ordering::Acquire),
            frames_rx: self.shared.frames_rx.load(Ordering::Relaxed),
            frames_tx: self.shared.frames_tx.load(Ordering::Relaxed),
            callback_errors: self.shared.callback_errors.load(Ordering::Relaxed),
            fault: self.shared.fault.lock().clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the reader, join it and release the driver. Idempotent.
    ///
    /// When called from the reading thread itself the join is skipped; the
    /// thread exits after the current dispatch.
    pub fn close(&self) -> Result<()> {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        if !self.is_reader_thread() {
            if let Some(handle) = self.reader.lock().take() {
                let _ = handle.join();
            }
        }
        if was_running {
            let _signal = self.shared.trace_signal.lock();
            self.shared.trace_ready.notify_all();
            log::info!("[port] '{}' closed", self.shared.name);
        }
        self.shared.driver.close()
    }
}

impl Drop for CanPort {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("[port] '{}' close failed: {}", self.shared.name, e);
        }
    }
}

fn read_loop(shared: &PortShared) {
    while shared.running.load(Ordering::Acquire) {
        match shared.driver.receive(shared.options.reader_poll) {
            Ok(Some(mut frame)) => {
                frame.received = true;
                if frame.timestamp.is_none() {
                    frame.timestamp = Some(Instant::now());
                }
                shared.dispatch(&frame);
            }
            Ok(None) => {}
            Err(Error::PortClosed(_)) => break,
            Err(e) => {
                log::error!("[port] '{}' receive failed: {}", shared.name, e);
                *shared.fault.lock() = Some(e.to_string());
                shared.running.store(false, Ordering::Release);
                break;
            }
        }
    }
    log::debug!("[port] '{}' reader exit", shared.name);
}
