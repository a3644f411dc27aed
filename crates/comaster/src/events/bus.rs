// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device subscription registry and dispatcher.
//!
//! `publish` snapshots the matching deliveries under the registry lock,
//! applies enable-once bookkeeping there, and runs or hands off callbacks
//! only after the lock is released, so a callback may freely reconfigure
//! or erase subscriptions.

use super::{DeliveryMode, Event, EventCallback, Repeat};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Sink for [`DeliveryMode::Print`].
pub type PrintSink = Arc<dyn Fn(&str) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    event_id: u32,
    mode: DeliveryMode,
    callback: Option<EventCallback>,
    repeat: Repeat,
}

enum Delivery {
    Print,
    Inline(EventCallback),
    Reactor(EventCallback),
    Deferred(EventCallback),
}

/// Event subscriptions of one device.
pub struct EventBus {
    device_id: u16,
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    reactor: Arc<Reactor>,
    deferred: Mutex<VecDeque<(EventCallback, Event)>>,
    deferred_ready: Condvar,
    print_sink: Mutex<PrintSink>,
    published: AtomicU64,
}

impl EventBus {
    /// `reactor` runs [`DeliveryMode::ReactorSync`] callbacks.
    pub fn new(device_id: u16, reactor: Arc<Reactor>) -> Self {
        Self {
            device_id,
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reactor,
            deferred: Mutex::new(VecDeque::new()),
            deferred_ready: Condvar::new(),
            print_sink: Mutex::new(Arc::new(|line: &str| println!("{}", line))),
            published: AtomicU64::new(0),
        }
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Register interest in `event_id`.
    pub fn subscribe(
        &self,
        event_id: u32,
        mode: DeliveryMode,
        callback: Option<EventCallback>,
    ) -> Result<SubscriptionId> {
        if mode.needs_callback() && callback.is_none() {
            return Err(Error::MissingCallback);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push(Subscription {
            id,
            event_id,
            mode,
            callback,
            repeat: Repeat::Enabled,
        });
        log::debug!(
            "[events] device {} subscribe {:?} to 0x{:X} ({:?})",
            self.device_id,
            id,
            event_id,
            mode
        );
        Ok(id)
    }

    fn with_subscription<R>(
        &self,
        id: SubscriptionId,
        f: impl FnOnce(&mut Subscription) -> Result<R>,
    ) -> Result<R> {
        let mut subs = self.subscriptions.lock();
        let sub = subs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(Error::SubscriptionNotFound(id.0))?;
        f(sub)
    }

    /// Change the delivery mode; callback modes require a callback.
    pub fn configure_mode(&self, id: SubscriptionId, mode: DeliveryMode) -> Result<()> {
        self.with_subscription(id, |sub| {
            if mode.needs_callback() && sub.callback.is_none() {
                return Err(Error::MissingCallback);
            }
            sub.mode = mode;
            Ok(())
        })
    }

    pub fn configure_callback(&self, id: SubscriptionId, callback: EventCallback) -> Result<()> {
        self.with_subscription(id, |sub| {
            sub.callback = Some(callback);
            Ok(())
        })
    }

    pub fn configure_repeat(&self, id: SubscriptionId, repeat: Repeat) -> Result<()> {
        self.with_subscription(id, |sub| {
            sub.repeat = repeat;
            Ok(())
        })
    }

    pub fn repeat(&self, id: SubscriptionId) -> Result<Repeat> {
        self.with_subscription(id, |sub| Ok(sub.repeat))
    }

    /// Remove one subscription.
    pub fn erase_event(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(Error::SubscriptionNotFound(id.0));
        }
        Ok(())
    }

    /// Remove every subscription to `event_id`; returns how many.
    pub fn erase_events(&self, event_id: u32) -> usize {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.event_id != event_id);
        before - subs.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Replace the output of print-mode subscriptions (stdout by default).
    pub fn set_print_sink(&self, sink: PrintSink) {
        *self.print_sink.lock() = sink;
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Dispatch `event` to every enabled subscription of its id.
    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let deliveries: Vec<Delivery> = {
            let mut subs = self.subscriptions.lock();
            subs.iter_mut()
                .filter(|s| s.event_id == event.id && s.repeat != Repeat::Disabled)
                .filter_map(|s| {
                    if s.repeat == Repeat::EnableOnce {
                        s.repeat = Repeat::Disabled;
                    }
                    match (s.mode, s.callback.clone()) {
                        (DeliveryMode::Print, _) => Some(Delivery::Print),
                        (DeliveryMode::InlineOnReceive, Some(cb)) => Some(Delivery::Inline(cb)),
                        (DeliveryMode::ReactorSync, Some(cb)) => Some(Delivery::Reactor(cb)),
                        (DeliveryMode::PollDeferred, Some(cb)) => Some(Delivery::Deferred(cb)),
                        (_, None) => None,
                    }
                })
                .collect()
        };
        if deliveries.is_empty() {
            return;
        }

        for delivery in deliveries {
            match delivery {
                Delivery::Print => {
                    let sink = Arc::clone(&*self.print_sink.lock());
                    sink(&event.to_string());
                }
                Delivery::Inline(cb) => invoke(&cb, &event),
                Delivery::Reactor(cb) => {
                    let queued = event.clone();
                    if let Err(e) = self.reactor.post(move || invoke(&cb, &queued)) {
                        log::warn!(
                            "[events] device {} dropped event 0x{:X}: {}",
                            self.device_id,
                            event.id,
                            e
                        );
                    }
                }
                Delivery::Deferred(cb) => {
                    self.deferred.lock().push_back((cb, event.clone()));
                    self.deferred_ready.notify_all();
                }
            }
        }
    }

    /// Deferred callbacks waiting for [`spin`](Self::spin).
    pub fn pending(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Wait up to `timeout` for at least one deferred callback, then run
    /// every queued one on the calling thread. Returns how many ran.
    pub fn spin(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let batch: Vec<(EventCallback, Event)> = {
            let mut queue = self.deferred.lock();
            while queue.is_empty() {
                if self
                    .deferred_ready
                    .wait_until(&mut queue, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            queue.drain(..).collect()
        };
        for (cb, event) in &batch {
            invoke(cb, event);
        }
        batch.len()
    }
}

fn invoke(callback: &EventCallback, event: &Event) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        log::error!(
            "[events] device {} callback for event 0x{:X} panicked",
            event.device_id,
            event.id
        );
    }
}
