// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol engine of one peer device.
//!
//! # Architecture
//!
//! ```text
//!   application thread                 CAN reading thread
//!   ──────────────────                 ──────────────────
//!   write / request / map_pdo          RequestQueue::on_frame
//!        │                                  │
//!        ▼                                  ▼
//!   RequestQueue::push ──▶ port      interpreters: PDO demux, then
//!                                     register replies / node state / EMCY
//!                                           │
//!                                           ▼
//!                                   ValueCache + EventBus::publish
//! ```
//!
//! A `ProtocolEngine` composes the queue, the shared dictionary, the value
//! cache and the event bus. Register transfers live in [`sdo`], broadcast
//! mapping in [`pdo`], node management in [`nmt`].
//!
//! Blocking calls ([`ProtocolEngine::read_and_get`],
//! [`ProtocolEngine::wait_update`], [`ProtocolEngine::wait_queue_empty`],
//! [`ProtocolEngine::spin`]) take a finite timeout and refuse to run on the
//! port's reading thread.

pub mod nmt;
pub mod pdo;
pub mod sdo;

pub use pdo::MappingSlot;

use crate::cache::{Sample, ValueCache};
use crate::config::{DEFAULT_INIT_TIMEOUT, DEFAULT_REPLY_TIMEOUT};
use crate::dictionary::{Dictionary, Key, RegisterDescriptor, RegisterId, RegisterRef};
use crate::error::{Error, Result};
use crate::events::{register_event, Event, EventBus, Payload};
use crate::protocol::NmtState;
use crate::queue::{QueueCounters, RequestQueue};
use crate::reactor::Reactor;
use crate::transport::{CanPort, Frame};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Answer deadline of each correlated request.
    pub reply_timeout: Duration,
    /// Blocking read timeout used by `init` and `init_pdo`.
    pub init_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Master-side state machine of one peer.
pub struct ProtocolEngine {
    device_id: u16,
    node_id: u8,
    queue: Arc<RequestQueue>,
    cache: ValueCache,
    events: EventBus,
    sdo: Mutex<sdo::SdoState>,
    reads: sdo::PendingReads,
    pdo: Mutex<pdo::PdoState>,
    nmt: Mutex<NmtState>,
    init_timeout: Duration,
}

impl ProtocolEngine {
    /// Build the engine and attach it to `port`.
    ///
    /// `queue_reactor` drives reply timeouts, `event_reactor` runs
    /// reactor-synchronous event callbacks.
    pub fn new(
        device_id: u16,
        node_id: u8,
        dictionary: Arc<Dictionary>,
        port: Arc<CanPort>,
        queue_reactor: Arc<Reactor>,
        event_reactor: Arc<Reactor>,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        let node_id = crate::config::check_node_id(node_id)?;
        let cache = ValueCache::new(dictionary)?;
        let queue = RequestQueue::new(node_id, port, queue_reactor, options.reply_timeout);

        let engine = Arc::new(Self {
            device_id,
            node_id,
            queue,
            cache,
            events: EventBus::new(device_id, event_reactor),
            sdo: Mutex::new(sdo::SdoState::default()),
            reads: sdo::PendingReads::default(),
            pdo: Mutex::new(pdo::PdoState::default()),
            nmt: Mutex::new(NmtState::Unknown),
            init_timeout: options.init_timeout,
        });

        let weak = Arc::downgrade(&engine);
        engine.queue.add_interpreter(Arc::new(move |frame: &Frame| {
            weak.upgrade().is_some_and(|e| e.demux_pdo(frame))
        }));
        let weak = Arc::downgrade(&engine);
        engine.queue.add_interpreter(Arc::new(move |frame: &Frame| {
            weak.upgrade().is_some_and(|e| e.interpret(frame))
        }));
        let weak = Arc::downgrade(&engine);
        engine.queue.set_timeout_hook(Arc::new(move |frame: &Frame| {
            if let Some(e) = weak.upgrade() {
                e.on_request_timeout(frame);
            }
        }));

        log::info!(
            "[master] device {} attached as node {} on '{}'",
            device_id,
            node_id,
            engine.queue.port().name()
        );
        Ok(engine)
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn port(&self) -> &Arc<CanPort> {
        self.queue.port()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dictionary(&self) -> Arc<Dictionary> {
        self.cache.dictionary()
    }

    /// Resolve `(index, subindex)` against the current dictionary.
    pub fn find_key(&self, index: u16, subindex: u8) -> Result<Key> {
        self.cache.dictionary().find(index, subindex)
    }

    pub fn try_find(&self, id: RegisterId) -> Option<Key> {
        self.cache.dictionary().try_find(id)
    }

    pub fn descriptor<R: RegisterRef>(&self, reg: R) -> Result<RegisterDescriptor> {
        let dict = self.cache.dictionary();
        let key = reg.resolve(&dict)?;
        dict.entry(key).cloned()
    }

    pub(crate) fn resolve<R: RegisterRef>(&self, reg: R) -> Result<(Key, RegisterDescriptor)> {
        let dict = self.cache.dictionary();
        let key = reg.resolve(&dict)?;
        Ok((key, dict.entry(key)?.clone()))
    }

    /// Cached value, demoting `New` to `Old`.
    pub fn last_received<R: RegisterRef>(&self, reg: R) -> Result<Sample> {
        let (key, _) = self.resolve(reg)?;
        self.cache.take(key)
    }

    /// Block until a new value of `reg` arrives (reply or broadcast) without
    /// sending anything.
    pub fn wait_update<R: RegisterRef>(&self, reg: R, timeout: Duration) -> Result<Sample> {
        self.ensure_not_reader("wait_update")?;
        let (key, _) = self.resolve(reg)?;
        if self.cache.wait_new(key, Instant::now() + timeout)? {
            self.cache.take(key)
        } else {
            Ok(Sample::timed_out())
        }
    }

    fn ensure_not_reader(&self, op: &'static str) -> Result<()> {
        if self.queue.port().is_reader_thread() {
            return Err(Error::WaitOnReaderThread(op));
        }
        Ok(())
    }

    /// Replace the dictionary (or rebuild over the current one).
    ///
    /// Every cached value returns to `NoData`, keys resolved before the call
    /// become invalid and broadcast mappings are forgotten. Initialisation is
    /// not re-run.
    pub fn rebuild(&self, dictionary: Option<Arc<Dictionary>>) -> Result<()> {
        let dictionary = dictionary.unwrap_or_else(|| self.cache.dictionary());
        self.cache.rebuild(dictionary)?;
        *self.pdo.lock() = pdo::PdoState::default();
        let interrupted = self.sdo.lock().reset();
        if interrupted.is_some() {
            log::debug!("[master] device {} read interrupted by rebuild", self.device_id);
        }
        self.reads.fail_all();
        log::info!("[master] device {} cache rebuilt", self.device_id);
        Ok(())
    }

    // ===== Queue passthrough =====

    pub fn wait_queue_empty(&self, timeout: Duration) -> Result<bool> {
        self.queue.wait_queue_empty(timeout)
    }

    /// Drop frames not yet handed to the transport.
    pub fn clear_send_buffer(&self) -> usize {
        self.queue.clear()
    }

    pub fn counters(&self) -> QueueCounters {
        self.queue.counters()
    }

    pub fn set_reply_timeout(&self, timeout: Duration) {
        self.queue.set_reply_timeout(timeout);
    }

    pub fn last_sent_frame(&self) -> Option<Frame> {
        self.queue.last_sent()
    }

    pub fn last_received_frame(&self) -> Option<Frame> {
        self.queue.last_received()
    }

    /// Run deferred event callbacks on the calling thread.
    pub fn spin(&self, timeout: Duration) -> Result<usize> {
        self.ensure_not_reader("spin")?;
        Ok(self.events.spin(timeout))
    }

    /// Stop receiving; queued frames are dropped.
    pub fn detach(&self) {
        self.queue.clear();
        self.queue.detach();
        self.reads.fail_all();
        log::info!("[master] device {} detached", self.device_id);
    }

    pub(crate) fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub(crate) fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub(crate) fn publish_update(&self, id: RegisterId, value: Value) {
        self.events.publish(Event::new(
            register_event(id),
            self.device_id,
            Payload::RegisterUpdate { id, value },
        ));
    }

    /// Frames that are not broadcast data.
    fn interpret(&self, frame: &Frame) -> bool {
        use crate::config::{COB_EMCY, COB_NMT_ERROR, COB_SDO_REPLY};
        match frame.function() {
            COB_SDO_REPLY if !frame.rtr => {
                self.on_sdo_reply(frame);
                true
            }
            COB_NMT_ERROR if !frame.rtr => {
                self.on_node_state(frame);
                true
            }
            COB_EMCY if !frame.rtr && frame.len > 0 => {
                self.on_emergency(frame);
                true
            }
            _ => false,
        }
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.queue.detach();
    }
}
