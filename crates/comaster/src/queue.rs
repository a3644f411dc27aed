// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device single-in-flight request queue.
//!
//! # State machine
//!
//! ```text
//!            push / answer / timeout
//!   ┌──────┐  send frame with wait_answer   ┌────────────────┐
//!   │ Idle │ ─────────────────────────────▶ │ AwaitingAnswer │
//!   └──────┘ ◀───────────────────────────── └────────────────┘
//!       ▲      frame id == desired_answer         │
//!       │      (alarm cancelled)                  │ alarm fired
//!       └─────────────────────────────────────────┘ (frame dropped)
//! ```
//!
//! Frames without `wait_answer` are drained back-to-back while Idle.
//! One device mutex guards the FIFO, the phase and the last sent/received
//! frames; the transport is called under it so hand-off order equals push
//! order.
//!
//! Received frames go through the interpreter chain *before* the queue
//! advances, so an interpreter may `push_front` follow-up requests (segment
//! requests) that must go out before anything already queued.

use crate::error::{Error, Result};
use crate::reactor::{AlarmId, Reactor};
use crate::transport::{CanPort, Frame, SubscriberId};
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Reception hook; returns `true` when it consumed the frame.
pub type Interpreter = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Called with the request whose answer never came.
pub type TimeoutHook = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Awaiting {
        generation: u64,
        alarm: Option<AlarmId>,
        desired: u16,
    },
}

struct QueueState {
    fifo: VecDeque<Frame>,
    phase: Phase,
    generation: u64,
    last_sent: Option<Frame>,
    last_received: Option<Frame>,
    fault: Option<String>,
    reply_timeout: Duration,
}

impl QueueState {
    fn is_drained(&self) -> bool {
        self.phase == Phase::Idle && self.fifo.is_empty()
    }
}

/// Traffic counters of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub sent: u64,
    pub received: u64,
    pub timeouts: u64,
}

/// Outgoing frame queue of one device.
pub struct RequestQueue {
    node_id: u8,
    port: Arc<CanPort>,
    reactor: Arc<Reactor>,
    state: Mutex<QueueState>,
    drained: Condvar,
    interpreters: ArcSwap<Vec<Interpreter>>,
    timeout_hook: Mutex<Option<TimeoutHook>>,
    subscription: Mutex<Option<SubscriberId>>,
    sent: AtomicU64,
    received: AtomicU64,
    timeouts: AtomicU64,
    this: Weak<RequestQueue>,
}

/// Same wire content: the transport echoed our own frame back.
fn is_echo(sent: &Frame, received: &Frame) -> bool {
    sent.id == received.id
        && sent.rtr == received.rtr
        && sent.len == received.len
        && sent.payload() == received.payload()
}

impl RequestQueue {
    /// Create the queue and subscribe it to frames of `node_id` on `port`.
    pub fn new(
        node_id: u8,
        port: Arc<CanPort>,
        reactor: Arc<Reactor>,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        let queue = Arc::new_cyclic(|this| Self {
            node_id,
            port,
            reactor,
            state: Mutex::new(QueueState {
                fifo: VecDeque::new(),
                phase: Phase::Idle,
                generation: 0,
                last_sent: None,
                last_received: None,
                fault: None,
                reply_timeout,
            }),
            drained: Condvar::new(),
            interpreters: ArcSwap::from_pointee(Vec::new()),
            timeout_hook: Mutex::new(None),
            subscription: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&queue);
        let sub = queue.port.subscribe(
            0x7F,
            u16::from(node_id),
            Arc::new(move |frame: &Frame| {
                if let Some(queue) = weak.upgrade() {
                    queue.on_frame(frame);
                }
            }),
        );
        *queue.subscription.lock() = Some(sub);
        queue
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn port(&self) -> &Arc<CanPort> {
        &self.port
    }

    /// Append a reception hook; hooks run in registration order.
    pub fn add_interpreter(&self, interpreter: Interpreter) {
        self.interpreters.rcu(|current| {
            let mut next: Vec<Interpreter> = current.iter().cloned().collect();
            next.push(Arc::clone(&interpreter));
            next
        });
    }

    pub fn set_timeout_hook(&self, hook: TimeoutHook) {
        *self.timeout_hook.lock() = Some(hook);
    }

    pub fn reply_timeout(&self) -> Duration {
        self.state.lock().reply_timeout
    }

    /// Applies to requests sent after the call.
    pub fn set_reply_timeout(&self, timeout: Duration) {
        self.state.lock().reply_timeout = timeout;
    }

    /// Append `frame` and send it right away if nothing is in flight.
    pub fn push(&self, frame: Frame) -> Result<()> {
        if frame.wait_answer && frame.desired_answer == 0 {
            return Err(Error::InvalidFrame(format!(
                "{} waits for an answer but names none",
                frame
            )));
        }
        let mut state = self.state.lock();
        state.fifo.push_back(frame);
        self.attempt_send(&mut state)
    }

    /// Insert `frames` at the head of the FIFO, keeping their order.
    pub fn push_front(&self, frames: Vec<Frame>) -> Result<()> {
        let mut state = self.state.lock();
        for frame in frames.into_iter().rev() {
            state.fifo.push_front(frame);
        }
        self.attempt_send(&mut state)
    }

    /// Drop every queued (not yet sent) frame. The in-flight request, if
    /// any, still completes or times out.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.fifo.len();
        state.fifo.clear();
        if state.is_drained() {
            self.drained.notify_all();
        }
        if dropped > 0 {
            log::debug!("[queue] node {} cleared {} frames", self.node_id, dropped);
        }
        dropped
    }

    /// Drop queued frames matching `pred`; returns how many.
    pub fn discard(&self, pred: impl Fn(&Frame) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.fifo.len();
        state.fifo.retain(|f| !pred(f));
        if state.is_drained() {
            self.drained.notify_all();
        }
        before - state.fifo.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().fifo.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().phase == Phase::Idle
    }

    pub fn last_sent(&self) -> Option<Frame> {
        self.state.lock().last_sent.clone()
    }

    pub fn last_received(&self) -> Option<Frame> {
        self.state.lock().last_received.clone()
    }

    /// Last transport failure seen while sending.
    pub fn fault(&self) -> Option<String> {
        self.state.lock().fault.clone()
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Block until the FIFO is empty and nothing is in flight.
    ///
    /// Returns `Ok(false)` on timeout. Fails immediately on the port's
    /// reading thread, the only thread able to deliver the awaited answer.
    pub fn wait_queue_empty(&self, timeout: Duration) -> Result<bool> {
        if self.port.is_reader_thread() {
            return Err(Error::WaitOnReaderThread("wait_queue_empty"));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_drained() {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.is_drained());
            }
        }
        Ok(true)
    }

    /// Stop receiving frames from the port.
    pub fn detach(&self) {
        if let Some(sub) = self.subscription.lock().take() {
            self.port.unsubscribe(sub);
        }
    }

    fn attempt_send(&self, state: &mut QueueState) -> Result<()> {
        while state.phase == Phase::Idle {
            let Some(mut frame) = state.fifo.pop_front() else {
                self.drained.notify_all();
                return Ok(());
            };

            if let Err(e) = self.port.send(&frame) {
                log::error!("[queue] node {} send {} failed: {}", self.node_id, frame, e);
                state.fault = Some(e.to_string());
                if state.is_drained() {
                    self.drained.notify_all();
                }
                return Err(match e {
                    Error::Transport(_) | Error::PortClosed(_) => e,
                    other => Error::Transport(other.to_string()),
                });
            }
            frame.sent = true;
            frame.timestamp = Some(Instant::now());
            self.sent.fetch_add(1, Ordering::Relaxed);

            if frame.wait_answer {
                state.generation += 1;
                let generation = state.generation;
                let desired = frame.desired_answer;
                let weak = self.this.clone();
                let alarm = self
                    .reactor
                    .schedule_after(state.reply_timeout, move || {
                        if let Some(queue) = weak.upgrade() {
                            queue.on_timeout(generation);
                        }
                    })
                    .map_err(|e| {
                        log::warn!("[queue] node {} no timeout armed: {}", self.node_id, e);
                        e
                    })
                    .ok();
                state.phase = Phase::Awaiting {
                    generation,
                    alarm,
                    desired,
                };
            }
            state.last_sent = Some(frame);
        }
        Ok(())
    }

    /// Reception path, runs on the port's reading thread.
    fn on_frame(&self, frame: &Frame) {
        let generation = {
            let mut state = self.state.lock();
            if let Some(sent) = &state.last_sent {
                if is_echo(sent, frame) {
                    log::trace!("[queue] node {} ignore own frame {}", self.node_id, frame);
                    return;
                }
            }
            state.last_received = Some(frame.clone());
            state.generation
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        let interpreters = self.interpreters.load();
        for interpret in interpreters.iter() {
            if interpret(frame) {
                break;
            }
        }

        let mut state = self.state.lock();
        if let Phase::Awaiting {
            generation: g,
            alarm,
            desired,
        } = state.phase
        {
            // A timeout in between already moved on to another request.
            if g == generation && desired == frame.id {
                if let Some(alarm) = alarm {
                    self.reactor.cancel(alarm);
                }
                state.phase = Phase::Idle;
                if let Err(e) = self.attempt_send(&mut state) {
                    log::error!("[queue] node {} resume failed: {}", self.node_id, e);
                }
            }
        }
    }

    fn on_timeout(&self, generation: u64) {
        let expired = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Awaiting { generation: g, desired, .. } if g == generation => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[queue] node {} no answer 0x{:03X} within {:?}",
                        self.node_id,
                        desired,
                        state.reply_timeout
                    );
                    state.phase = Phase::Idle;
                    state.last_sent.clone()
                }
                _ => {
                    log::debug!("[queue] node {} harmless timeout", self.node_id);
                    return;
                }
            }
        };

        let hook = self.timeout_hook.lock().clone();
        if let (Some(frame), Some(hook)) = (expired, hook) {
            hook(&frame);
        }

        let mut state = self.state.lock();
        if let Err(e) = self.attempt_send(&mut state) {
            log::error!("[queue] node {} resume after timeout failed: {}", self.node_id, e);
        }
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CanDriver, PortOptions, VirtualBus, VirtualDriver};

    struct Rig {
        queue: Arc<RequestQueue>,
        peer: VirtualDriver,
        _reactor: Arc<Reactor>,
    }

    fn rig(name: &str, timeout: Duration) -> Rig {
        let bus = VirtualBus::new(name);
        let port = Arc::new(CanPort::start(
            name,
            Box::new(bus.endpoint()),
            PortOptions {
                reader_poll: Duration::from_millis(10),
                ..PortOptions::default()
            },
        ));
        let reactor = Arc::new(Reactor::start(name));
        let queue = RequestQueue::new(5, port, Arc::clone(&reactor), timeout);
        Rig {
            queue,
            peer: bus.endpoint(),
            _reactor: reactor,
        }
    }

    fn recv(peer: &VirtualDriver, within: Duration) -> Option<Frame> {
        peer.receive(within).unwrap()
    }

    #[test]
    fn test_fifo_order_without_answers() {
        let rig = rig("queue-fifo", Duration::from_millis(200));
        for i in 0..10u8 {
            rig.queue.push(Frame::new(0x205, &[i]).unwrap()).unwrap();
        }
        for i in 0..10u8 {
            let f = recv(&rig.peer, Duration::from_secs(1)).unwrap();
            assert_eq!(f.data[0], i);
        }
        assert!(rig.queue.wait_queue_empty(Duration::from_millis(100)).unwrap());
        assert_eq!(rig.queue.counters().sent, 10);
    }

    #[test]
    fn test_single_in_flight_until_answer() {
        let rig = rig("queue-inflight", Duration::from_secs(5));
        rig.queue
            .push(Frame::new(0x605, &[0x40]).unwrap().expect_answer(0x585))
            .unwrap();
        rig.queue.push(Frame::new(0x205, &[1]).unwrap()).unwrap();

        assert_eq!(recv(&rig.peer, Duration::from_secs(1)).unwrap().id, 0x605);
        assert!(recv(&rig.peer, Duration::from_millis(80)).is_none());
        assert!(!rig.queue.is_idle());
        assert_eq!(rig.queue.pending(), 1);

        rig.peer.send(&Frame::new(0x585, &[0x60]).unwrap()).unwrap();
        assert_eq!(recv(&rig.peer, Duration::from_secs(1)).unwrap().id, 0x205);
        assert!(rig.queue.wait_queue_empty(Duration::from_secs(1)).unwrap());
        assert_eq!(rig.queue.last_received().unwrap().id, 0x585);
    }

    #[test]
    fn test_unrelated_frame_does_not_release() {
        let rig = rig("queue-unrelated", Duration::from_secs(5));
        rig.queue
            .push(Frame::new(0x605, &[0x40]).unwrap().expect_answer(0x585))
            .unwrap();
        rig.queue.push(Frame::new(0x205, &[1]).unwrap()).unwrap();
        recv(&rig.peer, Duration::from_secs(1)).unwrap();
        rig.peer.send(&Frame::new(0x185, &[0; 8]).unwrap()).unwrap();
        assert!(recv(&rig.peer, Duration::from_millis(80)).is_none());
    }

    #[test]
    fn test_timeout_drops_and_resumes() {
        let rig = rig("queue-timeout", Duration::from_millis(40));
        let expired = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&expired);
        rig.queue
            .set_timeout_hook(Arc::new(move |f: &Frame| e.lock().push(f.id)));
        rig.queue
            .push(Frame::new(0x605, &[0x40]).unwrap().expect_answer(0x585))
            .unwrap();
        rig.queue.push(Frame::new(0x205, &[2]).unwrap()).unwrap();

        let start = Instant::now();
        assert_eq!(recv(&rig.peer, Duration::from_secs(1)).unwrap().id, 0x605);
        let next = recv(&rig.peer, Duration::from_secs(1)).unwrap();
        assert_eq!(next.id, 0x205);
        assert!(start.elapsed() >= Duration::from_millis(35));
        // Not retried.
        assert!(recv(&rig.peer, Duration::from_millis(100)).is_none());
        assert_eq!(rig.queue.counters().timeouts, 1);
        assert_eq!(*expired.lock(), vec![0x605]);
    }

    #[test]
    fn test_push_front_and_discard() {
        let rig = rig("queue-front", Duration::from_secs(5));
        rig.queue
            .push(Frame::new(0x605, &[0x40]).unwrap().expect_answer(0x585))
            .unwrap();
        rig.queue.push(Frame::new(0x205, &[9]).unwrap()).unwrap();
        rig.queue
            .push_front(vec![
                Frame::new(0x605, &[0x60]).unwrap(),
                Frame::new(0x605, &[0x70]).unwrap(),
            ])
            .unwrap();
        assert_eq!(rig.queue.pending(), 3);
        assert_eq!(rig.queue.discard(|f| f.data[0] == 0x70), 1);

        recv(&rig.peer, Duration::from_secs(1)).unwrap();
        rig.peer.send(&Frame::new(0x585, &[0x60]).unwrap()).unwrap();
        assert_eq!(recv(&rig.peer, Duration::from_secs(1)).unwrap().data[0], 0x60);
        assert_eq!(recv(&rig.peer, Duration::from_secs(1)).unwrap().data[0], 9);
    }

    #[test]
    fn test_interpreters_claim_in_order() {
        let rig = rig("queue-interp", Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&seen), Arc::clone(&seen));
        rig.queue.add_interpreter(Arc::new(move |f: &Frame| {
            a.lock().push(("first", f.id));
            f.id == 0x185
        }));
        rig.queue.add_interpreter(Arc::new(move |f: &Frame| {
            b.lock().push(("second", f.id));
            true
        }));
        rig.peer.send(&Frame::new(0x185, &[0]).unwrap()).unwrap();
        rig.peer.send(&Frame::new(0x585, &[0]).unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while seen.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            *seen.lock(),
            vec![("first", 0x185), ("first", 0x585), ("second", 0x585)]
        );
    }

    #[test]
    fn test_invalid_answer_spec_rejected() {
        let rig = rig("queue-invalid", Duration::from_secs(1));
        let mut frame = Frame::new(0x605, &[0x40]).unwrap();
        frame.wait_answer = true;
        assert!(matches!(rig.queue.push(frame), Err(Error::InvalidFrame(_))));
        assert_eq!(rig.queue.clear(), 0);
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let rig = rig("queue-closed", Duration::from_secs(1));
        rig.queue.port().close().unwrap();
        let err = rig.queue.push(Frame::new(0x205, &[1]).unwrap()).unwrap_err();
        assert!(matches!(err, Error::PortClosed(_)));
        assert!(rig.queue.fault().is_some());
        assert!(rig.queue.wait_queue_empty(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_from_reader_thread_fails_fast() {
        let rig = rig("queue-reader-wait", Duration::from_secs(1));
        let (tx, rx) = crossbeam::channel::unbounded();
        let q = Arc::clone(&rig.queue);
        rig.queue.add_interpreter(Arc::new(move |_: &Frame| {
            let r = q.wait_queue_empty(Duration::from_secs(10));
            tx.send(matches!(r, Err(Error::WaitOnReaderThread(_)))).unwrap();
            true
        }));
        rig.peer.send(&Frame::new(0x185, &[0]).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
}
