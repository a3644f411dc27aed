// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded task reactor.
//!
//! Each [`Reactor`] owns one worker thread and a task queue:
//!
//! - [`post`](Reactor::post) runs a callback as soon as possible, in FIFO order.
//! - [`schedule_after`](Reactor::schedule_after) arms a one-shot alarm that
//!   can be [`cancel`](Reactor::cancel)led until it fires.
//! - [`stop`](Reactor::stop) drops pending work and joins the worker.
//!
//! The master runs two of them: one for request-queue retries/timeouts and
//! one for reactor-synchronous event delivery, so a slow application callback
//! can never delay a bus timeout.

use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle of a scheduled alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(u64);

enum Message {
    Run(Task),
    /// Alarm set changed or stop requested: recompute the next deadline.
    Wake,
}

#[derive(Default)]
struct AlarmState {
    alarms: BinaryHeap<Reverse<(Instant, u64)>>,
    armed: HashMap<u64, Task>,
    next_alarm: u64,
    stopped: bool,
}

struct Shared {
    name: String,
    tasks: Sender<Message>,
    state: Mutex<AlarmState>,
    worker: Mutex<Option<ThreadId>>,
}

/// Event loop on a dedicated thread.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Spawn the worker thread.
    pub fn start(name: &str) -> Self {
        let (tasks, inbox) = channel::unbounded();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            tasks,
            state: Mutex::new(AlarmState::default()),
            worker: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = thread::Builder::new()
            .name(format!("comaster-{}", name))
            .spawn(move || run(&worker_shared, &inbox))
            .expect("failed to spawn reactor thread");

        *shared.worker.lock() = Some(thread.thread().id());
        log::debug!("[reactor] '{}' started", name);

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a zero-delay callback.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.shared.state.lock();
        if state.stopped {
            return Err(Error::ReactorStopped);
        }
        self.shared
            .tasks
            .send(Message::Run(Box::new(task)))
            .map_err(|_| Error::ReactorStopped)
    }

    /// Arm a one-shot alarm firing after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Result<AlarmId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(Error::ReactorStopped);
        }
        let id = state.next_alarm;
        state.next_alarm += 1;
        state.alarms.push(Reverse((Instant::now() + delay, id)));
        state.armed.insert(id, Box::new(task));
        self.shared
            .tasks
            .send(Message::Wake)
            .map_err(|_| Error::ReactorStopped)?;
        Ok(AlarmId(id))
    }

    /// Disarm an alarm. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self, alarm: AlarmId) -> bool {
        self.shared.state.lock().armed.remove(&alarm.0).is_some()
    }

    /// True when called from this reactor's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        *self.shared.worker.lock() == Some(thread::current().id())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Drop pending tasks and alarms, then join the worker.
    ///
    /// Safe to call more than once and from the worker itself (no join then).
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.stopped {
                state.stopped = true;
                state.alarms.clear();
                state.armed.clear();
                let _ = self.shared.tasks.send(Message::Wake);
            }
        }
        if self.is_worker_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            log::debug!("[reactor] '{}' stopped", self.shared.name);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pop the earliest due alarm, or report when the next one is due.
fn next_alarm(state: &mut AlarmState) -> (Option<Task>, Option<Instant>) {
    let now = Instant::now();
    while let Some(Reverse((at, id))) = state.alarms.peek().copied() {
        if at > now {
            return (None, Some(at));
        }
        state.alarms.pop();
        // Cancelled alarms leave a stale heap entry behind.
        if let Some(task) = state.armed.remove(&id) {
            return (Some(task), None);
        }
    }
    (None, None)
}

fn run_task(shared: &Shared, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::error!("[reactor] '{}' task panicked", shared.name);
    }
}

fn run(shared: &Shared, inbox: &Receiver<Message>) {
    loop {
        let (due, deadline) = {
            let mut state = shared.state.lock();
            if state.stopped {
                return;
            }
            next_alarm(&mut state)
        };
        if let Some(task) = due {
            run_task(shared, task);
            continue;
        }

        let message = match deadline {
            Some(at) => inbox.recv_deadline(at),
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
            Ok(Message::Run(task)) => {
                // Posted work left over from before a stop is dropped.
                if shared.state.lock().stopped {
                    return;
                }
                run_task(shared, task);
            }
            Ok(Message::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
