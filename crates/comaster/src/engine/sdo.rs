// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Confirmed register transfers.
//!
//! Values of 1..=4 bytes use the expedited form. Longer values (64-bit
//! scalars, strings) go through segmented transfers: the engine keeps the
//! per-transfer state here and injects each follow-up segment at the front
//! of the request queue from the reading thread.
//!
//! A blocking read tags its request frame and waits for the transfer that
//! answers that frame, so write acknowledgements or broadcasts landing on
//! the same register in between are never taken for its answer.

use super::ProtocolEngine;
use crate::cache::Sample;
use crate::config::{EXPEDITED_MAX_BYTES, MAX_UPLOAD_BYTES, SEGMENT_BYTES};
use crate::dictionary::{Key, RegisterId, RegisterRef};
use crate::error::{Error, Result};
use crate::events::{Event, Payload, EVENT_PROTOCOL_ERROR};
use crate::protocol::sdo::{self, Reply};
use crate::protocol::AbortCode;
use crate::transport::Frame;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Upload {
    id: RegisterId,
    /// Tag of the read request that started the transfer, 0 when untagged.
    tag: u64,
    expected: Option<usize>,
    limit: usize,
    buffer: Vec<u8>,
    toggle: bool,
}

struct Download {
    id: RegisterId,
    bytes: Vec<u8>,
    offset: usize,
    toggle: bool,
}

/// In-flight segmented transfers of one device.
#[derive(Default)]
pub(crate) struct SdoState {
    upload: Option<Upload>,
    download: Option<Download>,
    /// Payloads of queued segmented writes, in push order per register.
    staged: HashMap<RegisterId, VecDeque<Vec<u8>>>,
}

impl SdoState {
    /// Forget both transfers; returns the tag of an interrupted read.
    pub(crate) fn reset(&mut self) -> Option<u64> {
        self.download = None;
        self.upload.take().map(|u| u.tag)
    }

    fn unstage(&mut self, id: RegisterId, newest: bool) -> Option<Vec<u8>> {
        let queue = self.staged.get_mut(&id)?;
        let bytes = if newest {
            queue.pop_back()
        } else {
            queue.pop_front()
        };
        if queue.is_empty() {
            self.staged.remove(&id);
        }
        bytes
    }
}

enum ReadSlot {
    Waiting,
    Answered(Value, Instant),
    Failed,
}

/// Blocking reads waiting for the answer to their own request.
#[derive(Default)]
pub(crate) struct PendingReads {
    next_tag: AtomicU64,
    slots: Mutex<HashMap<u64, ReadSlot>>,
    done: Condvar,
}

impl PendingReads {
    fn open(&self) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.slots.lock().insert(tag, ReadSlot::Waiting);
        tag
    }

    fn forget(&self, tag: u64) {
        self.slots.lock().remove(&tag);
    }

    /// Settle the read tagged `tag`; `None` means it got no value.
    fn complete(&self, tag: u64, answer: Option<(Value, Instant)>) {
        if tag == 0 {
            return;
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&tag) {
            *slot = match answer {
                Some((value, at)) => ReadSlot::Answered(value, at),
                None => ReadSlot::Failed,
            };
            self.done.notify_all();
        }
    }

    /// Settle every pending read without a value.
    pub(crate) fn fail_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            if matches!(slot, ReadSlot::Waiting) {
                *slot = ReadSlot::Failed;
            }
        }
        self.done.notify_all();
    }

    fn wait(&self, tag: u64, deadline: Instant) -> Option<(Value, Instant)> {
        let mut slots = self.slots.lock();
        loop {
            match slots.get(&tag) {
                Some(ReadSlot::Waiting) => {}
                _ => break,
            }
            if self.done.wait_until(&mut slots, deadline).timed_out() {
                break;
            }
        }
        match slots.remove(&tag) {
            Some(ReadSlot::Answered(value, at)) => Some((value, at)),
            _ => None,
        }
    }
}

enum Outcome {
    Nothing,
    Updated(RegisterId, Value),
    Aborted(RegisterId, AbortCode),
}

impl ProtocolEngine {
    /// Queue a write of `value` to a register.
    ///
    /// The value is converted to the register's declared kind first; the
    /// cache is updated only when the peer acknowledges.
    pub fn write<R: RegisterRef>(&self, reg: R, value: impl Into<Value>) -> Result<()> {
        let (_, desc) = self.resolve(reg)?;
        if !desc.access.is_writable() {
            return Err(Error::AccessDenied {
                id: desc.id,
                access: desc.access,
            });
        }
        let value = value.into().convert_to(desc.kind)?;
        let bytes = value.to_le_bytes();

        if !bytes.is_empty() && bytes.len() <= EXPEDITED_MAX_BYTES {
            log::debug!("[sdo] node {} write {} = {}", self.node_id, desc.id, value);
            return self
                .queue
                .push(sdo::expedited_download(self.node_id, desc.id, &bytes)?);
        }

        let size = u32::try_from(bytes.len())
            .map_err(|_| Error::InvalidFrame(format!("{} bytes for {}", bytes.len(), desc.id)))?;
        log::debug!(
            "[sdo] node {} segmented write {} ({} bytes)",
            self.node_id,
            desc.id,
            size
        );
        self.sdo
            .lock()
            .staged
            .entry(desc.id)
            .or_default()
            .push_back(bytes);
        let pushed = self
            .queue
            .push(sdo::initiate_segmented_download(self.node_id, desc.id, size));
        if pushed.is_err() {
            self.sdo.lock().unstage(desc.id, true);
        }
        pushed
    }

    /// Queue a read request. The cached entry is demoted so the answer shows
    /// up as `New`; returns the resolved key.
    pub fn request<R: RegisterRef>(&self, reg: R) -> Result<Key> {
        let (key, desc) = self.resolve(reg)?;
        self.push_upload(key, desc.id, 0)?;
        Ok(key)
    }

    /// Request a register and block until the answer to this request
    /// arrives or `timeout` passes (`ReadStatus::TimedOut`).
    ///
    /// A peer abort or a dropped request ends the wait early with the same
    /// status.
    pub fn read_and_get<R: RegisterRef>(&self, reg: R, timeout: Duration) -> Result<Sample> {
        self.ensure_not_reader("read_and_get")?;
        let deadline = Instant::now() + timeout;
        let (key, desc) = self.resolve(reg)?;
        let tag = self.reads.open();
        if let Err(e) = self.push_upload(key, desc.id, tag) {
            self.reads.forget(tag);
            return Err(e);
        }
        match self.reads.wait(tag, deadline) {
            Some((value, at)) => {
                self.cache.take(key)?;
                Ok(Sample::answered(value, at))
            }
            None => Ok(Sample::timed_out()),
        }
    }

    fn push_upload(&self, key: Key, id: RegisterId, tag: u64) -> Result<()> {
        self.cache.mark_requested(key)?;
        self.queue
            .push(sdo::upload_request(self.node_id, id).with_tag(tag))
    }

    /// Reading thread: one frame on the reply band.
    pub(crate) fn on_sdo_reply(&self, frame: &Frame) {
        let reply = match sdo::parse_reply(frame) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[sdo] node {}: {}", self.node_id, e);
                return;
            }
        };
        let at = frame.timestamp.unwrap_or_else(Instant::now);

        let outcome = {
            let mut state = self.sdo.lock();
            match reply {
                Reply::UploadExpedited { id, data } => {
                    let tag = self.upload_tag(id);
                    match self.store_register(id, data, at) {
                        Some(value) => {
                            self.reads.complete(tag, Some((value.clone(), at)));
                            Outcome::Updated(id, value)
                        }
                        None => {
                            self.reads.complete(tag, None);
                            Outcome::Nothing
                        }
                    }
                }
                Reply::UploadInitiated { id, size } => self.upload_initiated(&mut state, id, size, at),
                Reply::UploadSegment { toggle, data, last } => {
                    self.upload_segment(&mut state, toggle, data, last, at)
                }
                Reply::DownloadAck { id } => self.download_acked(&mut state, id, at),
                Reply::DownloadSegmentAck { toggle } => self.segment_acked(&mut state, toggle, at),
                Reply::Abort { id, code } => self.transfer_aborted(&mut state, id, code),
            }
        };

        // Published outside the transfer lock: inline callbacks may write.
        match outcome {
            Outcome::Nothing => {}
            Outcome::Updated(id, value) => self.publish_update(id, value),
            Outcome::Aborted(register, code) => self.events.publish(Event::new(
                EVENT_PROTOCOL_ERROR,
                self.device_id,
                Payload::Abort { register, code },
            )),
        }
    }

    fn store_register(&self, id: RegisterId, bytes: &[u8], at: Instant) -> Option<Value> {
        let Some(key) = self.try_find(id) else {
            log::warn!("[sdo] node {} answered unknown register {}", self.node_id, id);
            return None;
        };
        match self.cache.store_bytes(key, bytes, at) {
            Ok((_, value)) => Some(value),
            Err(e) => {
                log::warn!("[sdo] node {} register {}: {}", self.node_id, id, e);
                None
            }
        }
    }

    fn upload_initiated(
        &self,
        state: &mut SdoState,
        id: RegisterId,
        size: Option<u32>,
        at: Instant,
    ) -> Outcome {
        let tag = self.upload_tag(id);
        state.upload = None;
        let limit = self
            .descriptor(id)
            .ok()
            .and_then(|desc| desc.size())
            .unwrap_or(MAX_UPLOAD_BYTES);
        let expected = size.map(|s| s as usize);
        if let Some(n) = expected.filter(|n| *n > limit) {
            log::warn!(
                "[sdo] node {} announced {} bytes for {} (limit {})",
                self.node_id,
                n,
                id,
                limit
            );
            self.reads.complete(tag, None);
            return self.abort_transfer(id, AbortCode::LENGTH_TOO_HIGH);
        }
        if expected == Some(0) {
            return self.finish_upload(id, tag, &[], at);
        }

        // Known size: every segment request is queued at once with
        // alternating toggles. Unknown size: one at a time.
        let requests: Vec<Frame> = match expected {
            Some(n) => (0..n.div_ceil(SEGMENT_BYTES))
                .map(|i| sdo::upload_segment_request(self.node_id, i % 2 == 1))
                .collect(),
            None => vec![sdo::upload_segment_request(self.node_id, false)],
        };
        log::debug!(
            "[sdo] node {} segmented read {} ({} requests queued)",
            self.node_id,
            id,
            requests.len()
        );
        state.upload = Some(Upload {
            id,
            tag,
            expected,
            limit,
            buffer: Vec::with_capacity(expected.unwrap_or(SEGMENT_BYTES)),
            toggle: false,
        });
        if let Err(e) = self.queue.push_front(requests) {
            log::warn!("[sdo] node {} segment request: {}", self.node_id, e);
            state.upload = None;
            self.reads.complete(tag, None);
        }
        Outcome::Nothing
    }

    fn finish_upload(&self, id: RegisterId, tag: u64, bytes: &[u8], at: Instant) -> Outcome {
        match self.store_register(id, bytes, at) {
            Some(value) => {
                self.reads.complete(tag, Some((value.clone(), at)));
                Outcome::Updated(id, value)
            }
            None => {
                self.reads.complete(tag, None);
                Outcome::Nothing
            }
        }
    }

    fn upload_segment(
        &self,
        state: &mut SdoState,
        toggle: bool,
        data: &[u8],
        last: bool,
        at: Instant,
    ) -> Outcome {
        let Some(upload) = state.upload.as_mut() else {
            log::warn!("[sdo] node {} sent a segment outside any transfer", self.node_id);
            return Outcome::Nothing;
        };
        let violation = if toggle != upload.toggle {
            Some(AbortCode::TOGGLE_NOT_ALTERNATED)
        } else if upload.buffer.len() + data.len() > upload.limit {
            Some(AbortCode::LENGTH_TOO_HIGH)
        } else {
            None
        };
        if let Some(code) = violation {
            let (id, tag) = (upload.id, upload.tag);
            state.upload = None;
            self.discard_segment_requests();
            self.reads.complete(tag, None);
            return self.abort_transfer(id, code);
        }

        upload.buffer.extend_from_slice(data);
        upload.toggle = !upload.toggle;
        let complete = last || upload.expected.is_some_and(|n| upload.buffer.len() >= n);
        if !complete {
            if upload.expected.is_none() {
                let next = sdo::upload_segment_request(self.node_id, upload.toggle);
                if let Err(e) = self.queue.push_front(vec![next]) {
                    log::warn!("[sdo] node {} segment request: {}", self.node_id, e);
                    let tag = upload.tag;
                    state.upload = None;
                    self.reads.complete(tag, None);
                }
            }
            return Outcome::Nothing;
        }

        let Some(mut upload) = state.upload.take() else {
            return Outcome::Nothing;
        };
        self.discard_segment_requests();
        if let Some(n) = upload.expected {
            // Cache untouched unless the announced size arrived in full.
            if upload.buffer.len() < n {
                log::warn!(
                    "[sdo] node {} ended {} after {} of {} bytes",
                    self.node_id,
                    upload.id,
                    upload.buffer.len(),
                    n
                );
                self.reads.complete(upload.tag, None);
                return self.abort_transfer(upload.id, AbortCode::LENGTH_MISMATCH);
            }
            upload.buffer.truncate(n);
        }
        self.finish_upload(upload.id, upload.tag, &upload.buffer, at)
    }

    fn download_acked(&self, state: &mut SdoState, id: RegisterId, at: Instant) -> Outcome {
        let Some(sent) = self.in_flight_request(id) else {
            log::debug!(
                "[sdo] node {} acknowledged {} without a matching request",
                self.node_id,
                id
            );
            return Outcome::Nothing;
        };

        if sdo::is_segmented_download_initiate(&sent) {
            let Some(bytes) = state.unstage(id, false) else {
                log::warn!("[sdo] node {} acknowledged {} with nothing staged", self.node_id, id);
                return Outcome::Nothing;
            };
            let end = bytes.len().min(SEGMENT_BYTES);
            let first = sdo::download_segment(self.node_id, false, &bytes[..end], end == bytes.len());
            match first.and_then(|f| self.queue.push_front(vec![f])) {
                Ok(()) => {
                    state.download = Some(Download {
                        id,
                        bytes,
                        offset: end,
                        toggle: false,
                    })
                }
                Err(e) => log::warn!("[sdo] node {} segment: {}", self.node_id, e),
            }
            return Outcome::Nothing;
        }

        // Expedited: the acknowledged bytes are the ones we sent.
        let b0 = sent.data[0];
        let n = if b0 & 0x01 != 0 {
            EXPEDITED_MAX_BYTES - usize::from((b0 >> 2) & 0x03)
        } else {
            EXPEDITED_MAX_BYTES
        };
        self.store_register(id, &sent.data[4..4 + n], at);
        Outcome::Nothing
    }

    fn segment_acked(&self, state: &mut SdoState, toggle: bool, at: Instant) -> Outcome {
        let Some(download) = state.download.as_mut() else {
            log::warn!("[sdo] node {} acknowledged a segment outside any transfer", self.node_id);
            return Outcome::Nothing;
        };
        if toggle != download.toggle {
            let id = download.id;
            state.download = None;
            return self.abort_transfer(id, AbortCode::TOGGLE_NOT_ALTERNATED);
        }

        if download.offset >= download.bytes.len() {
            if let Some(done) = state.download.take() {
                log::debug!("[sdo] node {} segmented write {} done", self.node_id, done.id);
                self.store_register(done.id, &done.bytes, at);
            }
            return Outcome::Nothing;
        }

        download.toggle = !download.toggle;
        let end = (download.offset + SEGMENT_BYTES).min(download.bytes.len());
        let next = sdo::download_segment(
            self.node_id,
            download.toggle,
            &download.bytes[download.offset..end],
            end == download.bytes.len(),
        );
        download.offset = end;
        if let Err(e) = next.and_then(|f| self.queue.push_front(vec![f])) {
            log::warn!("[sdo] node {} segment: {}", self.node_id, e);
            state.download = None;
        }
        Outcome::Nothing
    }

    fn transfer_aborted(&self, state: &mut SdoState, id: RegisterId, code: AbortCode) -> Outcome {
        log::error!("[sdo] node {} aborted {}: {}", self.node_id, id, code);
        let tag = match state.upload.take() {
            Some(upload) => {
                self.discard_segment_requests();
                upload.tag
            }
            None => self.upload_tag(id),
        };
        self.reads.complete(tag, None);
        state.download = None;
        if self
            .in_flight_request(id)
            .is_some_and(|f| sdo::is_segmented_download_initiate(&f))
        {
            state.unstage(id, false);
        }
        Outcome::Aborted(id, code)
    }

    /// Local protocol violation: tell the peer and report it like a peer
    /// abort.
    fn abort_transfer(&self, id: RegisterId, code: AbortCode) -> Outcome {
        log::error!("[sdo] node {} transfer of {} aborted: {}", self.node_id, id, code);
        if let Err(e) = self
            .queue
            .push_front(vec![sdo::abort_request(self.node_id, id, code)])
        {
            log::warn!("[sdo] node {} abort request: {}", self.node_id, e);
        }
        Outcome::Aborted(id, code)
    }

    fn discard_segment_requests(&self) {
        let node = self.node_id;
        let dropped = self
            .queue
            .discard(|f| sdo::is_upload_segment_request(f, node));
        if dropped > 0 {
            log::debug!("[sdo] node {} dropped {} segment requests", node, dropped);
        }
    }

    /// Tag of the in-flight read request for `id`, 0 when there is none.
    fn upload_tag(&self, id: RegisterId) -> u64 {
        self.in_flight_request(id)
            .filter(sdo::is_upload_request)
            .map_or(0, |f| f.tag)
    }

    /// The request currently awaiting its answer, when it addresses `id`.
    fn in_flight_request(&self, id: RegisterId) -> Option<Frame> {
        self.queue
            .last_sent()
            .filter(|f| f.id == sdo::request_id(self.node_id) && sdo::addressed_register(f) == id)
    }

    /// Reactor thread: a request got no answer and was dropped.
    pub(crate) fn on_request_timeout(&self, frame: &Frame) {
        if frame.id != sdo::request_id(self.node_id) {
            return;
        }
        let mut state = self.sdo.lock();
        match frame.data[0] >> 5 {
            // Upload initiate or segment request.
            2 | 3 => {
                let tag = match state.upload.take() {
                    Some(upload) => {
                        log::warn!("[sdo] node {} segmented read abandoned", self.node_id);
                        upload.tag
                    }
                    None => frame.tag,
                };
                self.discard_segment_requests();
                self.reads.complete(tag, None);
            }
            1 if sdo::is_segmented_download_initiate(frame) => {
                state.unstage(sdo::addressed_register(frame), false);
            }
            0 => {
                if let Some(download) = state.download.take() {
                    log::warn!(
                        "[sdo] node {} segmented write {} abandoned",
                        self.node_id,
                        download.id
                    );
                }
            }
            _ => {}
        }
    }
}
