// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node management, async status frames and device initialisation.

use super::ProtocolEngine;
use crate::cache::ReadStatus;
use crate::config::COB_EMCY;
use crate::dictionary::RegisterId;
use crate::error::{Error, Result};
use crate::events::{Event, Payload, EVENT_EMERGENCY, EVENT_NMT_STATE};
use crate::protocol::{nmt, sync_frame, Emergency, NmtCommand, NmtState, Pdo};
use crate::transport::Frame;

const DEVICE_TYPE: RegisterId = RegisterId::new(0x1000, 0);
const EMCY_COB: RegisterId = RegisterId::new(0x1014, 0);
const HEARTBEAT_PERIOD: RegisterId = RegisterId::new(0x1017, 0);

impl ProtocolEngine {
    /// Queue a node-state command addressed to this node.
    pub fn send_nmt(&self, command: NmtCommand) -> Result<()> {
        log::debug!("[nmt] node {} <- {:?}", self.node_id, command);
        self.queue.push(command.frame(self.node_id))
    }

    /// Queue a guard request; the answer updates [`Self::nmt_state`].
    pub fn send_node_guard(&self) -> Result<()> {
        self.queue.push(nmt::guard_request(self.node_id))
    }

    /// Last state reported by the node (guard answer or heartbeat).
    pub fn nmt_state(&self) -> NmtState {
        *self.nmt.lock()
    }

    /// Queue a broadcast trigger through this device's queue.
    pub fn send_sync(&self) -> Result<()> {
        self.queue.push(sync_frame())
    }

    /// Ask the node to emit a heartbeat every `period_ms` (0 disables).
    pub fn set_heartbeat_period(&self, period_ms: u16) -> Result<()> {
        self.write(HEARTBEAT_PERIOD, period_ms)
    }

    /// Check the node answers, point its emergency identifier at the
    /// predefined one and read back every broadcast channel.
    ///
    /// Fails with [`Error::NoResponse`] when the device type cannot be read
    /// within the init timeout. Channels absent from the dictionary are
    /// skipped.
    pub fn init(&self) -> Result<()> {
        let sample = self.read_and_get(DEVICE_TYPE, self.init_timeout)?;
        if sample.status != ReadStatus::New || sample.get::<u32>() == Some(0) {
            log::error!("[nmt] node {} does not answer", self.node_id);
            return Err(Error::NoResponse(DEVICE_TYPE));
        }
        log::info!(
            "[nmt] node {} device type 0x{:08X}",
            self.node_id,
            sample.get::<u32>().unwrap_or_default()
        );

        let emcy = u32::from(COB_EMCY) + u32::from(self.node_id);
        match self.write(EMCY_COB, emcy) {
            Ok(()) => {}
            Err(e) if e.is_not_found() || matches!(e, Error::AccessDenied { .. }) => {
                log::debug!("[nmt] node {} emergency id left as is: {}", self.node_id, e);
            }
            Err(e) => return Err(e),
        }

        for pdo in Pdo::all() {
            if self.try_find(pdo.cob_register()).is_none() {
                continue;
            }
            self.init_pdo(pdo)?;
        }
        log::info!("[nmt] node {} initialised", self.node_id);
        Ok(())
    }

    /// Reading thread: guard answer or heartbeat.
    pub(crate) fn on_node_state(&self, frame: &Frame) {
        if frame.len == 0 {
            return;
        }
        let current = NmtState::from_byte(frame.data[0]);
        let previous = std::mem::replace(&mut *self.nmt.lock(), current);
        if previous == current {
            return;
        }
        log::info!("[nmt] node {} {} -> {}", self.node_id, previous, current);
        self.events.publish(Event::new(
            EVENT_NMT_STATE,
            self.device_id,
            Payload::NmtState { previous, current },
        ));
    }

    /// Reading thread: async status frame.
    pub(crate) fn on_emergency(&self, frame: &Frame) {
        let emcy = Emergency::parse(frame);
        if emcy.is_reset() {
            log::info!("[nmt] node {} error reset", self.node_id);
            return;
        }
        log::error!(
            "[nmt] node {} emergency 0x{:04X} (error register 0x{:02X})",
            self.node_id,
            emcy.code,
            emcy.error_register
        );
        self.events.publish(Event::new(
            EVENT_EMERGENCY,
            self.device_id,
            Payload::Emergency(emcy),
        ));
    }
}
