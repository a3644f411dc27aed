// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast channel configuration and demultiplexing.

use super::ProtocolEngine;
use crate::cache::ReadStatus;
use crate::config::{COB_DISABLED_BIT, PDO_COUNT, PDO_MAX_BYTES};
use crate::dictionary::{Key, RegisterId, RegisterRef};
use crate::error::{Error, Result};
use crate::protocol::pdo::{mapping_entry, parse_mapping_entry};
use crate::protocol::{Pdo, PdoDirection, Transmission};
use crate::transport::Frame;
use crate::value::Value;
use std::time::{Duration, Instant};

/// Local record of one configured channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSlot {
    pub pdo: Pdo,
    pub cob: u16,
    /// Mapped registers in payload order.
    pub keys: Vec<Key>,
}

pub(crate) struct PdoState {
    slots: Vec<Option<MappingSlot>>,
}

impl Default for PdoState {
    fn default() -> Self {
        Self {
            slots: vec![None; 2 * usize::from(PDO_COUNT)],
        }
    }
}

impl ProtocolEngine {
    /// Map `registers` into a channel and (re)enable it.
    ///
    /// Registers that are not mappable, or have no fixed size, are skipped
    /// with a warning. Fails with [`Error::MappingTooLarge`] before anything
    /// is sent when the mapped sizes exceed 8 bytes. `cob` overrides the
    /// predefined identifier and must carry the node id in its low 7 bits.
    pub fn map_pdo<R: RegisterRef>(
        &self,
        pdo: Pdo,
        registers: &[R],
        cob: Option<u16>,
    ) -> Result<MappingSlot> {
        let dict = self.dictionary();
        let mut keys = Vec::with_capacity(registers.len());
        let mut entries = Vec::with_capacity(registers.len());
        let mut total = 0usize;
        for reg in registers {
            let key = reg.resolve(&dict)?;
            let desc = dict.entry(key)?;
            let size = match desc.size() {
                Some(size) if desc.pdo_mappable => size,
                _ => {
                    log::warn!("[pdo] {} is not mappable, skipped from {}", desc.id, pdo);
                    continue;
                }
            };
            total += size;
            keys.push(key);
            entries.push(mapping_entry(desc.id, (size * 8) as u8));
        }
        if total > PDO_MAX_BYTES {
            return Err(Error::MappingTooLarge { bytes: total });
        }
        let cob = self.channel_cob(pdo, cob)?;

        let comm = pdo.comm_index();
        let map = pdo.map_index();
        let disabled = u32::from(cob) | COB_DISABLED_BIT;
        self.write((comm, 1), disabled)?;
        self.write((map, 0), 0u8)?;
        for (i, entry) in entries.iter().enumerate() {
            self.write((map, (i + 1) as u8), *entry)?;
        }
        self.write((map, 0), entries.len() as u8)?;
        self.write((comm, 1), u32::from(cob))?;

        let slot = MappingSlot { pdo, cob, keys };
        log::info!(
            "[pdo] node {} {} on 0x{:03X}: {} registers, {} bytes",
            self.node_id,
            pdo,
            cob,
            slot.keys.len(),
            total
        );
        self.pdo.lock().slots[pdo.slot()] = Some(slot.clone());
        Ok(slot)
    }

    fn channel_cob(&self, pdo: Pdo, requested: Option<u16>) -> Result<u16> {
        match requested {
            Some(cob) if cob > 0x7FF => Err(Error::InvalidPdo(format!(
                "identifier 0x{:X} of {} is not an 11-bit id",
                cob, pdo
            ))),
            Some(cob) if (cob & 0x7F) != u16::from(self.node_id) => Err(Error::InvalidPdo(format!(
                "identifier 0x{:03X} of {} does not carry node {}",
                cob, pdo, self.node_id
            ))),
            Some(cob) => Ok(cob),
            None => pdo.default_cob(self.node_id).ok_or_else(|| {
                Error::InvalidPdo(format!("{} has no predefined identifier", pdo))
            }),
        }
    }

    /// Identifier currently used by a channel: the local mapping, the
    /// predefined one, then whatever the cache holds.
    fn current_cob(&self, pdo: Pdo) -> Result<u16> {
        if let Some(slot) = &self.pdo.lock().slots[pdo.slot()] {
            return Ok(slot.cob);
        }
        if let Some(cob) = pdo.default_cob(self.node_id) {
            return Ok(cob);
        }
        let (key, _) = self.resolve(pdo.cob_register())?;
        let entry = self.cache.peek(key)?;
        let raw: u32 = entry.value.convert()?;
        Ok((raw & 0x7FF) as u16)
    }

    /// Set or clear the channel's disable bit.
    pub fn pdo_enable(&self, pdo: Pdo, enable: bool) -> Result<()> {
        let cob = u32::from(self.current_cob(pdo)?);
        let value = if enable { cob } else { cob | COB_DISABLED_BIT };
        self.write(pdo.cob_register(), value)
    }

    /// Configure transmission; the channel is disabled around the update.
    pub fn pdo_transmission(&self, pdo: Pdo, transmission: Transmission) -> Result<()> {
        let comm = pdo.comm_index();
        self.pdo_enable(pdo, false)?;
        match transmission {
            Transmission::Synchronous { every } => {
                self.write((comm, 2), every)?;
            }
            Transmission::Asynchronous {
                event_type,
                inhibit,
                event_timer,
            } => {
                self.write((comm, 2), event_type)?;
                self.write_optional((comm, 3), Transmission::inhibit_units(inhibit))?;
                self.write_optional((comm, 5), Transmission::timer_millis(event_timer))?;
            }
        }
        self.pdo_enable(pdo, true)
    }

    /// Transmit once every `every` broadcast triggers.
    pub fn pdo_transmission_sync(&self, pdo: Pdo, every: u8) -> Result<()> {
        self.pdo_transmission(pdo, Transmission::Synchronous { every })
    }

    /// Event-driven transmission with inhibit time and event timer.
    pub fn pdo_transmission_async(
        &self,
        pdo: Pdo,
        event_type: u8,
        inhibit: Duration,
        event_timer: Duration,
    ) -> Result<()> {
        self.pdo_transmission(
            pdo,
            Transmission::Asynchronous {
                event_type,
                inhibit,
                event_timer,
            },
        )
    }

    fn write_optional(&self, id: (u16, u8), value: impl Into<Value>) -> Result<()> {
        match self.write(id, value) {
            Err(e) if e.is_not_found() => {
                log::debug!("[pdo] node {} has no register {}", self.node_id, RegisterId::from(id));
                Ok(())
            }
            other => other,
        }
    }

    /// Send raw data on a receive channel of the peer.
    pub fn push_rx_pdo(&self, pdo: Pdo, data: &[u8]) -> Result<()> {
        if pdo.direction() != PdoDirection::Rx {
            return Err(Error::InvalidPdo(format!("{} is not a receive channel", pdo)));
        }
        let cob = self.current_cob(pdo)?;
        self.queue.push(Frame::new(cob, data)?)
    }

    /// Local mapping of a channel, if any.
    pub fn mapping(&self, pdo: Pdo) -> Option<MappingSlot> {
        self.pdo.lock().slots[pdo.slot()].clone()
    }

    /// Reading thread: split a transmit-channel frame into its registers.
    pub(crate) fn demux_pdo(&self, frame: &Frame) -> bool {
        if frame.rtr {
            return false;
        }
        let keys = {
            let state = self.pdo.lock();
            let slot = state.slots[usize::from(PDO_COUNT)..]
                .iter()
                .flatten()
                .find(|slot| slot.cob == frame.id);
            match slot {
                Some(slot) => slot.keys.clone(),
                None => return false,
            }
        };

        let at = frame.timestamp.unwrap_or_else(Instant::now);
        let payload = frame.payload();
        let dict = self.dictionary();
        let mut offset = 0usize;
        for key in keys {
            let Ok(desc) = dict.entry(key) else {
                break;
            };
            let size = desc.size().unwrap_or(0);
            if offset + size > payload.len() {
                log::warn!(
                    "[pdo] node {} frame 0x{:03X} too short for {} ({} of {} bytes)",
                    self.node_id,
                    frame.id,
                    desc.id,
                    payload.len(),
                    offset + size
                );
                break;
            }
            match self.cache.store_bytes(key, &payload[offset..offset + size], at) {
                Ok((used, value)) => {
                    offset += used;
                    self.publish_update(desc.id, value);
                }
                Err(e) => {
                    log::warn!("[pdo] node {} {}: {}", self.node_id, desc.id, e);
                    break;
                }
            }
        }
        true
    }

    /// Bring a channel's local record in line with the peer.
    ///
    /// Reads the channel identifier (blocking, `init_timeout`), rewrites it
    /// when its low 7 bits do not match the node id, then reads the mapping
    /// back. Channels without a mapping record keep the identifier only.
    pub fn init_pdo(&self, pdo: Pdo) -> Result<()> {
        let cob_reg = pdo.cob_register();
        let sample = self.read_and_get(cob_reg, self.init_timeout)?;
        if sample.status != ReadStatus::New {
            return Err(Error::NoResponse(cob_reg));
        }
        let raw: u32 = sample.get().ok_or(Error::NoResponse(cob_reg))?;
        let forced = (raw & 0xFFFF_FF80) | u32::from(self.node_id);
        if forced != raw {
            log::info!(
                "[pdo] node {} {} identifier 0x{:08X} -> 0x{:08X}",
                self.node_id,
                pdo,
                raw,
                forced
            );
            self.write(cob_reg, forced)?;
        }
        let cob = (forced & 0x7FF) as u16;

        let keys = match self.read_mapping(pdo) {
            Ok(keys) => keys,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        log::debug!(
            "[pdo] node {} {} on 0x{:03X} with {} mapped registers",
            self.node_id,
            pdo,
            cob,
            keys.len()
        );
        self.pdo.lock().slots[pdo.slot()] = Some(MappingSlot { pdo, cob, keys });
        Ok(())
    }

    fn read_mapping(&self, pdo: Pdo) -> Result<Vec<Key>> {
        let map = pdo.map_index();
        let count_reg = RegisterId::new(map, 0);
        let count: u8 = self
            .read_and_get(count_reg, self.init_timeout)?
            .get()
            .ok_or(Error::NoResponse(count_reg))?;
        let mut keys = Vec::with_capacity(usize::from(count));
        for sub in 1..=count {
            let entry_reg = RegisterId::new(map, sub);
            let entry: u32 = self
                .read_and_get(entry_reg, self.init_timeout)?
                .get()
                .ok_or(Error::NoResponse(entry_reg))?;
            let (id, bits) = parse_mapping_entry(entry);
            match self.try_find(id) {
                Some(key) => keys.push(key),
                None => {
                    log::warn!(
                        "[pdo] node {} {} maps unknown {} ({} bits); mapping truncated",
                        self.node_id,
                        pdo,
                        id,
                        bits
                    );
                    break;
                }
            }
        }
        Ok(keys)
    }
}
