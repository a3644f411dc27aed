// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device value cache.
//!
//! One [`CacheEntry`] per dictionary key, index-aligned with the
//! [`Dictionary`] the cache was built from. Writers (the CAN reading thread
//! delivering replies and broadcast data) and readers (application threads)
//! share a single mutex so that "read freshness, then demote" is atomic.
//!
//! ```text
//!             store()                take()
//!  NoData ─────────────▶ New ─────────────────▶ Old
//!                         ▲                      │
//!                         └──────── store() ─────┘
//! ```

use crate::dictionary::{Dictionary, Key};
use crate::error::{Error, Result};
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

/// Freshness of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never received.
    NoData,
    /// Received and not read since.
    New,
    /// Already read (or a refresh was requested).
    Old,
}

/// Outcome of a cache read, including the blocking-read timeout case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    NoData,
    New,
    Old,
    /// No answer within the caller's deadline.
    TimedOut,
}

impl From<Freshness> for ReadStatus {
    fn from(f: Freshness) -> Self {
        match f {
            Freshness::NoData => ReadStatus::NoData,
            Freshness::New => ReadStatus::New,
            Freshness::Old => ReadStatus::Old,
        }
    }
}

/// Mutable state of one register.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub freshness: Freshness,
    pub timestamp: Option<Instant>,
}

/// Result of reading a register from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub status: ReadStatus,
    /// `None` when nothing was ever received or the read timed out.
    pub value: Option<Value>,
    pub timestamp: Option<Instant>,
}

impl Sample {
    pub(crate) fn timed_out() -> Self {
        Self {
            status: ReadStatus::TimedOut,
            value: None,
            timestamp: None,
        }
    }

    /// Answer of a blocking read.
    pub(crate) fn answered(value: Value, timestamp: Instant) -> Self {
        Self {
            status: ReadStatus::New,
            value: Some(value),
            timestamp: Some(timestamp),
        }
    }

    /// True only for data received since the previous read.
    #[inline]
    pub fn is_new(&self) -> bool {
        self.status == ReadStatus::New
    }

    /// Checked conversion of the sampled value.
    pub fn get<T: crate::value::Scalar>(&self) -> Option<T> {
        self.value.as_ref().and_then(|v| v.convert::<T>().ok())
    }
}

struct CacheInner {
    dictionary: Arc<Dictionary>,
    entries: Vec<CacheEntry>,
}

impl CacheInner {
    fn build(dictionary: Arc<Dictionary>) -> Result<Self> {
        if dictionary.is_empty() {
            return Err(Error::EmptyDictionary);
        }
        let entries = dictionary
            .iter()
            .map(|(_, desc)| CacheEntry {
                value: desc
                    .default
                    .clone()
                    .unwrap_or_else(|| Value::zero(desc.kind)),
                freshness: Freshness::NoData,
                timestamp: None,
            })
            .collect();
        Ok(Self {
            dictionary,
            entries,
        })
    }

    fn entry_mut(&mut self, key: Key) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(key.position())
            .ok_or(Error::InvalidKey(key.position()))
    }
}

/// Index-aligned mutable register values of one device.
pub struct ValueCache {
    inner: Mutex<CacheInner>,
    updated: Condvar,
}

impl ValueCache {
    /// Build over a non-empty dictionary.
    pub fn new(dictionary: Arc<Dictionary>) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(CacheInner::build(dictionary)?),
            updated: Condvar::new(),
        })
    }

    /// Replace the dictionary and reset every entry to `NoData`.
    pub fn rebuild(&self, dictionary: Arc<Dictionary>) -> Result<()> {
        let fresh = CacheInner::build(dictionary)?;
        let mut inner = self.inner.lock();
        log::debug!(
            "[cache] rebuild {} -> {} entries",
            inner.entries.len(),
            fresh.entries.len()
        );
        *inner = fresh;
        self.updated.notify_all();
        Ok(())
    }

    pub fn dictionary(&self) -> Arc<Dictionary> {
        Arc::clone(&self.inner.lock().dictionary)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Snapshot without changing freshness.
    pub fn peek(&self, key: Key) -> Result<CacheEntry> {
        let mut inner = self.inner.lock();
        inner.entry_mut(key).map(|e| e.clone())
    }

    pub fn freshness(&self, key: Key) -> Result<Freshness> {
        let mut inner = self.inner.lock();
        inner.entry_mut(key).map(|e| e.freshness)
    }

    /// Read and demote: a `New` entry becomes `Old` under the same lock.
    pub fn take(&self, key: Key) -> Result<Sample> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(key)?;
        let sample = Sample {
            status: entry.freshness.into(),
            value: (entry.freshness != Freshness::NoData).then(|| entry.value.clone()),
            timestamp: entry.timestamp,
        };
        if entry.freshness == Freshness::New {
            entry.freshness = Freshness::Old;
        }
        Ok(sample)
    }

    /// A refresh was requested: anything already received becomes `Old` so
    /// the next `New` is known to be the answer.
    pub fn mark_requested(&self, key: Key) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(key)?;
        if entry.freshness != Freshness::NoData {
            entry.freshness = Freshness::Old;
        }
        Ok(())
    }

    /// Store a value (converted to the register's declared kind).
    pub fn store(&self, key: Key, value: &Value, timestamp: Instant) -> Result<Value> {
        let mut inner = self.inner.lock();
        let kind = inner.dictionary.entry(key)?.kind;
        let converted = value.convert_to(kind)?;
        let entry = inner.entry_mut(key)?;
        entry.value = converted.clone();
        entry.freshness = Freshness::New;
        entry.timestamp = Some(timestamp);
        self.updated.notify_all();
        Ok(converted)
    }

    /// Decode little-endian bytes per the register's kind and store them.
    ///
    /// Returns the number of bytes consumed and the stored value.
    pub fn store_bytes(&self, key: Key, bytes: &[u8], timestamp: Instant) -> Result<(usize, Value)> {
        let mut inner = self.inner.lock();
        let kind = inner.dictionary.entry(key)?.kind;
        let (value, used) = Value::from_le_bytes(kind, bytes)?;
        let entry = inner.entry_mut(key)?;
        entry.value = value.clone();
        entry.freshness = Freshness::New;
        entry.timestamp = Some(timestamp);
        self.updated.notify_all();
        Ok((used, value))
    }

    /// Block until the entry is `New` or `deadline` passes.
    pub fn wait_new(&self, key: Key, deadline: Instant) -> Result<bool> {
        let mut inner = self.inner.lock();
        loop {
            if inner.entry_mut(key)?.freshness == Freshness::New {
                return Ok(true);
            }
            if self.updated.wait_until(&mut inner, deadline).timed_out() {
                return Ok(inner.entry_mut(key)?.freshness == Freshness::New);
            }
        }
    }
}
