// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register dictionary of one device model.
//!
//! A [`Dictionary`] is an immutable catalogue of [`RegisterDescriptor`]s
//! sorted by packed [`RegisterId`]. It is built once (from a schema file via
//! [`parser`], or programmatically) and shared behind an `Arc` by every
//! device of that model.
//!
//! Lookups resolve `(index, subindex)` to a [`Key`]: the position of the
//! descriptor inside this dictionary instance. A key is only meaningful for
//! the dictionary that produced it; rebuilding a device with a new dictionary
//! invalidates previously resolved keys.

pub mod parser;
pub mod registry;

pub use parser::{Diagnostic, ParseOutcome};
pub use registry::DictionaryRegistry;

use crate::error::{Error, Result};
use crate::value::{Kind, Value};
use std::fmt;
use std::path::Path;

/// Model name of the built-in minimal dictionary.
pub const MINIMAL_MODEL: &str = "CiA301-minimal";

/// `(index, subindex)` packed into one ordered 24-bit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterId(u32);

impl RegisterId {
    #[inline]
    #[must_use]
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self(((index as u32) << 8) | subindex as u32)
    }

    #[inline]
    #[must_use]
    pub const fn from_packed(packed: u32) -> Self {
        Self(packed & 0x00FF_FFFF)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u16 {
        (self.0 >> 8) as u16
    }

    #[inline]
    #[must_use]
    pub const fn subindex(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Packed `index << 8 | subindex`; also used as the per-register event id.
    #[inline]
    #[must_use]
    pub const fn packed(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}/0x{:02X}", self.index(), self.subindex())
    }
}

impl From<(u16, u8)> for RegisterId {
    fn from((index, subindex): (u16, u8)) -> Self {
        Self::new(index, subindex)
    }
}

/// Access rights declared by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Constant,
}

impl AccessType {
    /// Case-insensitive substring match used by schema files (`rw`, `rww`,
    /// `ro`, `const`...). Unrecognised text falls back to `Constant`.
    pub fn from_schema(text: &str) -> Self {
        let upper = text.to_ascii_uppercase();
        if upper.contains("CONST") {
            AccessType::Constant
        } else if upper.contains("RW") {
            AccessType::ReadWrite
        } else if upper.contains("WO") {
            AccessType::WriteOnly
        } else if upper.contains("RO") {
            AccessType::ReadOnly
        } else {
            AccessType::Constant
        }
    }

    #[inline]
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, AccessType::WriteOnly | AccessType::ReadWrite)
    }

    #[inline]
    #[must_use]
    pub fn is_readable(self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessType::ReadOnly => "RO",
            AccessType::WriteOnly => "WO",
            AccessType::ReadWrite => "RW",
            AccessType::Constant => "CONST",
        })
    }
}

/// Immutable description of one register.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    pub id: RegisterId,
    pub kind: Kind,
    pub access: AccessType,
    /// May be placed in a broadcast channel mapping.
    pub pdo_mappable: bool,
    pub name: String,
    pub default: Option<Value>,
}

impl RegisterDescriptor {
    pub fn new(
        id: impl Into<RegisterId>,
        kind: Kind,
        access: AccessType,
        pdo_mappable: bool,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            access,
            pdo_mappable,
            name: name.into(),
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Wire size, `None` for strings.
    #[inline]
    pub fn size(&self) -> Option<usize> {
        self.kind.size()
    }
}

/// Position of a descriptor inside one dictionary instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(usize);

impl Key {
    #[inline]
    pub const fn position(self) -> usize {
        self.0
    }
}

/// Identity block of a schema file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
}

/// Sorted, immutable register catalogue.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    info: DeviceInfo,
    entries: Vec<RegisterDescriptor>,
}

impl Dictionary {
    /// Build from arbitrary descriptors; sorts by id and keeps the first of
    /// any duplicate id.
    pub fn from_descriptors(info: DeviceInfo, mut entries: Vec<RegisterDescriptor>) -> Self {
        entries.sort_by_key(|e| e.id);
        entries.dedup_by_key(|e| e.id);
        Self { info, entries }
    }

    /// Parse schema text, logging diagnostics for skipped fields/blocks.
    pub fn parse_str(text: &str) -> Self {
        let outcome = parser::parse(text);
        for diag in &outcome.diagnostics {
            log::warn!("[schema] line {}: {}", diag.line, diag.message);
        }
        outcome.dictionary
    }

    /// Read and parse a schema file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let dict = Self::parse_str(&text);
        log::debug!(
            "[schema] {} -> {} registers (vendor 0x{:X} product 0x{:X})",
            path.display(),
            dict.len(),
            dict.info.vendor,
            dict.info.product
        );
        Ok(dict)
    }

    /// Minimal communication-profile dictionary shared by every device.
    pub fn minimal() -> Self {
        let ro = AccessType::ReadOnly;
        Self::from_descriptors(
            DeviceInfo::default(),
            vec![
                RegisterDescriptor::new((0x1000, 0), Kind::UInt32, ro, false, "Device_Type"),
                RegisterDescriptor::new((0x1001, 0), Kind::UInt8, ro, false, "Error_Register"),
                RegisterDescriptor::new(
                    (0x1018, 0),
                    Kind::UInt8,
                    AccessType::Constant,
                    false,
                    "Identity_Object::Number_of_Entries",
                ),
                RegisterDescriptor::new((0x1018, 1), Kind::UInt32, ro, false, "Identity_Object::Vendor_ID"),
                RegisterDescriptor::new((0x1018, 2), Kind::UInt32, ro, false, "Identity_Object::Product_Code"),
                RegisterDescriptor::new((0x1018, 3), Kind::UInt32, ro, false, "Identity_Object::Revision_Number"),
                RegisterDescriptor::new((0x1018, 4), Kind::UInt32, ro, false, "Identity_Object::Serial_Number"),
            ],
        )
    }

    #[inline]
    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// O(log n) lookup.
    pub fn find(&self, index: u16, subindex: u8) -> Result<Key> {
        let id = RegisterId::new(index, subindex);
        self.try_find(id).ok_or_else(|| Error::not_found(id))
    }

    pub fn try_find(&self, id: RegisterId) -> Option<Key> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(Key)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Key> {
        self.entries.iter().position(|e| e.name == name).map(Key)
    }

    pub fn entry(&self, key: Key) -> Result<&RegisterDescriptor> {
        self.entries.get(key.0).ok_or(Error::InvalidKey(key.0))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &RegisterDescriptor)> {
        self.entries.iter().enumerate().map(|(i, e)| (Key(i), e))
    }
}

/// Anything that names a register in a dictionary: a resolved [`Key`], a
/// [`RegisterId`] or an `(index, subindex)` tuple.
pub trait RegisterRef {
    fn resolve(&self, dictionary: &Dictionary) -> Result<Key>;
}

impl RegisterRef for Key {
    fn resolve(&self, dictionary: &Dictionary) -> Result<Key> {
        dictionary.entry(*self).map(|_| *self)
    }
}

impl RegisterRef for RegisterId {
    fn resolve(&self, dictionary: &Dictionary) -> Result<Key> {
        dictionary.find(self.index(), self.subindex())
    }
}

impl RegisterRef for (u16, u8) {
    fn resolve(&self, dictionary: &Dictionary) -> Result<Key> {
        dictionary.find(self.0, self.1)
    }
}

impl<T: RegisterRef + ?Sized> RegisterRef for &T {
    fn resolve(&self, dictionary: &Dictionary) -> Result<Key> {
        (**self).resolve(dictionary)
    }
}
