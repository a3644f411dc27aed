// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Schema (EDS-style) parser.
//!
//! The source is a sequence of `[header]` blocks of `key=value` lines:
//!
//! ```text
//! [DeviceInfo]
//! VendorNumber=0x0000029C
//!
//! [6040]
//! ParameterName=Control word
//! DataType=0x0006
//! AccessType=rw
//! PDOMapping=1
//! DefaultValue=0
//!
//! [1018]
//! ParameterName=Identity Object
//! ObjectType=0x9
//! SubNumber=5
//!
//! [1018sub1]
//! ParameterName=Vendor ID
//! DataType=0x0007
//! AccessType=ro
//! ```
//!
//! - Headers other than `[DeviceInfo]`, `[XXXX]` and `[XXXXsubN]` are ignored.
//! - A `[XXXX]` block with a non-zero `SubNumber` (or a record/array object
//!   type) is an array header: it only lends its name to its sub-entries
//!   (`Identity_Object::Vendor_ID`).
//! - A malformed field is reported as a [`Diagnostic`] and skipped; a block
//!   with a missing or unsupported `DataType` is skipped entirely.

use super::{AccessType, DeviceInfo, Dictionary, RegisterDescriptor, RegisterId};
use crate::value::{Kind, Value};
use std::collections::HashMap;

/// Non-fatal problem found while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based source line.
    pub line: usize,
    pub message: String,
}

/// Parsed dictionary plus everything that was skipped on the way.
#[derive(Debug)]
pub struct ParseOutcome {
    pub dictionary: Dictionary,
    pub diagnostics: Vec<Diagnostic>,
}

/// Map a schema `DataType` code to a value kind.
pub fn kind_from_code(code: u16) -> Option<Kind> {
    match code {
        0x02 => Some(Kind::Int8),
        0x03 => Some(Kind::Int16),
        0x04 => Some(Kind::Int32),
        0x05 => Some(Kind::UInt8),
        0x06 => Some(Kind::UInt16),
        0x07 => Some(Kind::UInt32),
        0x08 => Some(Kind::Float32),
        0x09 | 0x0A | 0x0F => Some(Kind::String),
        0x11 => Some(Kind::Float64),
        0x15 => Some(Kind::Int64),
        0x1B => Some(Kind::UInt64),
        _ => None,
    }
}

/// Replace separator characters by `_`, collapse runs and trim the tail.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = if ".:;/\\ -\"'".contains(c) { '_' } else { c };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        if c == '\r' || c == '\0' {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

struct Block<'a> {
    header: &'a str,
    line: usize,
    fields: Vec<(usize, &'a str, &'a str)>,
}

impl<'a> Block<'a> {
    fn field(&self, key: &str) -> Option<(usize, &'a str)> {
        self.fields
            .iter()
            .find(|(_, k, _)| k.eq_ignore_ascii_case(key))
            .map(|(line, _, v)| (*line, *v))
    }
}

enum Header {
    DeviceInfo,
    Object { index: u16, subindex: Option<u8> },
    Other,
}

fn classify(header: &str) -> Header {
    if header.eq_ignore_ascii_case("DeviceInfo") {
        return Header::DeviceInfo;
    }
    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());

    if header.len() == 4 && is_hex(header) {
        return match u16::from_str_radix(header, 16) {
            Ok(index) if index != 0 => Header::Object {
                index,
                subindex: None,
            },
            _ => Header::Other,
        };
    }

    let lower = header.to_ascii_lowercase();
    if lower.is_ascii() && lower.len() > 7 && &lower[4..7] == "sub" && is_hex(&lower[..4]) && is_hex(&lower[7..]) {
        if let (Ok(index), Ok(sub)) = (
            u16::from_str_radix(&lower[..4], 16),
            u8::from_str_radix(&lower[7..], 16),
        ) {
            if index != 0 {
                return Header::Object {
                    index,
                    subindex: Some(sub),
                };
            }
        }
    }
    Header::Other
}

fn split_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks: Vec<Block<'_>> = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            if let Some(end) = line.find(']') {
                blocks.push(Block {
                    header: line[1..end].trim(),
                    line: n + 1,
                    fields: Vec::new(),
                });
                continue;
            }
        }
        // Lines before the first header are preamble.
        let Some(block) = blocks.last_mut() else {
            continue;
        };
        if let Some((key, value)) = line.split_once('=') {
            block.fields.push((n + 1, key.trim(), value.trim()));
        }
    }
    blocks
}

fn parse_u32(text: &str) -> Option<u32> {
    Value::parse(Kind::UInt32, text)
        .ok()
        .and_then(|v| v.get::<u32>().ok())
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parse schema text. Never fails: problems are collected as diagnostics.
pub fn parse(text: &str) -> ParseOutcome {
    let mut info = DeviceInfo::default();
    let mut entries = Vec::new();
    let mut diagnostics = Vec::new();
    let mut array_names: HashMap<u16, String> = HashMap::new();

    let mut diag = |line: usize, message: String| diagnostics.push(Diagnostic { line, message });

    for block in split_blocks(text) {
        let (index, subindex) = match classify(block.header) {
            Header::DeviceInfo => {
                for (field, slot) in [
                    ("VendorNumber", &mut info.vendor),
                    ("ProductNumber", &mut info.product),
                    ("RevisionNumber", &mut info.revision),
                ] {
                    if let Some((line, value)) = block.field(field) {
                        match parse_u32(value) {
                            Some(v) => *slot = v,
                            None => diag(line, format!("bad {} '{}'", field, value)),
                        }
                    }
                }
                continue;
            }
            Header::Other => {
                log::trace!("[schema] skipping block [{}]", block.header);
                continue;
            }
            Header::Object { index, subindex } => (index, subindex),
        };

        let name = block
            .field("ParameterName")
            .map(|(_, v)| sanitize_name(v))
            .unwrap_or_default();

        if subindex.is_none() {
            let sub_count = block
                .field("SubNumber")
                .and_then(|(_, v)| Value::parse(Kind::UInt8, v).ok())
                .and_then(|v| v.get::<u8>().ok())
                .unwrap_or(0);
            let object_type = block
                .field("ObjectType")
                .and_then(|(_, v)| parse_u32(v))
                .unwrap_or(0x7);
            if sub_count != 0 || object_type == 0x8 || object_type == 0x9 {
                array_names.insert(index, name);
                continue;
            }
        }

        let full_name = match (subindex, array_names.get(&index)) {
            (Some(_), Some(parent)) if !parent.is_empty() => format!("{}::{}", parent, name),
            _ => name,
        };

        let Some((type_line, type_text)) = block.field("DataType") else {
            diag(block.line, format!("[{}] has no DataType, skipped", block.header));
            continue;
        };
        let kind = match parse_u32(type_text).and_then(|c| u16::try_from(c).ok()) {
            Some(code) => match kind_from_code(code) {
                Some(kind) => kind,
                None => {
                    log::debug!(
                        "[schema] [{}] unsupported DataType 0x{:X}, skipped",
                        block.header,
                        code
                    );
                    continue;
                }
            },
            None => {
                diag(type_line, format!("bad DataType '{}'", type_text));
                continue;
            }
        };

        let access = block
            .field("AccessType")
            .map(|(_, v)| AccessType::from_schema(v))
            .unwrap_or(AccessType::Constant);

        let pdo_mappable = match block.field("PDOMapping") {
            Some((line, v)) => parse_bool(v).unwrap_or_else(|| {
                diag(line, format!("bad PDOMapping '{}'", v));
                false
            }),
            None => false,
        };

        let default = match block.field("DefaultValue") {
            Some((line, raw)) => {
                let text = strip_node_id(raw);
                if text.is_empty() {
                    None
                } else {
                    match Value::parse(kind, text) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            diag(line, format!("bad DefaultValue '{}': {}", raw, e));
                            None
                        }
                    }
                }
            }
            None => None,
        };

        let id = RegisterId::new(index, subindex.unwrap_or(0));
        let mut descriptor = RegisterDescriptor::new(id, kind, access, pdo_mappable, full_name);
        descriptor.default = default;
        entries.push((block.line, descriptor));
    }

    // Duplicates keep their first definition.
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(entries.len());
    for (line, descriptor) in entries {
        if seen.insert(descriptor.id) {
            unique.push(descriptor);
        } else {
            diag(line, format!("duplicate register {}, ignored", descriptor.id));
        }
    }

    diagnostics.sort_by_key(|d| d.line);
    ParseOutcome {
        dictionary: Dictionary::from_descriptors(info, unique),
        diagnostics,
    }
}

/// `$NODEID+0x180` style defaults are node relative; keep the offset.
fn strip_node_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    match (trimmed.get(..7), trimmed.get(7..)) {
        (Some(head), Some(rest)) if head.eq_ignore_ascii_case("$NODEID") => {
            rest.trim_start().trim_start_matches('+').trim()
        }
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[FileInfo]
FileName=sample.eds

[DeviceInfo]
VendorNumber=0x0000029C
ProductNumber=4711
RevisionNumber=0x10

[1000]
ParameterName=Device Type
ObjectType=0x7
DataType=0x0007
AccessType=ro
DefaultValue=0x00020192
PDOMapping=0

[1018]
ParameterName=Identity Object
ObjectType=0x9
SubNumber=2

[1018sub0]
ParameterName=Number of entries
DataType=0x0005
AccessType=const
DefaultValue=1

[1018sub1]
ParameterName=Vendor-ID
DataType=0x0007
AccessType=ro

[1800sub1]
ParameterName=COB-ID used by TPDO
DataType=0x0007
AccessType=rw
DefaultValue=$NODEID+0x180

[6040]
ParameterName=Controlword
DataType=0x0006
AccessType=rww
PDOMapping=1
DefaultValue=0
";

    #[test]
    fn test_parse_sample() {
        let outcome = parse(SAMPLE);
        assert!(outcome.diagnostics.is_empty(), "{:?}", outcome.diagnostics);
        let dict = outcome.dictionary;
        assert_eq!(dict.len(), 5);
        assert_eq!(
            dict.info(),
            DeviceInfo {
                vendor: 0x29C,
                product: 4711,
                revision: 0x10
            }
        );

        let key = dict.find(0x1018, 1).unwrap();
        let entry = dict.entry(key).unwrap();
        assert_eq!(entry.name, "Identity_Object::Vendor_ID");
        assert_eq!(entry.kind, Kind::UInt32);
        assert_eq!(entry.access, AccessType::ReadOnly);

        let cw = dict.entry(dict.find(0x6040, 0).unwrap()).unwrap();
        assert!(cw.pdo_mappable);
        assert_eq!(cw.access, AccessType::ReadWrite);
        assert_eq!(cw.default, Some(Value::UInt16(0)));

        let cob = dict.entry(dict.find(0x1800, 1).unwrap()).unwrap();
        assert_eq!(cob.default, Some(Value::UInt32(0x180)));

        // Array header produces no register of its own.
        assert!(dict.find(0x1018, 0).is_ok());
        assert_eq!(dict.find_by_name("Identity_Object"), None);
    }

    #[test]
    fn test_sorted_after_parse() {
        let text = "[2001]\nDataType=0x5\nAccessType=rw\n[2000]\nDataType=0x5\nAccessType=rw\n";
        let dict = parse(text).dictionary;
        let ids: Vec<_> = dict.iter().map(|(_, e)| e.id.index()).collect();
        assert_eq!(ids, vec![0x2000, 0x2001]);
    }

    #[test]
    fn test_malformed_fields_are_diagnosed_and_skipped() {
        let text = "\
[2000]
ParameterName=good
DataType=0x0006
DefaultValue=banana
PDOMapping=maybe
[2001]
ParameterName=no type
AccessType=rw
[2002]
ParameterName=bool
DataType=0x0001
[2003]
ParameterName=bad type
DataType=zz
";
        let outcome = parse(text);
        let dict = outcome.dictionary;
        assert_eq!(dict.len(), 1);
        let entry = dict.entry(dict.find(0x2000, 0).unwrap()).unwrap();
        assert_eq!(entry.default, None);
        assert!(!entry.pdo_mappable);

        let lines: Vec<usize> = outcome.diagnostics.iter().map(|d| d.line).collect();
        assert_eq!(lines, vec![4, 5, 6, 14]);
    }

    #[test]
    fn test_duplicate_register_reported() {
        let text = "[2000]\nDataType=0x5\n[2000]\nDataType=0x6\n";
        let outcome = parse(text);
        assert_eq!(outcome.dictionary.len(), 1);
        assert_eq!(outcome.diagnostics.len(), 1);
        let entry = outcome
            .dictionary
            .entry(outcome.dictionary.find(0x2000, 0).unwrap())
            .unwrap();
        assert_eq!(entry.kind, Kind::UInt8);
    }

    #[test]
    fn test_header_classification() {
        assert!(matches!(classify("DeviceInfo"), Header::DeviceInfo));
        assert!(matches!(
            classify("1A00sub3"),
            Header::Object {
                index: 0x1A00,
                subindex: Some(3)
            }
        ));
        assert!(matches!(classify("MandatoryObjects"), Header::Other));
        assert!(matches!(classify("12345"), Header::Other));
        assert!(matches!(classify("0000"), Header::Other));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Vendor-ID"), "Vendor_ID");
        assert_eq!(sanitize_name("Mode of op. display "), "Mode_of_op_display");
        assert_eq!(sanitize_name("a  - b"), "a_b");
    }
}
