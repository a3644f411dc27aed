// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register request/reply frame codec.
//!
//! # Wire layout
//!
//! ```text
//! byte 0    command specifier
//! byte 1-2  index (little-endian)
//! byte 3    subindex
//! byte 4-7  data, size or abort code
//! ```
//!
//! Segment frames reuse bytes 1..8 as payload.
//!
//! | reply cs (b0 >> 5) | meaning                      |
//! |--------------------|------------------------------|
//! | 0                  | upload segment               |
//! | 1                  | download segment acknowledged|
//! | 2                  | initiate upload              |
//! | 3                  | initiate download ack        |
//! | 4                  | abort                        |

use super::AbortCode;
use crate::config::{COB_SDO_REPLY, COB_SDO_REQUEST, EXPEDITED_MAX_BYTES, SEGMENT_BYTES};
use crate::dictionary::RegisterId;
use crate::error::{Error, Result};
use crate::transport::Frame;

/// Client request: initiate upload.
pub const CCS_UPLOAD: u8 = 0x40;
/// Client request: upload segment (toggle in bit 4).
pub const CCS_UPLOAD_SEGMENT: u8 = 0x60;
/// Client request: initiate download, segmented, size indicated.
pub const CCS_DOWNLOAD_SEGMENTED: u8 = 0x21;
/// Expedited download base (`0x20 | n << 2 | e | s`).
pub const CCS_DOWNLOAD_EXPEDITED: u8 = 0x23;
/// Abort transfer.
pub const CS_ABORT: u8 = 0x80;

const TOGGLE_BIT: u8 = 0x10;

#[inline]
pub fn request_id(node_id: u8) -> u16 {
    COB_SDO_REQUEST + u16::from(node_id)
}

#[inline]
pub fn reply_id(node_id: u8) -> u16 {
    COB_SDO_REPLY + u16::from(node_id)
}

fn addressed(cs: u8, id: RegisterId) -> [u8; 8] {
    let index = id.index().to_le_bytes();
    [cs, index[0], index[1], id.subindex(), 0, 0, 0, 0]
}

/// Read request.
pub fn upload_request(node_id: u8, id: RegisterId) -> Frame {
    Frame::with_data(request_id(node_id), addressed(CCS_UPLOAD, id)).expect_answer(reply_id(node_id))
}

/// True for a read request (upload initiate).
pub fn is_upload_request(frame: &Frame) -> bool {
    !frame.rtr && (frame.data[0] & 0xE0) == CCS_UPLOAD
}

/// Request the next upload segment.
pub fn upload_segment_request(node_id: u8, toggle: bool) -> Frame {
    let cs = CCS_UPLOAD_SEGMENT | if toggle { TOGGLE_BIT } else { 0 };
    Frame::with_data(request_id(node_id), [cs, 0, 0, 0, 0, 0, 0, 0])
        .expect_answer(reply_id(node_id))
}

/// True for a queued upload-segment request to `node_id`.
pub fn is_upload_segment_request(frame: &Frame, node_id: u8) -> bool {
    frame.id == request_id(node_id) && (frame.data[0] & 0xE0) == CCS_UPLOAD_SEGMENT
}

/// Single-frame write of 1..=4 bytes.
pub fn expedited_download(node_id: u8, id: RegisterId, bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() || bytes.len() > EXPEDITED_MAX_BYTES {
        return Err(Error::InvalidFrame(format!(
            "expedited write of {} bytes",
            bytes.len()
        )));
    }
    let unused = (EXPEDITED_MAX_BYTES - bytes.len()) as u8;
    let mut data = addressed(0x20 | (unused << 2) | 0x03, id);
    data[4..4 + bytes.len()].copy_from_slice(bytes);
    Ok(Frame::with_data(request_id(node_id), data).expect_answer(reply_id(node_id)))
}

/// Start a segmented write announcing `size` bytes.
pub fn initiate_segmented_download(node_id: u8, id: RegisterId, size: u32) -> Frame {
    let mut data = addressed(CCS_DOWNLOAD_SEGMENTED, id);
    data[4..8].copy_from_slice(&size.to_le_bytes());
    Frame::with_data(request_id(node_id), data).expect_answer(reply_id(node_id))
}

/// True when `frame` initiated a segmented (not expedited) download.
pub fn is_segmented_download_initiate(frame: &Frame) -> bool {
    (frame.data[0] & 0xE0) == 0x20 && (frame.data[0] & 0x02) == 0
}

/// One download segment of up to 7 bytes.
pub fn download_segment(node_id: u8, toggle: bool, chunk: &[u8], last: bool) -> Result<Frame> {
    if chunk.len() > SEGMENT_BYTES {
        return Err(Error::InvalidFrame(format!("segment of {} bytes", chunk.len())));
    }
    let unused = (SEGMENT_BYTES - chunk.len()) as u8;
    let mut data = [0u8; 8];
    data[0] = (if toggle { TOGGLE_BIT } else { 0 }) | (unused << 1) | u8::from(last);
    data[1..1 + chunk.len()].copy_from_slice(chunk);
    Ok(Frame::with_data(request_id(node_id), data).expect_answer(reply_id(node_id)))
}

/// Master-side abort (no answer expected).
pub fn abort_request(node_id: u8, id: RegisterId, code: AbortCode) -> Frame {
    let mut data = addressed(CS_ABORT, id);
    data[4..8].copy_from_slice(&code.raw().to_le_bytes());
    Frame::with_data(request_id(node_id), data)
}

/// Register addressed by bytes 1..4.
#[inline]
pub fn addressed_register(frame: &Frame) -> RegisterId {
    RegisterId::new(frame.u16_at(1), frame.data[3])
}

/// Decoded peer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<'a> {
    /// Expedited upload: data in bytes 4..4+len.
    UploadExpedited { id: RegisterId, data: &'a [u8] },
    /// Segmented upload announced; size known when indicated.
    UploadInitiated { id: RegisterId, size: Option<u32> },
    UploadSegment { toggle: bool, data: &'a [u8], last: bool },
    DownloadAck { id: RegisterId },
    DownloadSegmentAck { toggle: bool },
    Abort { id: RegisterId, code: AbortCode },
}

/// Decode a frame received on the reply band.
pub fn parse_reply(frame: &Frame) -> Result<Reply<'_>> {
    // Short replies are tolerated: unused bytes read as zero.
    if frame.len == 0 {
        return Err(Error::InvalidFrame(format!("empty reply {}", frame)));
    }
    let b0 = frame.data[0];
    match b0 >> 5 {
        0 => {
            let unused = usize::from((b0 >> 1) & 0x07);
            let n = SEGMENT_BYTES - unused;
            Ok(Reply::UploadSegment {
                toggle: b0 & TOGGLE_BIT != 0,
                data: &frame.data[1..1 + n],
                last: b0 & 0x01 != 0,
            })
        }
        1 => Ok(Reply::DownloadSegmentAck {
            toggle: b0 & TOGGLE_BIT != 0,
        }),
        2 => {
            let id = addressed_register(frame);
            let expedited = b0 & 0x02 != 0;
            let indicated = b0 & 0x01 != 0;
            if expedited {
                let n = if indicated {
                    EXPEDITED_MAX_BYTES - usize::from((b0 >> 2) & 0x03)
                } else {
                    EXPEDITED_MAX_BYTES
                };
                Ok(Reply::UploadExpedited {
                    id,
                    data: &frame.data[4..4 + n],
                })
            } else {
                Ok(Reply::UploadInitiated {
                    id,
                    size: indicated.then(|| frame.u32_at(4)),
                })
            }
        }
        3 => Ok(Reply::DownloadAck {
            id: addressed_register(frame),
        }),
        4 => Ok(Reply::Abort {
            id: addressed_register(frame),
            code: AbortCode(frame.u32_at(4)),
        }),
        other => Err(Error::InvalidFrame(format!(
            "unknown reply command specifier {} in {}",
            other, frame
        ))),
    }
}
