// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux SocketCAN driver (raw `AF_CAN` socket).
//!
//! Local loopback and own-message reception are disabled, so the reading
//! thread only ever sees frames produced by other nodes. Receive uses
//! `poll(2)` with the caller's timeout.
//!
//! The bitrate must be configured on the interface beforehand
//! (`ip link set can0 type can bitrate 500000`); the requested value is only
//! logged.

use super::{CanDriver, DriverStatus, Frame};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

// linux/can.h, linux/can/raw.h
const AF_CAN: c_int = 29;
const CAN_RAW: c_int = 1;
const SOL_CAN_RAW: c_int = 101;
const CAN_RAW_LOOPBACK: c_int = 3;
const CAN_RAW_RECV_OWN_MSGS: c_int = 4;

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_ERR_FLAG: u32 = 0x2000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// `struct sockaddr_can`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrCan {
    can_family: libc::sa_family_t,
    can_ifindex: c_int,
    addr: [u64; 2],
}

/// `struct can_frame`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CanFrame {
    can_id: u32,
    can_dlc: u8,
    pad: u8,
    res0: u8,
    res1: u8,
    data: [u8; 8],
}

/// Raw CAN socket bound to one interface.
pub struct SocketCanDriver {
    fd: c_int,
    ifname: String,
    closed: AtomicBool,
}

impl SocketCanDriver {
    /// Open and bind a raw socket on `channel` (`can0`, or `0` for `can0`).
    pub fn open(channel: &str, bitrate: Option<u32>) -> Result<Self> {
        let ifname = if !channel.is_empty() && channel.bytes().all(|b| b.is_ascii_digit()) {
            format!("can{}", channel)
        } else {
            channel.to_string()
        };
        let c_name = CString::new(ifname.as_str())
            .map_err(|_| Error::Config(format!("invalid interface name '{}'", ifname)))?;

        // SAFETY: plain socket(2) call; the descriptor is owned by Self.
        let fd = unsafe { libc::socket(AF_CAN, libc::SOCK_RAW | libc::SOCK_CLOEXEC, CAN_RAW) };
        if fd < 0 {
            return Err(os_error("socket", &ifname));
        }

        match Self::configure(fd, &c_name, &ifname) {
            Ok(()) => {
                if let Some(rate) = bitrate {
                    log::info!(
                        "[port] {} requested bitrate {} (configure it on the interface)",
                        ifname,
                        rate
                    );
                }
                log::debug!("[port] socketcan '{}' bound (fd {})", ifname, fd);
                Ok(Self {
                    fd,
                    ifname,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                // SAFETY: fd was returned by socket(2) above and is not shared.
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    fn configure(fd: c_int, c_name: &CString, ifname: &str) -> Result<()> {
        // SAFETY: c_name is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(os_error("if_nametoindex", ifname));
        }

        let off: c_int = 0;
        for option in [CAN_RAW_LOOPBACK, CAN_RAW_RECV_OWN_MSGS] {
            // SAFETY: option value points to a live c_int of the given size.
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    SOL_CAN_RAW,
                    option,
                    (&off as *const c_int).cast::<c_void>(),
                    std::mem::size_of::<c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(os_error("setsockopt", ifname));
            }
        }

        let addr = SockaddrCan {
            can_family: AF_CAN as libc::sa_family_t,
            can_ifindex: ifindex as c_int,
            addr: [0; 2],
        };
        // SAFETY: addr is a properly laid out sockaddr_can.
        let rc = unsafe {
            libc::bind(
                fd,
                (&addr as *const SockaddrCan).cast::<libc::sockaddr>(),
                std::mem::size_of::<SockaddrCan>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("bind", ifname));
        }
        Ok(())
    }

    pub fn interface(&self) -> &str {
        &self.ifname
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PortClosed(self.ifname.clone()));
        }
        Ok(())
    }
}

fn os_error(call: &str, ifname: &str) -> Error {
    Error::Transport(format!("{} on {}: {}", call, ifname, io::Error::last_os_error()))
}

impl CanDriver for SocketCanDriver {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        let mut raw = CanFrame {
            can_id: u32::from(frame.id) & CAN_SFF_MASK,
            can_dlc: frame.len.min(8),
            ..CanFrame::default()
        };
        if frame.rtr {
            raw.can_id |= CAN_RTR_FLAG;
        }
        raw.data = frame.data;

        // SAFETY: raw is a fully initialised can_frame.
        let written = unsafe {
            libc::write(
                self.fd,
                (&raw as *const CanFrame).cast::<c_void>(),
                std::mem::size_of::<CanFrame>(),
            )
        };
        if written != std::mem::size_of::<CanFrame>() as isize {
            return Err(os_error("write", &self.ifname));
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.ensure_open()?;
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        // SAFETY: pfd is valid for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(Error::Transport(format!("poll on {}: {}", self.ifname, err)));
        }
        if ready == 0 {
            return Ok(None);
        }

        let mut raw = CanFrame::default();
        // SAFETY: raw is writable and sized as one can_frame.
        let read = unsafe {
            libc::read(
                self.fd,
                (&mut raw as *mut CanFrame).cast::<c_void>(),
                std::mem::size_of::<CanFrame>(),
            )
        };
        if read < 0 {
            return Err(os_error("read", &self.ifname));
        }
        if read != std::mem::size_of::<CanFrame>() as isize {
            log::warn!("[port] {} short read ({} bytes)", self.ifname, read);
            return Ok(None);
        }
        if raw.can_id & (CAN_EFF_FLAG | CAN_ERR_FLAG) != 0 {
            log::trace!("[port] {} skip extended/error frame 0x{:08X}", self.ifname, raw.can_id);
            return Ok(None);
        }

        let mut frame = Frame::with_data((raw.can_id & CAN_SFF_MASK) as u16, raw.data);
        frame.len = raw.can_dlc.min(8);
        frame.rtr = raw.can_id & CAN_RTR_FLAG != 0;
        frame.timestamp = Some(Instant::now());
        Ok(Some(frame))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // SAFETY: fd is owned by self and closed exactly once.
            unsafe { libc::close(self.fd) };
            log::debug!("[port] socketcan '{}' closed", self.ifname);
        }
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        if self.closed.load(Ordering::Acquire) {
            return DriverStatus::Closed;
        }
        let mut err: c_int = 0;
        let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
        // SAFETY: err/len point to live locals of the advertised size.
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut c_int).cast::<c_void>(),
                &mut len,
            )
        };
        if rc != 0 {
            return DriverStatus::Error(io::Error::last_os_error().raw_os_error().unwrap_or(-1));
        }
        if err != 0 {
            DriverStatus::Error(err)
        } else {
            DriverStatus::Active
        }
    }
}

impl Drop for SocketCanDriver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
