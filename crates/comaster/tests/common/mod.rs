// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated peer device shared by the integration tests.
//!
//! The peer runs on its own thread behind a `VirtualBus` endpoint and
//! answers register transfers from an in-memory object map. Individual
//! registers can be set to abort or to stay silent.

#![allow(dead_code)]

use comaster::transport::VirtualDriver;
use comaster::{CanDriver, Dictionary, Frame, Master, ProtocolEngine, VirtualBus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Schema of the simulated drive.
pub const DRIVE_EDS: &str = "\
[DeviceInfo]
VendorNumber=0x0000029C
ProductNumber=0x00000402
RevisionNumber=3

[1000]
ParameterName=Device Type
DataType=0x0007
AccessType=ro
PDOMapping=0

[1008]
ParameterName=Manufacturer device name
DataType=0x0009
AccessType=const

[1014]
ParameterName=COB-ID EMCY
DataType=0x0007
AccessType=rw

[1017]
ParameterName=Producer heartbeat time
DataType=0x0006
AccessType=rw

[1400sub1]
ParameterName=RPDO1 COB-ID
DataType=0x0007
AccessType=rw

[1400sub2]
ParameterName=RPDO1 transmission type
DataType=0x0005
AccessType=rw

[1600sub0]
ParameterName=RPDO1 mapping count
DataType=0x0005
AccessType=rw

[1600sub1]
ParameterName=RPDO1 mapping entry 1
DataType=0x0007
AccessType=rw

[1600sub2]
ParameterName=RPDO1 mapping entry 2
DataType=0x0007
AccessType=rw

[1800sub1]
ParameterName=TPDO1 COB-ID
DataType=0x0007
AccessType=rw

[1800sub2]
ParameterName=TPDO1 transmission type
DataType=0x0005
AccessType=rw

[1800sub3]
ParameterName=TPDO1 inhibit time
DataType=0x0006
AccessType=rw

[1800sub5]
ParameterName=TPDO1 event timer
DataType=0x0006
AccessType=rw

[1A00sub0]
ParameterName=TPDO1 mapping count
DataType=0x0005
AccessType=rw

[1A00sub1]
ParameterName=TPDO1 mapping entry 1
DataType=0x0007
AccessType=rw

[1A00sub2]
ParameterName=TPDO1 mapping entry 2
DataType=0x0007
AccessType=rw

[1A00sub3]
ParameterName=TPDO1 mapping entry 3
DataType=0x0007
AccessType=rw

[2000]
ParameterName=Speed setpoint
DataType=0x0006
AccessType=rw
PDOMapping=1

[2001]
ParameterName=Odometer
DataType=0x001B
AccessType=rw
PDOMapping=1

[2100]
ParameterName=Label
DataType=0x0009
AccessType=rw

[2101]
ParameterName=Mode
DataType=0x0002
AccessType=rw
PDOMapping=0

[6040]
ParameterName=Controlword
DataType=0x0006
AccessType=rww
PDOMapping=1

[6041]
ParameterName=Statusword
DataType=0x0006
AccessType=ro
PDOMapping=1

[6064]
ParameterName=Position actual value
DataType=0x0004
AccessType=ro
PDOMapping=1

[606C]
ParameterName=Velocity actual value
DataType=0x0004
AccessType=ro
PDOMapping=1
";

pub const DEVICE_TYPE: u32 = 0x0002_0192;
pub const DEVICE_NAME: &str = "comaster sim drive";

type ObjectKey = (u16, u8);

struct PeerShared {
    node_id: u8,
    driver: VirtualDriver,
    objects: Mutex<HashMap<ObjectKey, Vec<u8>>>,
    aborts: Mutex<HashMap<ObjectKey, u32>>,
    silent: Mutex<HashSet<ObjectKey>>,
    received: Mutex<Vec<Frame>>,
    state: Mutex<u8>,
    stop: AtomicBool,
}

/// Peer device answering on `0x600 + node` / `0x580 + node`.
pub struct SimPeer {
    shared: Arc<PeerShared>,
    handle: Option<JoinHandle<()>>,
}

impl SimPeer {
    pub fn start(bus: &VirtualBus, node_id: u8) -> Self {
        let mut objects = HashMap::new();
        objects.insert((0x1000, 0), DEVICE_TYPE.to_le_bytes().to_vec());
        objects.insert((0x1008, 0), DEVICE_NAME.as_bytes().to_vec());
        objects.insert((0x1014, 0), (0x80 + u32::from(node_id)).to_le_bytes().to_vec());
        objects.insert((0x1017, 0), 0u16.to_le_bytes().to_vec());
        objects.insert((0x1400, 1), (0x200 + u32::from(node_id)).to_le_bytes().to_vec());
        objects.insert((0x1600, 0), vec![0]);
        objects.insert(
            (0x1800, 1),
            ((0x180 + u32::from(node_id)) | 0x8000_0000).to_le_bytes().to_vec(),
        );
        objects.insert((0x1A00, 0), vec![0]);

        let shared = Arc::new(PeerShared {
            node_id,
            driver: bus.endpoint(),
            objects: Mutex::new(objects),
            aborts: Mutex::new(HashMap::new()),
            silent: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
            state: Mutex::new(0x7F),
            stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("sim-peer-{}", node_id))
            .spawn(move || run(&worker))
            .expect("spawn sim peer");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.shared.node_id
    }

    pub fn set(&self, index: u16, sub: u8, bytes: &[u8]) {
        self.shared.objects.lock().insert((index, sub), bytes.to_vec());
    }

    pub fn get(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.shared.objects.lock().get(&(index, sub)).cloned()
    }

    pub fn get_u32(&self, index: u16, sub: u8) -> Option<u32> {
        self.get(index, sub).map(|b| {
            let mut raw = [0u8; 4];
            raw[..b.len().min(4)].copy_from_slice(&b[..b.len().min(4)]);
            u32::from_le_bytes(raw)
        })
    }

    /// Answer any transfer of `(index, sub)` with `code`.
    pub fn abort_on(&self, index: u16, sub: u8, code: u32) {
        self.shared.aborts.lock().insert((index, sub), code);
    }

    /// Never answer transfers of `(index, sub)`.
    pub fn silence(&self, index: u16, sub: u8) {
        self.shared.silent.lock().insert((index, sub));
    }

    pub fn state(&self) -> u8 {
        *self.shared.state.lock()
    }

    /// Transmit an arbitrary frame from the peer.
    pub fn emit(&self, id: u16, data: &[u8]) {
        let frame = Frame::new(id, data).expect("frame");
        self.shared.driver.send(&frame).expect("peer send");
    }

    /// Every frame the peer received, in arrival order.
    pub fn received(&self) -> Vec<Frame> {
        self.shared.received.lock().clone()
    }

    pub fn received_on(&self, id: u16) -> Vec<Frame> {
        self.received().into_iter().filter(|f| f.id == id).collect()
    }

    pub fn clear_received(&self) {
        self.shared.received.lock().clear();
    }
}

impl Drop for SimPeer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = self.shared.driver.close();
    }
}

#[derive(Default)]
struct Transfers {
    upload: Option<(Vec<u8>, usize, bool)>,
    download: Option<(ObjectKey, Vec<u8>, bool)>,
}

fn run(peer: &PeerShared) {
    let mut transfers = Transfers::default();
    while !peer.stop.load(Ordering::Acquire) {
        match peer.driver.receive(Duration::from_millis(20)) {
            Ok(Some(frame)) => handle(peer, &mut transfers, &frame),
            Ok(None) => {}
            Err(_) => break,
        }
    }
}

fn handle(peer: &PeerShared, transfers: &mut Transfers, frame: &Frame) {
    peer.received.lock().push(frame.clone());
    let node = u16::from(peer.node_id);

    if frame.id == 0 && frame.len >= 2 && (frame.data[1] == 0 || frame.data[1] == peer.node_id) {
        let next = match frame.data[0] {
            0x01 => Some(0x05),
            0x02 => Some(0x04),
            0x80 => Some(0x7F),
            0x81 | 0x82 => Some(0x00),
            _ => None,
        };
        if let Some(state) = next {
            *peer.state.lock() = state;
        }
        return;
    }
    if frame.rtr && frame.id == 0x700 + node {
        let state = *peer.state.lock();
        reply_on(peer, 0x700 + node, &[state]);
        return;
    }
    if frame.id == 0x600 + node && !frame.rtr {
        sdo(peer, transfers, frame);
    }
}

fn reply_on(peer: &PeerShared, id: u16, data: &[u8]) {
    let _ = peer.driver.send(&Frame::new(id, data).expect("reply frame"));
}

fn reply(peer: &PeerShared, data: [u8; 8]) {
    reply_on(peer, 0x580 + u16::from(peer.node_id), &data);
}

fn addressed(cs: u8, key: ObjectKey) -> [u8; 8] {
    let index = key.0.to_le_bytes();
    [cs, index[0], index[1], key.1, 0, 0, 0, 0]
}

fn abort(peer: &PeerShared, key: ObjectKey, code: u32) {
    let mut data = addressed(0x80, key);
    data[4..8].copy_from_slice(&code.to_le_bytes());
    reply(peer, data);
}

/// Silent or aborted registers: true when the request was consumed.
fn rule_applies(peer: &PeerShared, key: ObjectKey) -> bool {
    if peer.silent.lock().contains(&key) {
        return true;
    }
    if let Some(code) = peer.aborts.lock().get(&key).copied() {
        abort(peer, key, code);
        return true;
    }
    false
}

fn sdo(peer: &PeerShared, transfers: &mut Transfers, frame: &Frame) {
    let b0 = frame.data[0];
    let key = (u16::from_le_bytes([frame.data[1], frame.data[2]]), frame.data[3]);
    match b0 >> 5 {
        // initiate upload
        2 => {
            if rule_applies(peer, key) {
                return;
            }
            let Some(bytes) = peer.objects.lock().get(&key).cloned() else {
                abort(peer, key, 0x0602_0000);
                return;
            };
            if !bytes.is_empty() && bytes.len() <= 4 {
                let mut data = addressed(0x43 | (((4 - bytes.len()) as u8) << 2), key);
                data[4..4 + bytes.len()].copy_from_slice(&bytes);
                reply(peer, data);
            } else {
                let mut data = addressed(0x41, key);
                data[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                reply(peer, data);
                transfers.upload = Some((bytes, 0, false));
            }
        }
        // upload segment
        3 => {
            let toggle = b0 & 0x10 != 0;
            let Some((bytes, offset, expected)) = transfers.upload.as_mut() else {
                abort(peer, (0, 0), 0x0504_0001);
                return;
            };
            if toggle != *expected {
                transfers.upload = None;
                abort(peer, (0, 0), 0x0503_0000);
                return;
            }
            let end = (*offset + 7).min(bytes.len());
            let n = end - *offset;
            let last = end == bytes.len();
            let mut data = [0u8; 8];
            data[0] = (u8::from(toggle) << 4) | (((7 - n) as u8) << 1) | u8::from(last);
            data[1..1 + n].copy_from_slice(&bytes[*offset..end]);
            *offset = end;
            *expected = !*expected;
            if last {
                transfers.upload = None;
            }
            reply(peer, data);
        }
        // initiate download
        1 => {
            if rule_applies(peer, key) {
                return;
            }
            if b0 & 0x02 != 0 {
                let n = if b0 & 0x01 != 0 {
                    4 - usize::from((b0 >> 2) & 0x03)
                } else {
                    4
                };
                peer.objects.lock().insert(key, frame.data[4..4 + n].to_vec());
            } else {
                transfers.download = Some((key, Vec::new(), false));
            }
            reply(peer, addressed(0x60, key));
        }
        // download segment
        0 => {
            let toggle = b0 & 0x10 != 0;
            let Some((target, buffer, expected)) = transfers.download.as_mut() else {
                abort(peer, (0, 0), 0x0504_0001);
                return;
            };
            if toggle != *expected {
                transfers.download = None;
                abort(peer, (0, 0), 0x0503_0000);
                return;
            }
            let n = 7 - usize::from((b0 >> 1) & 0x07);
            buffer.extend_from_slice(&frame.data[1..1 + n]);
            *expected = !*expected;
            if b0 & 0x01 != 0 {
                let (target, buffer) = (*target, std::mem::take(buffer));
                peer.objects.lock().insert(target, buffer);
                transfers.download = None;
            }
            let mut data = [0u8; 8];
            data[0] = 0x20 | (u8::from(toggle) << 4);
            reply(peer, data);
        }
        // abort from the master
        4 => {
            transfers.upload = None;
            transfers.download = None;
        }
        _ => {}
    }
}

/// Master with one port `can0` on a private bus, the drive model registered
/// and a simulated peer on the same bus.
pub struct Harness {
    pub drive: Arc<ProtocolEngine>,
    pub peer: SimPeer,
    pub master: Master,
    pub bus: VirtualBus,
}

impl Harness {
    pub fn new(node_id: u8) -> Self {
        let master = Master::new();
        master
            .registry()
            .insert("drive", Dictionary::parse_str(DRIVE_EDS));
        let bus = VirtualBus::new("harness");
        master
            .attach_port("can0", Box::new(bus.endpoint()))
            .expect("attach port");
        let peer = SimPeer::start(&bus, node_id);
        let drive = master
            .create_device(1, node_id, "can0", "drive")
            .expect("create device");
        Self {
            drive,
            peer,
            master,
            bus,
        }
    }

    pub fn settle(&self) {
        assert!(
            self.drive
                .wait_queue_empty(Duration::from_secs(2))
                .expect("wait queue"),
            "queue did not drain"
        );
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
