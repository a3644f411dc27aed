// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Start-up from configuration, device registry and teardown.

mod common;

use common::{wait_for, SimPeer, DEVICE_TYPE, DRIVE_EDS};
use comaster::{
    Error, Master, MasterConfig, NmtCommand, Pdo, ReadStatus, VirtualBus,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(1);

fn yaml(schema_dir: &Path, channel: &str, devices: &str) -> String {
    format!(
        "\
reply_timeout_ms: 200
init_timeout_ms: 500
schema_dir: {}
ports:
  - name: can0
    driver: virtual
    channel: {}
devices:
{}",
        schema_dir.display(),
        channel,
        devices
    )
}

fn schema_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("drive.eds"), DRIVE_EDS).unwrap();
    dir
}

#[test]
fn test_from_yaml_with_init() {
    let dir = schema_dir();
    let bus = VirtualBus::shared("registry-init");
    let peer = SimPeer::start(&bus, 6);
    peer.set(0x1014, 0, &0x80u32.to_le_bytes());

    let text = yaml(
        dir.path(),
        "registry-init",
        "  - device_id: 10\n    node_id: 6\n    port: can0\n    model: drive\n    init: true\n",
    );
    let config = MasterConfig::from_yaml_str(&text).unwrap();
    let master = Master::from_config(&config).unwrap();

    assert_eq!(master.ports(), vec!["can0"]);
    assert_eq!(master.devices(), vec![10]);
    let drive = master.device(10).unwrap();
    assert_eq!(drive.node_id(), 6);
    assert!(master.registry().contains("drive"));

    // Device type read, emergency id rewritten, channel identifiers recorded.
    assert_eq!(
        drive.last_received((0x1000, 0)).unwrap().get::<u32>(),
        Some(DEVICE_TYPE)
    );
    assert!(wait_for(WAIT, || peer.get_u32(0x1014, 0) == Some(0x86)));
    assert_eq!(drive.mapping(Pdo::rx(1).unwrap()).unwrap().cob, 0x206);
    let tpdo = drive.mapping(Pdo::tx(1).unwrap()).unwrap();
    assert_eq!(tpdo.cob, 0x186);
    assert!(tpdo.keys.is_empty());
}

#[test]
fn test_init_fails_without_peer() {
    let dir = schema_dir();
    let text = yaml(
        dir.path(),
        "registry-silent",
        "  - device_id: 1\n    node_id: 9\n    port: can0\n    model: drive\n    init: true\n",
    );
    let mut config = MasterConfig::from_yaml_str(&text).unwrap();
    config.init_timeout_ms = 50;
    match Master::from_config(&config) {
        Err(Error::NoResponse(id)) => assert_eq!(id.index(), 0x1000),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("init succeeded without a peer"),
    }
}

#[test]
fn test_config_validation_errors() {
    let dir = schema_dir();
    let bad_node = yaml(
        dir.path(),
        "registry-bad",
        "  - device_id: 1\n    node_id: 200\n    port: can0\n",
    );
    assert!(matches!(
        MasterConfig::from_yaml_str(&bad_node),
        Err(Error::InvalidNodeId(200))
    ));

    let unknown_port = yaml(
        dir.path(),
        "registry-bad",
        "  - device_id: 1\n    node_id: 2\n    port: can7\n",
    );
    assert!(matches!(
        MasterConfig::from_yaml_str(&unknown_port),
        Err(Error::PortNotFound(_))
    ));

    let same_node = yaml(
        dir.path(),
        "registry-bad",
        "  - device_id: 1\n    node_id: 2\n    port: can0\n  - device_id: 2\n    node_id: 2\n    port: can0\n",
    );
    assert!(matches!(
        MasterConfig::from_yaml_str(&same_node),
        Err(Error::DuplicateNode { node_id: 2, .. })
    ));

    assert!(MasterConfig::from_yaml_str("ports: [ {name: x").is_err());
}

#[test]
fn test_devices_on_one_port_progress_independently() {
    let master = Master::new();
    master.registry().insert("drive", comaster::Dictionary::parse_str(DRIVE_EDS));
    let bus = VirtualBus::new("registry-pair");
    master.attach_port("can0", Box::new(bus.endpoint())).unwrap();
    let left_peer = SimPeer::start(&bus, 11);
    let right_peer = SimPeer::start(&bus, 12);
    right_peer.silence(0x6064, 0);

    let left = master.create_device(1, 11, "can0", "drive").unwrap();
    let right = master.create_device(2, 12, "can0", "drive").unwrap();
    right.set_reply_timeout(Duration::from_millis(500));
    left_peer.set(0x6064, 0, &(-1234i32).to_le_bytes());

    // The right device's request hangs; the left one must not wait for it.
    right.request((0x6064, 0)).unwrap();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let left = Arc::clone(&left);
            thread::spawn(move || left.read_and_get((0x6064, 0), WAIT).unwrap())
        })
        .collect();
    for worker in workers {
        let sample = worker.join().unwrap();
        assert_eq!(sample.get::<i32>(), Some(-1234));
    }
    assert!(!right.wait_queue_empty(Duration::ZERO).unwrap());
    assert!(right.wait_queue_empty(WAIT).unwrap());
    assert_eq!(right.counters().timeouts, 1);
    assert_eq!(left.counters().timeouts, 0);
    assert_eq!(
        right.last_received((0x6064, 0)).unwrap().status,
        ReadStatus::NoData
    );
}

#[test]
fn test_broadcast_commands_reach_every_node() {
    let master = Master::new();
    let bus = VirtualBus::new("registry-broadcast");
    master.attach_port("can0", Box::new(bus.endpoint())).unwrap();
    let a = SimPeer::start(&bus, 3);
    let b = SimPeer::start(&bus, 4);

    master.broadcast_nmt("can0", NmtCommand::Start).unwrap();
    assert!(wait_for(WAIT, || a.state() == 0x05 && b.state() == 0x05));

    master.send_sync().unwrap();
    assert!(wait_for(WAIT, || !a.received_on(0x080).is_empty()));
    assert_eq!(b.received_on(0x080).len(), 1);
    assert!(matches!(
        master.broadcast_nmt("can9", NmtCommand::Stop),
        Err(Error::PortNotFound(_))
    ));
}

#[test]
fn test_shutdown_releases_everything() {
    let master = Master::new();
    master.registry().insert("drive", comaster::Dictionary::parse_str(DRIVE_EDS));
    let bus = VirtualBus::new("registry-shutdown");
    master.attach_port("can0", Box::new(bus.endpoint())).unwrap();
    let _peer = SimPeer::start(&bus, 5);
    let drive = master.create_device(1, 5, "can0", "drive").unwrap();
    assert_eq!(
        drive.read_and_get((0x1000, 0), WAIT).unwrap().status,
        ReadStatus::New
    );

    master.shutdown();
    assert!(master.is_shut_down());
    assert!(!drive.port().is_open());
    assert!(drive.write((0x2000, 0), 1u16).is_err());
    assert!(matches!(
        master.attach_port("can1", Box::new(bus.endpoint())),
        Err(Error::ReactorStopped)
    ));
    drop(master);
}
