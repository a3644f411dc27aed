// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register transfers against the simulated peer.

mod common;

use common::{Harness, DEVICE_NAME, DEVICE_TYPE};
use comaster::events::EVENT_PROTOCOL_ERROR;
use comaster::{AbortCode, DeliveryMode, Error, Event, Payload, ReadStatus, Value};
use crossbeam::channel::unbounded;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(1);

#[test]
fn test_expedited_round_trip_freshness() {
    let h = Harness::new(5);
    h.drive.write((0x2000, 0), 1500u16).unwrap();
    h.settle();
    assert_eq!(h.peer.get(0x2000, 0), Some(1500u16.to_le_bytes().to_vec()));

    let sample = h.drive.read_and_get((0x2000, 0), WAIT).unwrap();
    assert_eq!(sample.status, ReadStatus::New);
    assert_eq!(sample.get::<u16>(), Some(1500));

    let again = h.drive.last_received((0x2000, 0)).unwrap();
    assert_eq!(again.status, ReadStatus::Old);
    assert_eq!(again.value, Some(Value::UInt16(1500)));
}

#[test]
fn test_write_converts_to_declared_kind() {
    let h = Harness::new(5);
    h.drive.write((0x2000, 0), 42i64).unwrap();
    h.settle();
    assert_eq!(h.peer.get(0x2000, 0), Some(vec![42, 0]));

    assert!(matches!(
        h.drive.write((0x2000, 0), -1i32),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        h.drive.write((0x2000, 0), "fast"),
        Err(Error::IncompatibleKinds { .. })
    ));
}

#[test]
fn test_read_only_rejected_before_sending() {
    let h = Harness::new(5);
    h.peer.clear_received();
    assert!(matches!(
        h.drive.write((0x6041, 0), 7u16),
        Err(Error::AccessDenied { .. })
    ));
    assert!(matches!(
        h.drive.write((0x1008, 0), "renamed"),
        Err(Error::AccessDenied { .. })
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.peer.received().is_empty());
}

#[test]
fn test_unknown_register_is_a_lookup_error() {
    let h = Harness::new(5);
    assert!(matches!(
        h.drive.read_and_get((0x3000, 0), WAIT),
        Err(Error::RegisterNotFound { index: 0x3000, subindex: 0 })
    ));
}

#[test]
fn test_segmented_upload_of_string() {
    let h = Harness::new(5);
    let sample = h.drive.read_and_get((0x1008, 0), WAIT).unwrap();
    assert_eq!(sample.status, ReadStatus::New);
    assert_eq!(sample.value, Some(Value::String(DEVICE_NAME.to_string())));

    // 18 bytes: one initiate and three segment requests with alternating toggle.
    let requests = h.peer.received_on(0x605);
    let toggles: Vec<u8> = requests[1..].iter().map(|f| f.data[0]).collect();
    assert_eq!(toggles, vec![0x60, 0x70, 0x60]);
}

#[test]
fn test_segmented_round_trip_of_string() {
    let h = Harness::new(5);
    let label = "axis 3 / gantry left";
    h.drive.write((0x2100, 0), label).unwrap();
    h.settle();
    assert_eq!(h.peer.get(0x2100, 0), Some(label.as_bytes().to_vec()));

    let segments: Vec<u8> = h
        .peer
        .received_on(0x605)
        .iter()
        .skip(1)
        .map(|f| f.data[0] & 0x10)
        .collect();
    assert_eq!(segments, vec![0x00, 0x10, 0x00]);

    let sample = h.drive.read_and_get((0x2100, 0), WAIT).unwrap();
    assert_eq!(sample.value, Some(Value::String(label.to_string())));
}

#[test]
fn test_random_strings_round_trip() {
    let h = Harness::new(5);
    let mut rng = fastrand::Rng::with_seed(0x5EED);
    for _ in 0..12 {
        let len = rng.usize(0..40);
        let text: String = (0..len).map(|_| rng.alphanumeric()).collect();
        h.drive.write((0x2100, 0), text.as_str()).unwrap();
        let sample = h.drive.read_and_get((0x2100, 0), WAIT).unwrap();
        assert_eq!(sample.status, ReadStatus::New, "length {}", len);
        assert_eq!(sample.value, Some(Value::String(text)));
    }
}

#[test]
fn test_read_queued_behind_write_sees_its_own_reply() {
    let h = Harness::new(5);
    for speed in [100u16, 200, 300, 400] {
        h.drive.write((0x2000, 0), speed).unwrap();
        let sample = h.drive.read_and_get((0x2000, 0), WAIT).unwrap();
        assert_eq!(sample.get::<u16>(), Some(speed));
        // The upload went out before the read returned.
        let last = h.peer.received_on(0x605).pop().unwrap();
        assert_eq!(last.data[0], 0x40);
    }

    for label in ["first label", "second, longer label", "third one"] {
        h.drive.write((0x2100, 0), label).unwrap();
        let sample = h.drive.read_and_get((0x2100, 0), WAIT).unwrap();
        assert_eq!(sample.status, ReadStatus::New);
        assert_eq!(sample.value, Some(Value::String(label.to_string())));
        let last = h.peer.received_on(0x605).pop().unwrap();
        assert_eq!(last.data[0] & 0xE0, 0x60);
    }
    assert!(h.drive.wait_queue_empty(WAIT).unwrap());
}

#[test]
fn test_64_bit_value_uses_segmented_transfer() {
    let h = Harness::new(5);
    let odometer = 0x0102_0304_0506_0708u64;
    h.drive.write((0x2001, 0), odometer).unwrap();
    h.settle();
    assert_eq!(h.peer.get(0x2001, 0), Some(odometer.to_le_bytes().to_vec()));
    assert_eq!(h.peer.received_on(0x605)[0].data[0], 0x21);

    let sample = h.drive.read_and_get((0x2001, 0), WAIT).unwrap();
    assert_eq!(sample.get::<u64>(), Some(odometer));
}

#[test]
fn test_abort_raises_event_and_keeps_cache() {
    let h = Harness::new(5);
    let (tx, rx) = unbounded();
    h.drive
        .events()
        .subscribe(
            EVENT_PROTOCOL_ERROR,
            DeliveryMode::InlineOnReceive,
            Some(Arc::new(move |e: &Event| {
                let _ = tx.send(e.clone());
            })),
        )
        .unwrap();

    h.peer.abort_on(0x6064, 0, AbortCode::READ_WRITE_ONLY.raw());
    let sample = h
        .drive
        .read_and_get((0x6064, 0), Duration::from_millis(150))
        .unwrap();
    assert_eq!(sample.status, ReadStatus::TimedOut);

    let event = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.device_id, 1);
    match event.payload {
        Payload::Abort { register, code } => {
            assert_eq!(register.index(), 0x6064);
            assert_eq!(code.raw(), 0x0601_0001);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    let cached = h.drive.last_received((0x6064, 0)).unwrap();
    assert_eq!(cached.status, ReadStatus::NoData);
}

#[test]
fn test_timeout_reports_once_and_queue_resumes() {
    let h = Harness::new(5);
    h.drive.set_reply_timeout(Duration::from_millis(40));
    h.peer.silence(0x6064, 0);

    let lost = h
        .drive
        .read_and_get((0x6064, 0), Duration::from_millis(100))
        .unwrap();
    assert_eq!(lost.status, ReadStatus::TimedOut);

    let sample = h.drive.read_and_get((0x1000, 0), WAIT).unwrap();
    assert_eq!(sample.get::<u32>(), Some(DEVICE_TYPE));
    assert_eq!(h.drive.counters().timeouts, 1);
    assert_eq!(
        h.drive.last_received((0x6064, 0)).unwrap().status,
        ReadStatus::NoData
    );
}

#[test]
fn test_requests_are_strictly_sequential() {
    let h = Harness::new(5);
    for _ in 0..5 {
        h.drive.request((0x1000, 0)).unwrap();
        h.drive.request((0x1008, 0)).unwrap();
    }
    h.settle();

    // Each request is followed by its own answer before the next one goes out.
    let counters = h.drive.counters();
    assert_eq!(counters.timeouts, 0);
    let initiates: Vec<_> = h
        .peer
        .received_on(0x605)
        .into_iter()
        .filter(|f| f.data[0] == 0x40)
        .collect();
    assert_eq!(initiates.len(), 10);
    assert_eq!(
        h.drive.last_received((0x1008, 0)).unwrap().value,
        Some(Value::String(DEVICE_NAME.to_string()))
    );
}
