use std::time::Duration;

use chrono::{TimeDelta, Utc};
use skysweep::config::EngineConfig;
use skysweep::packet::{Classification, IngestOutcome, ObservationDelta, PacketEngine};

/// Build a capture frame: minimal capture header with channel + antenna
/// signal, a beacon MAC header, and an SSID element.
fn beacon(mac: [u8; 6], freq: u16, signal: i8, ssid: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    let present: u32 = (1 << 3) | (1 << 5);
    let header_len: u16 = 13;
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&header_len.to_le_bytes());
    frame.extend_from_slice(&present.to_le_bytes());
    frame.extend_from_slice(&freq.to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.push(signal as u8);

    frame.extend_from_slice(&0x0080u16.to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&mac);
    frame.extend_from_slice(&mac);
    frame.extend_from_slice(&0u16.to_le_bytes());

    frame.extend_from_slice(&[0u8; 8]);
    frame.extend_from_slice(&100u16.to_le_bytes());
    frame.extend_from_slice(&0x0001u16.to_le_bytes());

    frame.push(0);
    frame.push(ssid.len() as u8);
    frame.extend_from_slice(ssid);
    frame
}

fn engine() -> PacketEngine {
    PacketEngine::new(EngineConfig {
        debounce: Duration::from_millis(400),
        working_set_cap: 16,
        ..EngineConfig::default()
    })
}

/// N frames from one identifier inside a debounce window produce exactly
/// one observation delta.
#[test]
fn burst_of_frames_produces_one_delta() {
    let mut engine = engine();
    let now = Utc::now();
    let frame = beacon([0xde, 0xad, 0, 0, 0, 1], 2437, -62, b"cafe-wifi");

    let mut deltas = 0;
    for i in 0..50 {
        let at = now + TimeDelta::milliseconds(i * 5);
        if let IngestOutcome::Delta(_) = engine.ingest_at(&frame, at) {
            deltas += 1;
        }
    }
    assert_eq!(deltas, 1);

    let device = engine.device("de:ad:00:00:00:01").unwrap();
    assert_eq!(device.observation_count, 1);
    assert_eq!(device.best_signal_dbm, Some(-62));
}

/// The event rate is bounded by the debounce window, independent of the raw
/// frame rate.
#[test]
fn event_rate_bounded_by_debounce_window() {
    let mut engine = engine();
    let now = Utc::now();
    let frame = beacon([0xde, 0xad, 0, 0, 0, 2], 2437, -62, b"net");

    let mut observations = 0;
    // 2 seconds of frames at 5ms spacing against a 400ms debounce
    for i in 0..400 {
        let at = now + TimeDelta::milliseconds(i * 5);
        engine.ingest_at(&frame, at);
        observations = engine.device("de:ad:00:00:00:02").unwrap().observation_count;
    }
    assert!(observations <= 6, "debounce failed to bound rate: {observations}");
    assert!(observations >= 4, "too few merged observations: {observations}");
}

#[test]
fn working_set_evicts_least_recent_at_ceiling() {
    let mut engine = PacketEngine::new(EngineConfig {
        working_set_cap: 3,
        debounce: Duration::from_millis(1),
        ..EngineConfig::default()
    });
    let now = Utc::now();

    for (i, mac_tail) in [1u8, 2, 3].iter().enumerate() {
        engine.ingest_at(
            &beacon([0, 0, 0, 0, 0, *mac_tail], 2412, -70, b"n"),
            now + TimeDelta::seconds(i as i64),
        );
    }
    // refresh device 1 so device 2 is now the oldest
    engine.ingest_at(
        &beacon([0, 0, 0, 0, 0, 1], 2412, -70, b"n"),
        now + TimeDelta::seconds(10),
    );
    // device 4 pushes out exactly device 2
    engine.ingest_at(
        &beacon([0, 0, 0, 0, 0, 4], 2412, -70, b"n"),
        now + TimeDelta::seconds(11),
    );

    assert_eq!(engine.device_count(), 3);
    assert!(engine.device("00:00:00:00:00:01").is_some());
    assert!(engine.device("00:00:00:00:00:02").is_none());
    assert!(engine.device("00:00:00:00:00:03").is_some());
    assert!(engine.device("00:00:00:00:00:04").is_some());
}

#[test]
fn hidden_network_revealing_its_name_reclassifies() {
    let mut engine = engine();
    let now = Utc::now();
    let mac = [0xca, 0xfe, 0, 0, 0, 9];

    match engine.ingest_at(&beacon(mac, 2412, -60, b""), now) {
        IngestOutcome::Delta(ObservationDelta::NewDevice { classification, .. }) => {
            assert_eq!(classification, Classification::Hidden);
        }
        other => panic!("unexpected {other:?}"),
    }

    // a probe-response style beacon later reveals the SSID
    match engine.ingest_at(&beacon(mac, 2412, -60, b"backroom"), now + TimeDelta::seconds(1)) {
        IngestOutcome::Delta(ObservationDelta::Reclassified { from, to, .. }) => {
            assert_eq!(from, Classification::Hidden);
            assert_eq!(to, Classification::Unknown);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn garbage_frames_never_panic_or_create_devices() {
    let mut engine = engine();
    let inputs: Vec<Vec<u8>> = vec![
        vec![],
        vec![0xff],
        vec![0x00; 7],
        vec![0xab; 64],
        {
            // valid header, truncated MAC header
            let mut f = beacon([1, 2, 3, 4, 5, 6], 2412, -60, b"x");
            f.truncate(20);
            f
        },
    ];
    for input in &inputs {
        assert_eq!(engine.ingest(input), IngestOutcome::Dropped);
    }
    assert_eq!(engine.device_count(), 0);
    assert_eq!(
        engine
            .stats()
            .frames_dropped
            .load(std::sync::atomic::Ordering::Relaxed),
        inputs.len() as u64
    );
}

#[test]
fn allowlist_wins_over_other_rules() {
    let mut config = EngineConfig::default();
    config.allowlist.insert("0a:0b:0c:00:00:01".to_string());
    let mut engine = PacketEngine::new(config);
    let now = Utc::now();
    let mac = [0x0a, 0x0b, 0x0c, 0, 0, 1];

    // hidden SSID, but allowlisted: stays Known
    engine.ingest_at(&beacon(mac, 2412, -60, b""), now);
    assert_eq!(
        engine.device("0a:0b:0c:00:00:01").unwrap().classification,
        Classification::Known
    );
}
