//! Report Decoding Integration Tests
//!
//! End-to-end decoding of complete frames:
//! - Regular report with every fixed-width channel kind
//! - Unknown channels skipped or ending the pass
//! - Wire variant equivalence (official / legacy hex)
//! - Truncation and malformed input handling

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use voltage_iogw::channel::decode_channels;
use voltage_iogw::envelope::{encode_frame_with, PROTOCOL_VERSION};
use voltage_iogw::report::payload_type;
use voltage_iogw::{
    decode, validate, AnalogMode, DecodeError, ReportBody, ReportType, Value, WireVariant,
};

/// Regular report: signal, DI, DO, counter 1, PT100, analog group 1, Modbus
const REGULAR_BODY: [u8; 32] = [
    0x01, 0x07, 0x1A, // signal 26
    0x03, 0x01, 0x05, // DI 1 and 3
    0x04, 0x02, 0x01, // DO 1
    0x05, 0x06, 0x00, 0x00, 0x00, 0x0A, // counter 1 = 10
    0x09, 0x03, 0x00, 0xFA, // PT100 25.0
    0x0A, 0x05, 0x00, // analog group 1: voltage
    0x0B, 0x04, 0x00, 0x00, 0x13, 0x88, // 5000 mV
    0x20, 0x09, 0x01, 0x64, // Modbus block [0x64]
];

fn regular_frame() -> Vec<u8> {
    let mut frame = vec![0x7E, 0xF4, 0x00, 0x20, 0x01];
    frame.extend_from_slice(&REGULAR_BODY);
    frame.push(0x7E);
    frame
}

// ============================================================================
// Complete frames
// ============================================================================

#[test]
fn test_regular_report_scenario() {
    let report = decode("GW-0001", &regular_frame()).unwrap();

    assert_eq!(report.report_type(), ReportType::Regular);
    assert_eq!(report.variant, WireVariant::Official);
    assert_eq!(report.version, 0x01);
    assert_eq!(report.channel_count, 8);
    assert!(report.unknown_channels.is_empty());
    assert!(report.truncated.is_none());

    let ReportBody::Regular(regular) = &report.body else {
        panic!("expected regular report, got {:?}", report.body);
    };
    let inputs = regular.digital_inputs.unwrap();
    assert!(inputs.is_set(1));
    assert!(!inputs.is_set(2));
    assert!(inputs.is_set(3));
    assert_eq!(regular.signal_strength, Some(26));
    assert!(regular.digital_outputs.unwrap().is_set(1));
    assert_eq!(regular.counters, [Some(10), None, None, None]);
    assert_eq!(regular.pt100, Some(25.0));
    assert_eq!(regular.modbus, Some(vec![0x64]));

    let analog = &regular.analog_inputs[0];
    assert_eq!(analog.mode, AnalogMode::Voltage);
    assert!(!analog.assumed_mode);
    assert!((analog.value - 5.0).abs() < 1e-9);
    assert_eq!(analog.unit, "V");

    assert!(validate(&report).valid);
}

#[test]
fn test_unknown_channels_in_full_report() {
    let body = [
        0x7F, 0x06, 0xDE, 0xAD, 0xBE, 0xEF, // unknown id, counter width
        0x01, 0x07, 0x1A, // signal 26
        0x05, 0x06, 0x00, 0x00, 0x00, 0x0A, // counter 1 = 10
    ];
    let frame = encode_frame_with(
        WireVariant::Official,
        payload_type::REGULAR,
        PROTOCOL_VERSION,
        &body,
    );
    let report = decode("GW-0001", &frame).unwrap();

    assert_eq!(report.channel_count, 2);
    assert_eq!(report.unknown_channels.len(), 1);
    assert_eq!(report.unknown_channels[0].channel_id, 0x7F);
    assert_eq!(report.unknown_channels[0].offset, 0);
    assert_eq!(report.unknown_channels[0].skipped, 6);
    assert!(report.truncated.is_none());
    let ReportBody::Regular(regular) = &report.body else {
        panic!("expected regular report, got {:?}", report.body);
    };
    assert_eq!(regular.signal_strength, Some(26));
    assert_eq!(regular.counters[0], Some(10));

    // An undefined data type has no width, so nothing after it is read
    let body = [
        0x01, 0x07, 0x1A, // signal 26
        0x7F, 0xEE, 0x01, 0x02, // unknown type
        0x05, 0x06, 0x00, 0x00, 0x00, 0x0A,
    ];
    let frame = encode_frame_with(
        WireVariant::Official,
        payload_type::REGULAR,
        PROTOCOL_VERSION,
        &body,
    );
    let report = decode("GW-0001", &frame).unwrap();

    assert_eq!(report.channel_count, 1);
    assert_eq!(report.unknown_channels[0].data_type, 0xEE);
    assert_eq!(report.unknown_channels[0].skipped, body.len() - 3);
    let ReportBody::Regular(regular) = &report.body else {
        panic!("expected regular report, got {:?}", report.body);
    };
    assert_eq!(regular.counters[0], None);
}

#[test]
fn test_legacy_hex_matches_official() {
    let official = decode("GW-0001", &regular_frame()).unwrap();
    let text = hex::encode_upper(regular_frame());
    let legacy = decode("GW-0001", text.as_bytes()).unwrap();

    assert_eq!(legacy.variant, WireVariant::LegacyHex);
    assert_eq!(legacy.body, official.body);
    assert_eq!(legacy.channel_count, official.channel_count);
}

#[test]
fn test_cellular_status_frame() {
    let body = [
        0x03, // three channels declared
        0x01, 0x07, 0x12, // signal 18
        0x03, 0x01, 0x02, // DI 2
        0x05, 0x06, 0x2C, 0x01, 0x00, 0x00, // counter 1 = 300, little-endian
    ];
    let frame = encode_frame_with(
        WireVariant::Cellular,
        payload_type::CELLULAR_STATUS,
        PROTOCOL_VERSION,
        &body,
    );
    let report = decode("CELL-1", &frame).unwrap();

    assert_eq!(report.variant, WireVariant::Cellular);
    assert_eq!(report.declared_channels, Some(3));
    let ReportBody::CellularStatus(status) = &report.body else {
        panic!("expected cellular status, got {:?}", report.body);
    };
    assert_eq!(status.signal_strength, Some(18));
    assert!(status.digital_inputs.unwrap().is_set(2));
    assert_eq!(status.counters[0], Some(300));
    assert!(validate(&report).valid);
}

#[test]
fn test_attribute_report_text_fields() {
    let mut body = vec![0x10, 0x08];
    body.extend_from_slice(b"SN20240001\0");
    body.extend_from_slice(&[0x12, 0x08]);
    body.extend_from_slice(b"V3.2.1\0");
    body.extend_from_slice(&[0x14, 0x08]);
    body.extend_from_slice(b"861234567890123");

    let frame = encode_frame_with(
        WireVariant::Official,
        payload_type::ATTRIBUTE,
        PROTOCOL_VERSION,
        &body,
    );
    let report = decode("GW-0002", &frame).unwrap();
    let ReportBody::Attribute(attr) = &report.body else {
        panic!("expected attribute report, got {:?}", report.body);
    };
    assert_eq!(attr.serial_number.as_deref(), Some("SN20240001"));
    assert_eq!(attr.firmware_version.as_deref(), Some("V3.2.1"));
    assert_eq!(attr.imei.as_deref(), Some("861234567890123"));
    assert!(validate(&report).valid);
}

// ============================================================================
// Truncation and malformed input
// ============================================================================

#[test]
fn test_triplets_followed_by_partial_channel() {
    // Counter channel: 2 header bytes + 4 value bytes
    let partial = [0x05, 0x06, 0x00, 0x00, 0x00];

    for n in 0..6 {
        for m in 1..partial.len() {
            let mut body = Vec::new();
            for i in 0..n {
                body.extend_from_slice(&[0x01, 0x07, i as u8]);
            }
            body.extend_from_slice(&partial[..m]);

            let decoded = decode_channels(&body);
            assert_eq!(decoded.entries.len(), n, "n={} m={}", n, m);
            let truncated = decoded.truncated.unwrap();
            assert_eq!(truncated.offset, 3 * n);
            assert!(decoded.entries.iter().all(|e| matches!(e.value, Value::Signal(_))));
        }
    }
}

#[test]
fn test_short_input_is_too_short() {
    for len in 0..6 {
        let err = decode("GW-0001", &regular_frame()[..len]).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { len, min: 6 });
    }
}

#[test]
fn test_corrupted_frames_never_panic() {
    let frame = regular_frame();

    for len in 0..=frame.len() {
        let _ = decode("GW-0001", &frame[..len]);
    }

    for idx in 0..frame.len() {
        for value in [0x00, 0x01, 0x08, 0x09, 0x16, 0x68, 0x7E, 0xFF] {
            let mut corrupted = frame.clone();
            corrupted[idx] = value;
            let _ = decode("GW-0001", &corrupted);
        }
    }
}

#[test]
fn test_length_field_disagreement() {
    let mut frame = regular_frame();
    frame[3] = 0x1F;
    assert_eq!(
        decode("GW-0001", &frame).unwrap_err(),
        DecodeError::LengthMismatch {
            declared: 31,
            actual: 32
        }
    );
}
