//! Report decoders
//!
//! The payload type byte is the only dispatch path:
//!
//! | type   | report          |
//! |--------|-----------------|
//! | `0xF2` | change (deltas) |
//! | `0xF3` | attribute       |
//! | `0xF4` | regular         |
//! | `0xF5` | cellular status |
//!
//! Decoding is pure and holds no shared state, so any number of ingestion
//! tasks may call it concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::bytes::encode_upper;
use crate::channel::{
    decode_channels_for, AnalogReading, ChannelDecode, ChannelKind, DeviceInfoField,
    DigitalStates, Truncation, UnknownChannel, Value, COUNTER_COUNT,
};
use crate::envelope::{parse_envelope, Envelope, WireVariant};
use crate::error::{DecodeError, DecodeResult};

/// Report payload types
pub mod payload_type {
    pub const CHANGE: u8 = 0xF2;
    pub const ATTRIBUTE: u8 = 0xF3;
    pub const REGULAR: u8 = 0xF4;
    pub const CELLULAR_STATUS: u8 = 0xF5;
}

/// Report discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Change,
    Attribute,
    Regular,
    CellularStatus,
}

impl ReportType {
    pub fn from_payload_type(code: u8) -> Option<Self> {
        match code {
            payload_type::CHANGE => Some(Self::Change),
            payload_type::ATTRIBUTE => Some(Self::Attribute),
            payload_type::REGULAR => Some(Self::Regular),
            payload_type::CELLULAR_STATUS => Some(Self::CellularStatus),
            _ => None,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Change => payload_type::CHANGE,
            Self::Attribute => payload_type::ATTRIBUTE,
            Self::Regular => payload_type::REGULAR,
            Self::CellularStatus => payload_type::CELLULAR_STATUS,
        }
    }
}

/// Inbound bytes with arrival metadata
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

// ============================================================================
// Report variants
// ============================================================================

/// Full periodic snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegularReport {
    pub signal_strength: Option<u8>,
    pub digital_input_mode: Option<DigitalStates>,
    pub digital_inputs: Option<DigitalStates>,
    pub digital_outputs: Option<DigitalStates>,
    pub counters: [Option<u32>; COUNTER_COUNT],
    /// Degrees Celsius
    pub pt100: Option<f64>,
    pub analog_inputs: Vec<AnalogReading>,
    /// Trailing Modbus block, raw
    pub modbus: Option<Vec<u8>>,
}

/// Deltas since the previous report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeReport {
    pub digital_input_mode: Option<DigitalStates>,
    pub digital_inputs: Option<DigitalStates>,
    pub digital_outputs: Option<DigitalStates>,
    pub counters: [Option<u32>; COUNTER_COUNT],
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.digital_input_mode.is_none()
            && self.digital_inputs.is_none()
            && self.digital_outputs.is_none()
            && self.counters.iter().all(Option::is_none)
    }
}

/// Device identity and versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeReport {
    pub serial_number: Option<String>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub protocol_version: Option<String>,
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
}

/// Cellular gateway status frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CellularStatus {
    pub signal_strength: Option<u8>,
    pub digital_inputs: Option<DigitalStates>,
    pub digital_outputs: Option<DigitalStates>,
    pub counters: [Option<u32>; COUNTER_COUNT],
}

/// Variant-specific report fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum ReportBody {
    Regular(RegularReport),
    Change(ChangeReport),
    Attribute(AttributeReport),
    CellularStatus(CellularStatus),
}

impl ReportBody {
    pub fn report_type(&self) -> ReportType {
        match self {
            ReportBody::Regular(_) => ReportType::Regular,
            ReportBody::Change(_) => ReportType::Change,
            ReportBody::Attribute(_) => ReportType::Attribute,
            ReportBody::CellularStatus(_) => ReportType::CellularStatus,
        }
    }

    /// Counter values, for variants that carry them
    pub fn counters(&self) -> Option<&[Option<u32>; COUNTER_COUNT]> {
        match self {
            ReportBody::Regular(r) => Some(&r.counters),
            ReportBody::Change(r) => Some(&r.counters),
            ReportBody::CellularStatus(r) => Some(&r.counters),
            ReportBody::Attribute(_) => None,
        }
    }

    pub fn signal_strength(&self) -> Option<u8> {
        match self {
            ReportBody::Regular(r) => r.signal_strength,
            ReportBody::CellularStatus(r) => r.signal_strength,
            _ => None,
        }
    }
}

/// One decoded frame; immutable once handed out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedReport {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub variant: WireVariant,
    pub version: u8,
    #[serde(flatten)]
    pub body: ReportBody,
    /// Channels decoded into the report
    pub channel_count: usize,
    /// Channel count announced by the frame, when the format carries one
    pub declared_channels: Option<u8>,
    pub unknown_channels: Vec<UnknownChannel>,
    pub truncated: Option<Truncation>,
}

impl DecodedReport {
    pub fn report_type(&self) -> ReportType {
        self.body.report_type()
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Channel values folded into named fields
#[derive(Default)]
struct Fields {
    signal_strength: Option<u8>,
    digital_input_mode: Option<DigitalStates>,
    digital_inputs: Option<DigitalStates>,
    digital_outputs: Option<DigitalStates>,
    counters: [Option<u32>; COUNTER_COUNT],
    pt100: Option<f64>,
    analog_inputs: Vec<AnalogReading>,
    modbus: Option<Vec<u8>>,
    info: Vec<(DeviceInfoField, String)>,
}

impl Fields {
    fn fold(decode: &ChannelDecode) -> Self {
        let mut fields = Fields::default();
        for entry in &decode.entries {
            match (entry.kind, &entry.value) {
                (ChannelKind::Signal, Value::Signal(v)) => fields.signal_strength = Some(*v),
                (ChannelKind::DigitalInputMode, Value::Digital(v)) => {
                    fields.digital_input_mode = Some(*v)
                },
                (ChannelKind::DigitalInputs, Value::Digital(v)) => fields.digital_inputs = Some(*v),
                (ChannelKind::DigitalOutputs, Value::Digital(v)) => {
                    fields.digital_outputs = Some(*v)
                },
                (ChannelKind::Counter(idx), Value::Counter(v)) => {
                    if let Some(slot) = usize::from(idx)
                        .checked_sub(1)
                        .and_then(|i| fields.counters.get_mut(i))
                    {
                        *slot = Some(*v);
                    }
                },
                (ChannelKind::Pt100, Value::Pt100(v)) => fields.pt100 = Some(*v),
                (ChannelKind::AnalogInput(_), Value::Analog(reading)) => {
                    fields.analog_inputs.push(reading.clone())
                },
                (ChannelKind::Modbus, Value::Modbus(block)) => fields.modbus = Some(block.clone()),
                (ChannelKind::DeviceInfo(field), Value::Text(text)) => {
                    fields.info.push((field, text.clone()))
                },
                // Modes are already applied to the analog readings
                (ChannelKind::AnalogMode(_), _) => {},
                (kind, value) => trace!("Unexpected value {:?} for {:?}", value, kind),
            }
        }
        fields
    }

    fn info(&self, field: DeviceInfoField) -> Option<String> {
        self.info
            .iter()
            .rev()
            .find(|(f, _)| *f == field)
            .map(|(_, text)| text.clone())
    }

    fn into_regular(self) -> RegularReport {
        RegularReport {
            signal_strength: self.signal_strength,
            digital_input_mode: self.digital_input_mode,
            digital_inputs: self.digital_inputs,
            digital_outputs: self.digital_outputs,
            counters: self.counters,
            pt100: self.pt100,
            analog_inputs: self.analog_inputs,
            modbus: self.modbus,
        }
    }

    fn into_change(self) -> ChangeReport {
        ChangeReport {
            digital_input_mode: self.digital_input_mode,
            digital_inputs: self.digital_inputs,
            digital_outputs: self.digital_outputs,
            counters: self.counters,
        }
    }

    fn into_attribute(self) -> AttributeReport {
        AttributeReport {
            serial_number: self.info(DeviceInfoField::SerialNumber),
            hardware_version: self.info(DeviceInfoField::HardwareVersion),
            firmware_version: self.info(DeviceInfoField::FirmwareVersion),
            protocol_version: self.info(DeviceInfoField::ProtocolVersion),
            imei: self.info(DeviceInfoField::Imei),
            imsi: self.info(DeviceInfoField::Imsi),
            iccid: self.info(DeviceInfoField::Iccid),
        }
    }

    fn into_cellular(self) -> CellularStatus {
        CellularStatus {
            signal_strength: self.signal_strength,
            digital_inputs: self.digital_inputs,
            digital_outputs: self.digital_outputs,
            counters: self.counters,
        }
    }
}

/// Decode a payload received now
pub fn decode(device_id: &str, payload: &[u8]) -> DecodeResult<DecodedReport> {
    decode_at(device_id, payload, Utc::now())
}

/// Decode a raw frame, stamping it with its receipt time
pub fn decode_raw(device_id: &str, frame: &RawFrame) -> DecodeResult<DecodedReport> {
    decode_at(device_id, &frame.payload, frame.received_at)
}

/// Decode a payload with an explicit timestamp
pub fn decode_at(
    device_id: &str,
    payload: &[u8],
    timestamp: DateTime<Utc>,
) -> DecodeResult<DecodedReport> {
    let envelope = parse_envelope(payload).inspect_err(|e| {
        debug!(
            "Device {} frame rejected: {} ({})",
            device_id,
            e,
            encode_upper(payload)
        )
    })?;
    decode_envelope(device_id, &envelope, timestamp)
}

/// Decode the body of an already parsed envelope
pub fn decode_envelope(
    device_id: &str,
    envelope: &Envelope<'_>,
    timestamp: DateTime<Utc>,
) -> DecodeResult<DecodedReport> {
    let report_type = ReportType::from_payload_type(envelope.payload_type)
        .ok_or(DecodeError::UnsupportedReportType(envelope.payload_type))?;

    let (declared_channels, channel_body) = match report_type {
        ReportType::CellularStatus => {
            let (&count, rest) = envelope
                .body()
                .split_first()
                .ok_or(DecodeError::Truncated {
                    offset: 0,
                    needed: 1,
                    available: 0,
                })?;
            (Some(count), rest)
        },
        _ => (None, envelope.body()),
    };

    let channels = decode_channels_for(channel_body, envelope.variant);
    let fields = Fields::fold(&channels);
    let body = match report_type {
        ReportType::Regular => ReportBody::Regular(fields.into_regular()),
        ReportType::Change => ReportBody::Change(fields.into_change()),
        ReportType::Attribute => ReportBody::Attribute(fields.into_attribute()),
        ReportType::CellularStatus => ReportBody::CellularStatus(fields.into_cellular()),
    };

    debug!(
        "Device {} decoded {:?} report: {} channels, {} unknown{}",
        device_id,
        report_type,
        channels.entries.len(),
        channels.unknown.len(),
        if channels.truncated.is_some() {
            ", truncated"
        } else {
            ""
        }
    );

    Ok(DecodedReport {
        device_id: device_id.to_string(),
        timestamp,
        variant: envelope.variant,
        version: envelope.version,
        body,
        channel_count: channels.entries.len(),
        declared_channels,
        unknown_channels: channels.unknown,
        truncated: channels.truncated,
    })
}
