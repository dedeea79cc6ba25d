//! Channel decoder table
//!
//! Report bodies are sequences of tagged channels:
//!
//! ```text
//! [channel_id:1][data_type:1][value: width(data_type)]
//! ```
//!
//! There is no per-channel length field, so the width comes from the data
//! type. Unknown channel ids are recorded and skipped when the width of
//! their data type is fixed. When the width cannot be known the rest of the
//! body is reported as unknown and decoding stops there. A body that ends in
//! the middle of a channel yields every channel decoded so far plus a
//! [`Truncation`] marker.
//!
//! Analog inputs are raw counts until combined with the mode of their
//! analog group (voltage, current or resistance). The mode is carried
//! forward through one decode pass by [`ModeState`].

use serde::Serialize;
use tracing::{debug, warn};

use crate::bytes::{extract_bit_u8, ByteOrder};
use crate::envelope::WireVariant;

/// Number of analog groups (mode channel + input channel pairs)
pub const ANALOG_GROUPS: usize = 2;

/// Number of pulse counters on the device
pub const COUNTER_COUNT: usize = 4;

// ============================================================================
// Data types
// ============================================================================

/// Wire data type, selects the value width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DataType {
    /// 8 input flags, bit 0 = input 1
    DigitalIn = 0x01,
    /// 8 output flags
    DigitalOut = 0x02,
    /// i16 big-endian, tenths of a degree Celsius
    Pt100Raw16 = 0x03,
    /// u32 raw count, scaled by the analog group mode
    AnalogRaw32 = 0x04,
    /// 0 voltage, 1 current, 2 resistance
    AnalogMode = 0x05,
    /// u32 pulse counter
    Counter32 = 0x06,
    /// Cellular signal quality (CSQ)
    Signal = 0x07,
    /// NUL-terminated ASCII run, bounded by the body
    DeviceInfoField = 0x08,
    /// `[len:1][len bytes]`
    ModbusBlock = 0x09,
    /// 8 flags, 1 = counter mode, 0 = status mode
    DigitalMode = 0x0A,
}

impl DataType {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::DigitalIn),
            0x02 => Some(Self::DigitalOut),
            0x03 => Some(Self::Pt100Raw16),
            0x04 => Some(Self::AnalogRaw32),
            0x05 => Some(Self::AnalogMode),
            0x06 => Some(Self::Counter32),
            0x07 => Some(Self::Signal),
            0x08 => Some(Self::DeviceInfoField),
            0x09 => Some(Self::ModbusBlock),
            0x0A => Some(Self::DigitalMode),
            _ => None,
        }
    }

    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Width of fixed-size types, `None` for variable-length ones
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::DigitalIn
            | Self::DigitalOut
            | Self::AnalogMode
            | Self::Signal
            | Self::DigitalMode => Some(1),
            Self::Pt100Raw16 => Some(2),
            Self::AnalogRaw32 | Self::Counter32 => Some(4),
            Self::DeviceInfoField | Self::ModbusBlock => None,
        }
    }

    /// Bytes this value occupies at the head of `rest`
    ///
    /// `Err(needed)` when `rest` is too short.
    fn value_width(&self, rest: &[u8]) -> Result<usize, usize> {
        match self {
            Self::DeviceInfoField => {
                if rest.is_empty() {
                    return Err(1);
                }
                Ok(rest
                    .iter()
                    .position(|&b| b == 0)
                    .map(|nul| nul + 1)
                    .unwrap_or(rest.len()))
            },
            Self::ModbusBlock => {
                let len = *rest.first().ok_or(1usize)? as usize;
                if rest.len() < 1 + len {
                    Err(1 + len)
                } else {
                    Ok(1 + len)
                }
            },
            fixed => {
                let width = fixed.fixed_width().unwrap_or(0);
                if rest.len() < width {
                    Err(width)
                } else {
                    Ok(width)
                }
            },
        }
    }
}

// ============================================================================
// Per-variant byte order overrides
// ============================================================================

/// Byte order exceptions by wire variant and data type
///
/// Everything not listed is big-endian.
pub static BYTE_ORDER_OVERRIDES: &[(WireVariant, DataType, ByteOrder)] = &[(
    WireVariant::Cellular,
    DataType::Counter32,
    ByteOrder::LittleEndian,
)];

/// Byte order for a data type on a given wire variant
pub fn byte_order_for(variant: WireVariant, data_type: DataType) -> ByteOrder {
    BYTE_ORDER_OVERRIDES
        .iter()
        .find(|(v, t, _)| *v == variant && *t == data_type)
        .map(|(_, _, order)| *order)
        .unwrap_or_default()
}

// ============================================================================
// Values
// ============================================================================

/// Eight digital flags, index 1 is bit 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigitalStates(pub u8);

impl DigitalStates {
    /// 1-based channel state; indexes outside 1..=8 are `false`
    pub fn is_set(&self, index: usize) -> bool {
        (1..=8).contains(&index) && extract_bit_u8(self.0, (index - 1) as u8)
    }

    pub fn states(&self) -> [bool; 8] {
        std::array::from_fn(|i| extract_bit_u8(self.0, i as u8))
    }
}

/// Analog input electrical mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalogMode {
    Voltage,
    Current,
    Resistance,
}

impl AnalogMode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Voltage),
            1 => Some(Self::Current),
            2 => Some(Self::Resistance),
            _ => None,
        }
    }

    /// Raw count to engineering units
    pub fn scale(&self, raw: u32) -> f64 {
        match self {
            // mV -> V
            Self::Voltage => f64::from(raw) * 0.001,
            // uA -> mA
            Self::Current => f64::from(raw) * 0.001,
            // 0.1 ohm -> ohm
            Self::Resistance => f64::from(raw) * 0.1,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Voltage => "V",
            Self::Current => "mA",
            Self::Resistance => "ohm",
        }
    }
}

/// Scaled analog input
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalogReading {
    pub group: u8,
    pub raw: u32,
    pub mode: AnalogMode,
    pub value: f64,
    pub unit: &'static str,
    /// No mode channel preceded this input; voltage scaling was assumed
    pub assumed_mode: bool,
}

/// Decoded channel value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Digital(DigitalStates),
    /// Degrees Celsius
    Pt100(f64),
    Analog(AnalogReading),
    AnalogMode(AnalogMode),
    Counter(u32),
    Signal(u8),
    Text(String),
    Modbus(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

// ============================================================================
// Channel table
// ============================================================================

/// Device identity fields carried as ASCII runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceInfoField {
    SerialNumber,
    HardwareVersion,
    FirmwareVersion,
    ProtocolVersion,
    Imei,
    Imsi,
    Iccid,
}

/// What a channel means to the report decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum ChannelKind {
    Signal,
    DigitalInputMode,
    DigitalInputs,
    DigitalOutputs,
    /// Counter 1..=4
    Counter(u8),
    Pt100,
    /// Mode of analog group 1..=2
    AnalogMode(u8),
    /// Analog input of group 1..=2
    AnalogInput(u8),
    DeviceInfo(DeviceInfoField),
    Modbus,
}

/// Static decode rule for one channel id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRule {
    pub channel_id: u8,
    pub value_type: DataType,
    pub kind: ChannelKind,
    pub name: &'static str,
}

const fn rule(
    channel_id: u8,
    value_type: DataType,
    kind: ChannelKind,
    name: &'static str,
) -> ChannelRule {
    ChannelRule {
        channel_id,
        value_type,
        kind,
        name,
    }
}

/// Channel table, sorted by channel id
pub static CHANNEL_TABLE: &[ChannelRule] = &[
    rule(0x01, DataType::Signal, ChannelKind::Signal, "signal_strength"),
    rule(0x02, DataType::DigitalMode, ChannelKind::DigitalInputMode, "di_mode"),
    rule(0x03, DataType::DigitalIn, ChannelKind::DigitalInputs, "digital_inputs"),
    rule(0x04, DataType::DigitalOut, ChannelKind::DigitalOutputs, "digital_outputs"),
    rule(0x05, DataType::Counter32, ChannelKind::Counter(1), "counter_1"),
    rule(0x06, DataType::Counter32, ChannelKind::Counter(2), "counter_2"),
    rule(0x07, DataType::Counter32, ChannelKind::Counter(3), "counter_3"),
    rule(0x08, DataType::Counter32, ChannelKind::Counter(4), "counter_4"),
    rule(0x09, DataType::Pt100Raw16, ChannelKind::Pt100, "pt100"),
    rule(0x0A, DataType::AnalogMode, ChannelKind::AnalogMode(1), "analog_mode_1"),
    rule(0x0B, DataType::AnalogRaw32, ChannelKind::AnalogInput(1), "analog_1"),
    rule(0x0C, DataType::AnalogMode, ChannelKind::AnalogMode(2), "analog_mode_2"),
    rule(0x0D, DataType::AnalogRaw32, ChannelKind::AnalogInput(2), "analog_2"),
    rule(
        0x10,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::SerialNumber),
        "serial_number",
    ),
    rule(
        0x11,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::HardwareVersion),
        "hardware_version",
    ),
    rule(
        0x12,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::FirmwareVersion),
        "firmware_version",
    ),
    rule(
        0x13,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::ProtocolVersion),
        "protocol_version",
    ),
    rule(
        0x14,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::Imei),
        "imei",
    ),
    rule(
        0x15,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::Imsi),
        "imsi",
    ),
    rule(
        0x16,
        DataType::DeviceInfoField,
        ChannelKind::DeviceInfo(DeviceInfoField::Iccid),
        "iccid",
    ),
    rule(0x20, DataType::ModbusBlock, ChannelKind::Modbus, "modbus"),
];

/// Look up the rule for a channel id
pub fn lookup(channel_id: u8) -> Option<&'static ChannelRule> {
    CHANNEL_TABLE
        .binary_search_by_key(&channel_id, |r| r.channel_id)
        .ok()
        .map(|idx| &CHANNEL_TABLE[idx])
}

/// Most recently seen mode per analog group, scoped to one decode pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeState {
    modes: [Option<AnalogMode>; ANALOG_GROUPS],
}

impl ModeState {
    fn slot(group: u8) -> Option<usize> {
        let idx = usize::from(group).checked_sub(1)?;
        (idx < ANALOG_GROUPS).then_some(idx)
    }

    pub fn get(&self, group: u8) -> Option<AnalogMode> {
        Self::slot(group).and_then(|i| self.modes[i])
    }

    pub fn set(&mut self, group: u8, mode: AnalogMode) {
        if let Some(i) = Self::slot(group) {
            self.modes[i] = Some(mode);
        }
    }
}

impl ChannelRule {
    /// Decode this channel's value bytes
    ///
    /// `raw` must be exactly the value width. Returns `None` when it is not,
    /// or when the bytes are not a valid value for the rule (e.g. an
    /// undefined analog mode).
    pub(crate) fn decode(
        &self,
        raw: &[u8],
        order: ByteOrder,
        modes: &mut ModeState,
    ) -> Option<Value> {
        if self.value_type.value_width(raw) != Ok(raw.len()) {
            return None;
        }
        let value = match self.value_type {
            DataType::DigitalIn | DataType::DigitalOut | DataType::DigitalMode => {
                Value::Digital(DigitalStates(raw[0]))
            },
            DataType::Signal => Value::Signal(raw[0]),
            DataType::Pt100Raw16 => {
                let tenths = i16::from_be_bytes([raw[0], raw[1]]);
                Value::Pt100(f64::from(tenths) / 10.0)
            },
            DataType::Counter32 => Value::Counter(order.read_u32([raw[0], raw[1], raw[2], raw[3]])),
            DataType::AnalogMode => {
                let ChannelKind::AnalogMode(group) = self.kind else {
                    return None;
                };
                let mode = AnalogMode::from_u8(raw[0])?;
                modes.set(group, mode);
                Value::AnalogMode(mode)
            },
            DataType::AnalogRaw32 => {
                let ChannelKind::AnalogInput(group) = self.kind else {
                    return None;
                };
                let raw = order.read_u32([raw[0], raw[1], raw[2], raw[3]]);
                let (mode, assumed_mode) = match modes.get(group) {
                    Some(mode) => (mode, false),
                    None => (AnalogMode::Voltage, true),
                };
                Value::Analog(AnalogReading {
                    group,
                    raw,
                    mode,
                    value: mode.scale(raw),
                    unit: mode.unit(),
                    assumed_mode,
                })
            },
            DataType::DeviceInfoField => {
                let text = raw.strip_suffix(&[0]).unwrap_or(raw);
                Value::Text(String::from_utf8_lossy(text).trim().to_string())
            },
            DataType::ModbusBlock => Value::Modbus(raw[1..].to_vec()),
        };
        Some(value)
    }
}

// ============================================================================
// Decode pass
// ============================================================================

/// One decoded channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEntry {
    pub channel_id: u8,
    pub kind: ChannelKind,
    pub value: Value,
}

/// A channel the table could not decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnknownChannel {
    pub channel_id: u8,
    pub data_type: u8,
    /// Offset of the channel id within the body
    pub offset: usize,
    /// Bytes skipped, including the id and type bytes
    pub skipped: usize,
}

/// Where the body ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Truncation {
    pub channel_id: u8,
    pub offset: usize,
    pub needed: usize,
    pub available: usize,
}

/// Result of walking a channel body
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelDecode {
    pub entries: Vec<ChannelEntry>,
    pub unknown: Vec<UnknownChannel>,
    pub truncated: Option<Truncation>,
}

impl ChannelDecode {
    /// Entries plus unknown channels, i.e. channel headers seen
    pub fn channels_seen(&self) -> usize {
        self.entries.len() + self.unknown.len()
    }

    pub fn is_complete(&self) -> bool {
        self.truncated.is_none() && self.unknown.is_empty()
    }
}

/// Decode a body of official-format channels
pub fn decode_channels(body: &[u8]) -> ChannelDecode {
    decode_channels_for(body, WireVariant::Official)
}

/// Decode a body of channels using the byte order rules of `variant`
pub fn decode_channels_for(body: &[u8], variant: WireVariant) -> ChannelDecode {
    let mut out = ChannelDecode::default();
    let mut modes = ModeState::default();
    let mut offset = 0usize;

    while offset < body.len() {
        let channel_id = body[offset];
        let Some(&type_byte) = body.get(offset + 1) else {
            out.truncated = Some(Truncation {
                channel_id,
                offset,
                needed: 2,
                available: 1,
            });
            break;
        };
        let rest = &body[offset + 2..];
        let data_type = DataType::from_u8(type_byte);

        // Width is a property of the data type; a missing type stops the pass
        let Some(data_type) = data_type else {
            warn!(
                "Channel {:02X} has unknown data type {:02X} at offset {}, dropping {} bytes",
                channel_id,
                type_byte,
                offset,
                body.len() - offset
            );
            out.unknown.push(UnknownChannel {
                channel_id,
                data_type: type_byte,
                offset,
                skipped: body.len() - offset,
            });
            break;
        };

        let rule = lookup(channel_id).filter(|r| r.value_type == data_type);
        if rule.is_none() && data_type.fixed_width().is_none() {
            warn!(
                "Unknown variable-length channel {:02X} at offset {}, dropping {} bytes",
                channel_id,
                offset,
                body.len() - offset
            );
            out.unknown.push(UnknownChannel {
                channel_id,
                data_type: type_byte,
                offset,
                skipped: body.len() - offset,
            });
            break;
        }

        let width = match data_type.value_width(rest) {
            Ok(width) => width,
            Err(needed) => {
                debug!(
                    "Channel {:02X} truncated at offset {}: need {}, have {}",
                    channel_id,
                    offset,
                    needed,
                    rest.len()
                );
                if rule.is_none() {
                    out.unknown.push(UnknownChannel {
                        channel_id,
                        data_type: type_byte,
                        offset,
                        skipped: body.len() - offset,
                    });
                }
                out.truncated = Some(Truncation {
                    channel_id,
                    offset,
                    needed,
                    available: rest.len(),
                });
                break;
            },
        };
        let raw = &rest[..width];

        let decoded = rule.and_then(|r| {
            r.decode(raw, byte_order_for(variant, data_type), &mut modes)
                .map(|value| ChannelEntry {
                    channel_id,
                    kind: r.kind,
                    value,
                })
        });
        match decoded {
            Some(entry) => out.entries.push(entry),
            None => {
                debug!(
                    "Skipping channel {:02X} type {:02X} ({} bytes)",
                    channel_id,
                    type_byte,
                    width + 2
                );
                out.unknown.push(UnknownChannel {
                    channel_id,
                    data_type: type_byte,
                    offset,
                    skipped: width + 2,
                });
            },
        }

        offset += 2 + width;
    }

    out
}
