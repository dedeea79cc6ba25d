//! Command frame builder
//!
//! Outbound commands reuse the report envelope with their own payload
//! types. Each built frame carries the correlation key and response matcher
//! the session uses to pair it with the device's asynchronous reply.
//!
//! | command       | type   | body                                   | reply  |
//! |---------------|--------|----------------------------------------|--------|
//! | password      | `0xE1` | ASCII password                         | `0xD1` |
//! | DO control    | `0xE2` | `[output][state][pulse_ms u32 BE]`     | `0xD2` |
//! | counter reset | `0xE3` | `[counter]`                            | `0xD3` |
//! | reboot        | `0xE4` | empty                                  | `0xD4` |
//! | query         | `0xE5` | `[sub-code]`                           | `0xD5` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytes::encode_upper;
use crate::channel::{Value, COUNTER_COUNT};
use crate::envelope::{encode_frame, parse_envelope, Envelope};
use crate::error::BuildError;

/// Outbound command payload types
pub mod command_type {
    pub const PASSWORD: u8 = 0xE1;
    pub const DO_CONTROL: u8 = 0xE2;
    pub const COUNTER_RESET: u8 = 0xE3;
    pub const REBOOT: u8 = 0xE4;
    pub const QUERY: u8 = 0xE5;
}

/// Reply payload type = command payload type - RESPONSE_OFFSET
pub const RESPONSE_OFFSET: u8 = 0x10;

/// Digital outputs on the device
pub const OUTPUT_COUNT: u8 = 2;

pub const MAX_PASSWORD_LEN: usize = 32;

/// Status byte of an accepted command
pub const STATUS_OK: u8 = 0x00;

// ============================================================================
// Command vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Password,
    DoControl,
    CounterReset,
    Reboot,
    Query,
}

impl CommandType {
    pub fn code(&self) -> u8 {
        match self {
            Self::Password => command_type::PASSWORD,
            Self::DoControl => command_type::DO_CONTROL,
            Self::CounterReset => command_type::COUNTER_RESET,
            Self::Reboot => command_type::REBOOT,
            Self::Query => command_type::QUERY,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            command_type::PASSWORD => Some(Self::Password),
            command_type::DO_CONTROL => Some(Self::DoControl),
            command_type::COUNTER_RESET => Some(Self::CounterReset),
            command_type::REBOOT => Some(Self::Reboot),
            command_type::QUERY => Some(Self::Query),
            _ => None,
        }
    }

    /// Payload type of the device's reply
    pub fn response_code(&self) -> u8 {
        self.code() - RESPONSE_OFFSET
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "auth-ack",
            Self::DoControl => "do-control",
            Self::CounterReset => "counter-reset",
            Self::Reboot => "reboot",
            Self::Query => "query",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested digital output state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    Open,
    Close,
}

impl OutputState {
    pub fn code(&self) -> u8 {
        match self {
            Self::Open => 0x00,
            Self::Close => 0x01,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Open),
            0x01 => Some(Self::Close),
            _ => None,
        }
    }
}

impl FromStr for OutputState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "off" | "0" => Ok(Self::Open),
            "close" | "closed" | "on" | "1" => Ok(Self::Close),
            other => Err(format!("invalid output state '{}'", other)),
        }
    }
}

/// Parameters readable with the query command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryParam {
    Signal,
    SerialNumber,
    HardwareVersion,
    FirmwareVersion,
}

impl QueryParam {
    pub fn code(&self) -> u8 {
        match self {
            Self::Signal => 0x01,
            Self::SerialNumber => 0x02,
            Self::HardwareVersion => 0x03,
            Self::FirmwareVersion => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Signal),
            0x02 => Some(Self::SerialNumber),
            0x03 => Some(Self::HardwareVersion),
            0x04 => Some(Self::FirmwareVersion),
            _ => None,
        }
    }
}

impl FromStr for QueryParam {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "signal" => Ok(Self::Signal),
            "serial" | "serial-number" => Ok(Self::SerialNumber),
            "hardware" | "hardware-version" | "hw" => Ok(Self::HardwareVersion),
            "firmware" | "firmware-version" | "fw" => Ok(Self::FirmwareVersion),
            other => Err(format!("invalid query parameter '{}'", other)),
        }
    }
}

/// A command with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Password {
        password: String,
    },
    SetOutput {
        output: u8,
        state: OutputState,
        /// `None` latches the output
        pulse: Option<Duration>,
    },
    ResetCounter {
        counter: u8,
    },
    Reboot,
    Query(QueryParam),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Password { .. } => CommandType::Password,
            Command::SetOutput { .. } => CommandType::DoControl,
            Command::ResetCounter { .. } => CommandType::CounterReset,
            Command::Reboot => CommandType::Reboot,
            Command::Query(_) => CommandType::Query,
        }
    }

    /// Correlation signature of this command
    pub fn correlation_key(&self) -> CorrelationKey {
        let sub = match self {
            Command::SetOutput { output, .. } => Some(*output),
            Command::ResetCounter { counter } => Some(*counter),
            Command::Query(param) => Some(param.code()),
            Command::Password { .. } | Command::Reboot => None,
        };
        CorrelationKey {
            command: self.command_type(),
            sub,
        }
    }

    /// Validate parameters and encode the command body
    fn encode_body(&self) -> Result<Vec<u8>, BuildError> {
        match self {
            Command::Password { password } => {
                if password.is_empty() {
                    return Err(BuildError::MissingPassword);
                }
                if password.len() > MAX_PASSWORD_LEN {
                    return Err(BuildError::InvalidPassword(format!(
                        "{} bytes (max {})",
                        password.len(),
                        MAX_PASSWORD_LEN
                    )));
                }
                if !password.bytes().all(|b| b.is_ascii_graphic()) {
                    return Err(BuildError::InvalidPassword(
                        "must be printable ASCII".to_string(),
                    ));
                }
                Ok(password.as_bytes().to_vec())
            },
            Command::SetOutput {
                output,
                state,
                pulse,
            } => {
                if !(1..=OUTPUT_COUNT).contains(output) {
                    return Err(BuildError::InvalidOutput(*output));
                }
                let pulse_ms = match pulse {
                    None => 0,
                    Some(d) => pulse_millis(*d)?,
                };
                let mut body = Vec::with_capacity(6);
                body.push(*output);
                body.push(state.code());
                body.extend_from_slice(&pulse_ms.to_be_bytes());
                Ok(body)
            },
            Command::ResetCounter { counter } => {
                if !(1..=COUNTER_COUNT as u8).contains(counter) {
                    return Err(BuildError::InvalidCounter(*counter));
                }
                Ok(vec![*counter])
            },
            Command::Reboot => Ok(Vec::new()),
            Command::Query(param) => Ok(vec![param.code()]),
        }
    }

    /// Recover a command from an encoded frame
    pub fn decode(frame: &[u8]) -> Result<Self, BuildError> {
        let envelope = parse_envelope(frame).map_err(|e| BuildError::Malformed(e.to_string()))?;
        Self::from_envelope(&envelope)
    }

    pub fn from_envelope(envelope: &Envelope<'_>) -> Result<Self, BuildError> {
        let command_type = CommandType::from_code(envelope.payload_type).ok_or_else(|| {
            BuildError::Malformed(format!(
                "payload type {:#04X} is not a command",
                envelope.payload_type
            ))
        })?;
        let body = envelope.body();
        let wrong_len = || {
            BuildError::Malformed(format!(
                "{} body of {} bytes",
                command_type,
                body.len()
            ))
        };

        match command_type {
            CommandType::Password => Ok(Command::Password {
                password: String::from_utf8(body.to_vec())
                    .map_err(|e| BuildError::InvalidPassword(e.to_string()))?,
            }),
            CommandType::DoControl => {
                let [output, state, p0, p1, p2, p3] = body else {
                    return Err(wrong_len());
                };
                let state = OutputState::from_code(*state).ok_or_else(|| {
                    BuildError::Malformed(format!("output state {:#04X}", state))
                })?;
                let pulse_ms = u32::from_be_bytes([*p0, *p1, *p2, *p3]);
                Ok(Command::SetOutput {
                    output: *output,
                    state,
                    pulse: (pulse_ms != 0).then(|| Duration::from_millis(u64::from(pulse_ms))),
                })
            },
            CommandType::CounterReset => match body {
                [counter] => Ok(Command::ResetCounter { counter: *counter }),
                _ => Err(wrong_len()),
            },
            CommandType::Reboot => {
                if body.is_empty() {
                    Ok(Command::Reboot)
                } else {
                    Err(wrong_len())
                }
            },
            CommandType::Query => match body {
                [code] => QueryParam::from_code(*code)
                    .map(Command::Query)
                    .ok_or_else(|| BuildError::Malformed(format!("query sub-code {:#04X}", code))),
                _ => Err(wrong_len()),
            },
        }
    }
}

fn pulse_millis(pulse: Duration) -> Result<u32, BuildError> {
    if pulse.subsec_nanos() % 1_000_000 != 0 {
        return Err(BuildError::InvalidPulse(format!(
            "{:?} is not a whole number of milliseconds",
            pulse
        )));
    }
    match u32::try_from(pulse.as_millis()) {
        Ok(0) => Err(BuildError::InvalidPulse("pulse must be non-zero".to_string())),
        Ok(ms) => Ok(ms),
        Err(_) => Err(BuildError::InvalidPulse(format!("{:?} exceeds u32 ms", pulse))),
    }
}

// ============================================================================
// Correlation
// ============================================================================

/// Key pairing a command with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CorrelationKey {
    pub command: CommandType,
    /// Output index, counter index or query sub-code
    pub sub: Option<u8>,
}

impl CorrelationKey {
    /// The password handshake key
    pub const AUTH: CorrelationKey = CorrelationKey {
        command: CommandType::Password,
        sub: None,
    };

    pub fn matcher(&self) -> ResponseMatcher {
        ResponseMatcher {
            response_type: self.command.response_code(),
            sub: self.sub,
        }
    }

    /// Interpret the body of a matched reply
    pub fn parse_response(&self, body: &[u8]) -> Result<Response, String> {
        let status_at = |idx: usize| {
            body.get(idx)
                .map(|&status| Response::Ack {
                    accepted: status == STATUS_OK,
                })
                .ok_or_else(|| format!("{} reply of {} bytes", self.command, body.len()))
        };

        match self.command {
            CommandType::Password | CommandType::Reboot => status_at(0),
            CommandType::CounterReset => status_at(1),
            CommandType::DoControl => status_at(2),
            CommandType::Query => {
                let (&code, value) = body
                    .split_first()
                    .ok_or_else(|| "empty query reply".to_string())?;
                match QueryParam::from_code(code) {
                    Some(QueryParam::Signal) => value
                        .first()
                        .map(|&csq| Response::Value(Value::Signal(csq)))
                        .ok_or_else(|| "signal reply without value".to_string()),
                    Some(_) => {
                        let text = value.strip_suffix(&[0]).unwrap_or(value);
                        Ok(Response::Value(Value::Text(
                            String::from_utf8_lossy(text).trim().to_string(),
                        )))
                    },
                    None => Err(format!("unknown query sub-code {:#04X}", code)),
                }
            },
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "{}/{}", self.command, sub),
            None => write!(f, "{}", self.command),
        }
    }
}

/// Predicate over inbound frames identifying a command's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseMatcher {
    pub response_type: u8,
    /// Required first body byte
    pub sub: Option<u8>,
}

impl ResponseMatcher {
    pub fn matches(&self, envelope: &Envelope<'_>) -> bool {
        envelope.payload_type == self.response_type
            && self
                .sub
                .is_none_or(|sub| envelope.body().first() == Some(&sub))
    }

    /// Match raw inbound bytes; malformed frames never match
    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        parse_envelope(bytes).is_ok_and(|env| self.matches(&env))
    }
}

/// Interpreted reply
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack { accepted: bool },
    Value(Value),
}

// ============================================================================
// Builder
// ============================================================================

/// A ready-to-publish command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub command: Command,
    pub command_type: CommandType,
    pub key: CorrelationKey,
    /// Encoded frame bytes
    pub payload: Vec<u8>,
    pub matcher: ResponseMatcher,
}

/// Builds command frames for one device
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    password: Option<String>,
}

impl CommandBuilder {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Build any command
    pub fn build(&self, command: Command) -> Result<CommandFrame, BuildError> {
        let body = command.encode_body()?;
        let command_type = command.command_type();
        let key = command.correlation_key();
        let payload = encode_frame(command_type.code(), &body);

        debug!("Built {} frame: {}", key, encode_upper(&payload));

        Ok(CommandFrame {
            command,
            command_type,
            key,
            payload,
            matcher: key.matcher(),
        })
    }

    /// Authentication challenge from the configured password
    pub fn password_frame(&self) -> Result<CommandFrame, BuildError> {
        let password = self
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(BuildError::MissingPassword)?;
        self.build(Command::Password { password })
    }

    pub fn set_output(
        &self,
        output: u8,
        state: OutputState,
        pulse: Option<Duration>,
    ) -> Result<CommandFrame, BuildError> {
        self.build(Command::SetOutput {
            output,
            state,
            pulse,
        })
    }

    pub fn reset_counter(&self, counter: u8) -> Result<CommandFrame, BuildError> {
        self.build(Command::ResetCounter { counter })
    }

    /// One reset frame per counter, in index order
    pub fn reset_all(&self) -> Vec<Result<CommandFrame, BuildError>> {
        (1..=COUNTER_COUNT as u8)
            .map(|counter| self.reset_counter(counter))
            .collect()
    }

    pub fn reboot(&self) -> Result<CommandFrame, BuildError> {
        self.build(Command::Reboot)
    }

    pub fn query(&self, param: QueryParam) -> Result<CommandFrame, BuildError> {
        self.build(Command::Query(param))
    }
}

// ============================================================================
// Device-side replies
// ============================================================================

/// Encode the acknowledgement a device sends for `key`
pub fn encode_ack(key: &CorrelationKey, state: Option<OutputState>, accepted: bool) -> Vec<u8> {
    let status = if accepted { STATUS_OK } else { 0x01 };
    let body = match (key.command, key.sub) {
        (CommandType::DoControl, Some(output)) => vec![
            output,
            state.unwrap_or(OutputState::Open).code(),
            status,
        ],
        (CommandType::CounterReset, Some(counter)) => vec![counter, status],
        _ => vec![status],
    };
    encode_frame(key.command.response_code(), &body)
}

/// Encode a device's reply to a query
pub fn encode_query_reply(param: QueryParam, value: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + value.len());
    body.push(param.code());
    body.extend_from_slice(value);
    encode_frame(CommandType::Query.response_code(), &body)
}
