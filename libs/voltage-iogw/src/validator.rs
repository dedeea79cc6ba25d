//! Payload validation
//!
//! Structural and semantic checks applied after a successful decode. The
//! result is advisory: the report is never modified and the caller decides
//! whether to drop it or keep it with a warning.

use serde::{Deserialize, Serialize};

use crate::report::{DecodedReport, ReportBody};

/// CSQ value the modem reports when signal quality is unknown
pub const SIGNAL_UNKNOWN: u8 = 99;

/// Counters are non-negative 32-bit signed values on the device side
pub const COUNTER_MAX: u32 = i32::MAX as u32;

/// Validator thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Lowest plausible signal strength for the device class
    pub signal_min: u8,
    /// Highest plausible signal strength for the device class
    pub signal_max: u8,
    /// Accept CSQ 99 ("not known")
    pub allow_unknown_signal: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            signal_min: 0,
            signal_max: 31,
            allow_unknown_signal: true,
        }
    }
}

/// Outcome of validation, errors in check order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Post-decode sanity checks
#[derive(Debug, Clone, Default)]
pub struct PayloadValidator {
    config: ValidatorConfig,
}

impl PayloadValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, report: &DecodedReport) -> ValidationResult {
        let mut errors = Vec::new();

        if let Some(declared) = report.declared_channels {
            let seen = report.channel_count + report.unknown_channels.len();
            if usize::from(declared) != seen {
                errors.push(format!(
                    "declared {} channels, decoded {}",
                    declared, seen
                ));
            }
        }

        if let Some(t) = &report.truncated {
            errors.push(format!(
                "body truncated at offset {} (channel {:#04X}): need {} bytes, {} available",
                t.offset, t.channel_id, t.needed, t.available
            ));
        }

        if let Some(counters) = report.body.counters() {
            for (idx, value) in counters.iter().enumerate() {
                if let Some(v) = value {
                    if *v > COUNTER_MAX {
                        errors.push(format!(
                            "counter {} value {} outside 0..={}",
                            idx + 1,
                            v,
                            COUNTER_MAX
                        ));
                    }
                }
            }
        }

        if let Some(signal) = report.body.signal_strength() {
            let unknown_ok = self.config.allow_unknown_signal && signal == SIGNAL_UNKNOWN;
            if !unknown_ok && !(self.config.signal_min..=self.config.signal_max).contains(&signal) {
                errors.push(format!(
                    "signal strength {} outside {}..={}",
                    signal, self.config.signal_min, self.config.signal_max
                ));
            }
        }

        match &report.body {
            ReportBody::Attribute(attr) => {
                if attr.serial_number.as_deref().is_none_or(str::is_empty) {
                    errors.push("attribute report missing serial number".to_string());
                }
            },
            ReportBody::Regular(regular) => {
                if regular.digital_inputs.is_none() {
                    errors.push("regular report missing digital inputs".to_string());
                }
            },
            ReportBody::CellularStatus(status) => {
                if status.signal_strength.is_none() {
                    errors.push("cellular status missing signal strength".to_string());
                }
            },
            ReportBody::Change(change) => {
                if change.is_empty() {
                    errors.push("change report carries no deltas".to_string());
                }
            },
        }

        ValidationResult::from_errors(errors)
    }
}

/// Validate with default thresholds
pub fn validate(report: &DecodedReport) -> ValidationResult {
    PayloadValidator::default().validate(report)
}
