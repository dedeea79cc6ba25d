//! One-shot operations behind the CLI subcommands

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value as JsonValue};
use voltage_iogw::{
    decode, DecodedReport, PayloadValidator, Publisher, SessionManager, ValidationResult,
};

use crate::cli::DeviceCommand;

/// JSON document for one decoded report and its validation advisories
pub fn report_json(report: &DecodedReport, validation: &ValidationResult) -> JsonValue {
    json!({
        "report": report,
        "validation": validation,
    })
}

/// Decode a hex-encoded frame without a broker
pub fn decode_hex(device_id: &str, text: &str, validator: &PayloadValidator) -> Result<JsonValue> {
    let compact: String = text.split_whitespace().collect();
    let bytes = hex::decode(&compact).context("frame is not valid hex")?;
    let report = decode(device_id, &bytes)?;
    let validation = validator.validate(&report);
    Ok(report_json(&report, &validation))
}

/// Authenticate, then run `action` against `device_id`
pub async fn execute_command<P: Publisher>(
    sessions: &SessionManager<P>,
    device_id: &str,
    action: &DeviceCommand,
) -> Result<JsonValue> {
    if !sessions.authenticate(device_id).await? {
        bail!("authentication with device {} failed", device_id);
    }

    let result = match action {
        DeviceCommand::SetOutput {
            output,
            state,
            pulse_ms,
        } => {
            let pulse = pulse_ms.map(Duration::from_millis);
            let accepted = sessions
                .set_output(device_id, *output, *state, pulse)
                .await?;
            json!({
                "command": "set-output",
                "output": output,
                "state": state,
                "accepted": accepted,
            })
        },
        DeviceCommand::ResetCounter { counter } => {
            let accepted = sessions.reset_counter(device_id, *counter).await?;
            json!({ "command": "reset-counter", "counter": counter, "accepted": accepted })
        },
        DeviceCommand::ResetAll => {
            let results: Vec<JsonValue> = sessions
                .reset_all_counters(device_id)
                .await
                .into_iter()
                .enumerate()
                .map(|(i, result)| match result {
                    Ok(accepted) => json!({ "counter": i + 1, "accepted": accepted }),
                    Err(e) => json!({ "counter": i + 1, "error": e.to_string() }),
                })
                .collect();
            json!({ "command": "reset-all", "results": results })
        },
        DeviceCommand::Reboot => {
            let accepted = sessions.reboot(device_id).await?;
            json!({ "command": "reboot", "accepted": accepted })
        },
        DeviceCommand::Query { param } => {
            let value = sessions.query(device_id, *param).await?;
            json!({ "command": "query", "param": param, "value": value })
        },
    };
    Ok(result)
}
