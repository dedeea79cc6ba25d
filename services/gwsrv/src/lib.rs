//! I/O Gateway Service (`gwsrv`)
//!
//! Bridges cellular/LoRaWAN I/O gateways on an MQTT broker to the
//! `voltage-iogw` protocol layer: uplink reports are decoded, validated and
//! logged as JSON; device commands run through per-device sessions.

pub mod cli;
pub mod commands;
pub mod config;
pub mod mqtt;
pub mod runtime;

pub use commands::{decode_hex, execute_command, report_json};
pub use config::GatewayConfig;
pub use runtime::{build_router, build_sessions, run, run_command, Gateway};
