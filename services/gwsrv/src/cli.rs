//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use voltage_iogw::{OutputState, QueryParam};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gwsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "I/O Gateway Service",
    long_about = None
)]
pub struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "GWSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level, overrides the config file (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Validation mode - only validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the gateway service (default)
    Run,

    /// Decode one hex-encoded frame offline and print it as JSON
    Decode {
        /// Device id stamped on the report
        #[arg(short = 'd', long, default_value = "offline")]
        device: String,

        /// Frame bytes in hex; whitespace is ignored
        hex: String,
    },

    /// Send one command to a device and print the result
    Command {
        #[arg(short = 'd', long)]
        device: String,

        #[command(subcommand)]
        action: DeviceCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Drive a digital output
    SetOutput {
        /// Output index (1-2)
        output: u8,
        /// open | close
        state: OutputState,
        /// Pulse width; the output holds its state when omitted
        #[arg(long)]
        pulse_ms: Option<u64>,
    },
    /// Reset one pulse counter
    ResetCounter {
        /// Counter index (1-4)
        counter: u8,
    },
    /// Reset every pulse counter in index order
    ResetAll,
    Reboot,
    /// Read a device parameter (signal, serial, hw, fw)
    Query { param: QueryParam },
}
