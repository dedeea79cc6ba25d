//! I/O Gateway Service entry point

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use gwsrv::cli::{Args, Commands};
use gwsrv::{decode_hex, run, run_command, GatewayConfig};
use voltage_iogw::PayloadValidator;

const SERVICE_NAME: &str = "gwsrv";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        GatewayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let command = args.command.unwrap_or(Commands::Run);

    let mut log_config = config.log_config(SERVICE_NAME);
    match (&args.log_level, &command) {
        (Some(level), _) => log_config.level = level.clone(),
        // Keep one-shot output readable
        (None, Commands::Decode { .. } | Commands::Command { .. }) => {
            log_config.level = "warn".to_string();
        },
        (None, Commands::Run) => {},
    }
    common::init_with_config(log_config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    match command {
        Commands::Run => {
            info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
            run(config).await
        },
        Commands::Decode { device, hex } => {
            let validator = PayloadValidator::new(config.validation.clone());
            let doc = decode_hex(&device, &hex, &validator)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        },
        Commands::Command { device, action } => {
            let doc = run_command(config, &device, &action).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        },
    }
}
