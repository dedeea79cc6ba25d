//! Shared plumbing for VoltageEMS gateway services
//!
//! - [`logging`]: subscriber bootstrap with bracketed console output, optional
//!   daily rolling files and a runtime-reloadable level filter
//! - [`config`]: figment layering of defaults, config file and environment
//! - [`shutdown`]: Ctrl+C / SIGTERM wait

pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use config::{load_config, load_config_from_file};
pub use error::{CommonError, Result};
pub use logging::{get_log_level, init_with_config, set_log_level, LogConfig};
pub use shutdown::wait_for_shutdown;
