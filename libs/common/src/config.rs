//! Layered configuration loading for gateway services

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CommonError, Result};

/// Nesting separator for environment keys: `GWSRV_MQTT__HOST` -> `mqtt.host`
pub const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources
///
/// Priority (highest to lowest):
/// 1. Environment variables with `env_prefix`
/// 2. Config file at `path` (YAML, TOML or JSON by extension)
/// 3. `T::default()`
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(CommonError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        figment = merge_file(figment, path)?;
    }

    figment
        .merge(Env::prefixed(env_prefix).split(ENV_SEPARATOR))
        .extract()
        .map_err(|e| CommonError::Config(format!("Failed to load configuration: {}", e)))
}

/// Load configuration from a specific file only
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    merge_file(Figment::new(), path.as_ref())?
        .extract()
        .map_err(|e| CommonError::Config(format!("Failed to load configuration from file: {}", e)))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CommonError::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(CommonError::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}
