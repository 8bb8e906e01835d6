//! Configuration loading from `iopmesh.toml` with defaults.
//!
//! A missing or malformed file never fails startup: the loader logs and falls
//! back to [`EngineConfig::default`]. Environment variables are applied last.

use iopmesh_types::config::EngineConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Overrides `agent_name`.
pub const ENV_AGENT_NAME: &str = "IOPMESH_AGENT_NAME";
/// Overrides `listen_addr`.
pub const ENV_LISTEN_ADDR: &str = "IOPMESH_LISTEN_ADDR";

/// Load engine configuration from a TOML file, with defaults.
///
/// When `path` is `None` the file `iopmesh.toml` in the working directory is
/// tried.
pub fn load_config(path: Option<&Path>) -> EngineConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                    EngineConfig::default()
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
                EngineConfig::default()
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        EngineConfig::default()
    };

    apply_overrides(config, |key| std::env::var(key).ok())
}

/// Apply `IOPMESH_*` overrides looked up through `lookup`.
///
/// Unparseable values are ignored with a warning.
pub fn apply_overrides<F>(mut config: EngineConfig, lookup: F) -> EngineConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup(ENV_AGENT_NAME).filter(|n| !n.trim().is_empty()) {
        config.agent_name = name;
    }
    if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
        match addr.parse() {
            Ok(addr) => config.listen_addr = addr,
            Err(e) => warn!(error = %e, value = %addr, "Ignoring invalid {ENV_LISTEN_ADDR}"),
        }
    }
    config
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("iopmesh.toml")
}
