use crate::ui;
use iopmesh_kernel::config::load_config;
use std::path::PathBuf;

pub fn cmd_config_show(config_path: Option<PathBuf>) {
    let mut config = load_config(config_path.as_deref());
    if !config.shared_secret.is_empty() {
        config.shared_secret = "<redacted>".to_string();
    }
    match toml::to_string_pretty(&config) {
        Ok(text) => print!("{text}"),
        Err(e) => ui::fail(&format!("Cannot render configuration: {e}")),
    }
}
