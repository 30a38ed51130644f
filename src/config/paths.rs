use crate::config::ConfigError;
use std::path::PathBuf;

pub const GLOBAL_STATE_DIR: &str = ".runbridge";
pub const GLOBAL_SETTINGS_FILE_NAME: &str = "config.yaml";
pub const CONFIG_PATH_ENV: &str = "RUNBRIDGE_CONFIG";

/// `$RUNBRIDGE_CONFIG` when set, otherwise `~/.runbridge/config.yaml`.
pub fn default_global_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home)
        .join(GLOBAL_STATE_DIR)
        .join(GLOBAL_SETTINGS_FILE_NAME))
}
