use super::{default_global_config_path, ConfigError, Settings};
use std::path::Path;

/// Loads and validates settings from `path`.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = Settings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Loads the global settings file, falling back to defaults when it does not
/// exist yet.
pub fn load_global_settings() -> Result<Settings, ConfigError> {
    let path = default_global_config_path()?;
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    load_settings(&path)
}
