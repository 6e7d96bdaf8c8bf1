use std::{env, path::PathBuf};

use super::schema::Settings;

/// `Settings::load` reads environment variables first (prefix `ODO__`), then
/// an optional config file, and falls back to struct defaults.
impl Settings {
    pub fn load() -> Result<Self, ::config::ConfigError> {
        let config_path = resolve_config_path();

        let mut builder = ::config::Config::builder();

        if let Some(path) = &config_path {
            builder = builder.add_source(::config::File::from(path.as_path()).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("ODO")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build()?;
        let settings: Settings = cfg.try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tracking.poll_interval_ms == 0 {
            return Err("tracking.poll_interval_ms must be >= 1".to_string());
        }
        if self.tracking.artist_retry_delay_ms == 0 {
            return Err("tracking.artist_retry_delay_ms must be >= 1".to_string());
        }
        if self.server.prod_url.trim().is_empty() || self.server.dev_url.trim().is_empty() {
            return Err("server.prod_url and server.dev_url must be set".to_string());
        }
        Ok(())
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.storage.path.clone().or_else(default_state_path)
    }
}

/// `ODO_CONFIG_PATH`, else the XDG default.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Some(p) = env::var_os("ODO_CONFIG_PATH") {
        return Some(PathBuf::from(p));
    }
    default_config_path()
}

/// `$XDG_CONFIG_HOME/odo/config.toml`, or `~/.config/odo/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let config_home = if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        Some(PathBuf::from(xdg))
    } else {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    };

    config_home.map(|d| d.join("odo").join("config.toml"))
}

/// `$XDG_DATA_HOME/odo/state.json`, or `~/.local/share/odo/state.json`.
pub fn default_state_path() -> Option<PathBuf> {
    let data_home = if let Some(xdg) = env::var_os("XDG_DATA_HOME") {
        Some(PathBuf::from(xdg))
    } else {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
    };

    data_home.map(|d| d.join("odo").join("state.json"))
}
