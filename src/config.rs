use std::fs;
use std::io::Write;
use std::path::PathBuf;

use dirs_next as dirs;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Proxy applied to every registry request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Override for the layer cache location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    /// Platform pulled when none is given on the command line, e.g. `linux/arm64/v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            proxy: None,
            cache_dir: None,
            use_cache: default_use_cache(),
            platform: None,
            timeout_secs: default_timeout(),
        }
    }
}

fn default_use_cache() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Settings {
    pub fn load() -> Result<Self, AppError> {
        let path = settings_file_path()?;
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let settings: Settings = toml::from_str(&contents)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    pub fn save(&self) -> Result<(), AppError> {
        let path = settings_file_path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(path)?;
        let contents = toml::to_string_pretty(self)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Cache directory from the settings file with `~` expanded.
    pub fn cache_dir(&self) -> Result<Option<PathBuf>, AppError> {
        match &self.cache_dir {
            Some(value) => Ok(Some(PathBuf::from(expand_home(value)?))),
            None => Ok(None),
        }
    }
}

/// Root directory for crpy's configuration files.
pub fn config_root() -> Result<PathBuf, AppError> {
    let config_root = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .ok_or_else(|| {
            AppError::config("Unable to determine configuration directory for this platform")
        })?;
    Ok(config_root.join("crpy"))
}

pub fn settings_file_path() -> Result<PathBuf, AppError> {
    Ok(config_root()?.join("config.toml"))
}

pub fn ensure_settings_file() -> Result<PathBuf, AppError> {
    let path = settings_file_path()?;
    if !path.exists() {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let default = Settings::default();
        let contents = toml::to_string_pretty(&default)?;
        fs::write(&path, contents)?;
    }
    Ok(path)
}

fn expand_home(value: &str) -> Result<String, AppError> {
    if !value.starts_with('~') {
        return Ok(value.to_string());
    }
    let home_dir = dirs::home_dir().ok_or_else(|| {
        AppError::config("Unable to expand '~' because the home directory is unknown")
    })?;
    if value == "~" {
        Ok(home_dir.display().to_string())
    } else if let Some(stripped) = value.strip_prefix("~/") {
        Ok(home_dir.join(stripped).display().to_string())
    } else {
        Ok(value.to_string())
    }
}
