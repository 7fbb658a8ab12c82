use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::Credentials;
use crate::config::config_root;
use crate::error::AppError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthEntry {
    auth: String,
}

/// Registry logins persisted in a Docker-style `auths` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

impl CredentialStore {
    pub fn load() -> Result<Self, AppError> {
        let path = credentials_file_path()?;
        if !path.exists() {
            return Ok(CredentialStore::default());
        }
        let contents = fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(CredentialStore::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self) -> Result<(), AppError> {
        let path = credentials_file_path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        restrict_permissions(&path)?;
        debug!(path = %path.display(), "saved credentials");
        Ok(())
    }

    pub fn get(&self, registry: &str) -> Result<Option<Credentials>, AppError> {
        self.auths.get(registry).map(|entry| Credentials::decode(&entry.auth)).transpose()
    }

    pub fn insert(&mut self, registry: &str, credentials: &Credentials) {
        self.auths.insert(registry.to_string(), AuthEntry { auth: credentials.encode() });
    }

    pub fn remove(&mut self, registry: &str) -> bool {
        self.auths.remove(registry).is_some()
    }

    pub fn registries(&self) -> impl Iterator<Item = &str> {
        self.auths.keys().map(String::as_str)
    }
}

pub fn credentials_file_path() -> Result<PathBuf, AppError> {
    Ok(config_root()?.join("credentials.json"))
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<(), AppError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<(), AppError> {
    Ok(())
}
