//! Settings file discovery.

use std::path::{Path, PathBuf};

use crate::error::{DeviceTrustError, Result};

use super::file::Settings;

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV_VAR: &str = "OKTA_DEVICE_TRUST_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/Library/Application Support/Okta/device-trust.toml";

/// Locates and parses the settings file.
///
/// Lookup order: explicit path, [`CONFIG_ENV_VAR`], then the system-wide
/// location. An explicit path or environment override that does not exist
/// is an error; an absent system file is not.
#[derive(Debug, Clone, Default)]
pub struct SettingsLoader {
    explicit_path: Option<PathBuf>,
    search_paths: Option<Vec<PathBuf>>,
}

impl SettingsLoader {
    /// Create a loader with the default search locations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use only the given file.
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Replace the default search locations.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = Some(paths);
        self
    }

    /// Load settings, falling back to defaults when no file is present.
    pub fn load(&self) -> Result<Settings> {
        match self.find_settings_file()? {
            Some(path) => {
                tracing::debug!("loading settings from {}", path.display());
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    DeviceTrustError::config(format!("failed to read {}: {e}", path.display()))
                })?;
                let settings = Settings::from_toml(&content)?;
                settings.validate()?;
                Ok(settings)
            }
            None => Ok(Settings::default()),
        }
    }

    /// Find the settings file to use, if any.
    pub fn find_settings_file(&self) -> Result<Option<PathBuf>> {
        if let Some(ref path) = self.explicit_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(DeviceTrustError::config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(DeviceTrustError::config(format!(
                "settings file from {CONFIG_ENV_VAR} not found: {env_path}"
            )));
        }

        Ok(self.search_paths().into_iter().find(|p| p.exists()))
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        match self.search_paths {
            Some(ref paths) => paths.clone(),
            None => vec![PathBuf::from(SYSTEM_CONFIG_PATH)],
        }
    }
}
