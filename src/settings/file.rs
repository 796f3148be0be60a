//! TOML settings schema.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{normalize_org_url, DeviceTrustConfig};
use crate::error::{DeviceTrustError, Result};

/// Root of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Organization settings.
    #[serde(default)]
    pub org: OrgSettings,

    /// Credential store settings.
    #[serde(default)]
    pub keychain: KeychainSettings,

    /// Renewal schedule settings.
    #[serde(default)]
    pub renewal: RenewalSettings,

    /// CA connection settings.
    #[serde(default)]
    pub tls: TlsSettings,
}

/// `[org]` section.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrgSettings {
    /// Organization URL; `https://` is assumed when no scheme is given.
    pub url: Option<String>,

    /// One-time registration token.
    pub token: Option<String>,
}

impl std::fmt::Debug for OrgSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `[keychain]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeychainSettings {
    /// Access partition allow-list. Defaults to the built-in list.
    pub access_partitions: Option<Vec<String>>,
}

/// `[renewal]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenewalSettings {
    /// Renew when fewer than this many days of validity remain.
    #[serde(default = "default_window_days")]
    pub window_days: u64,

    /// Interval of the scheduled renewal check, in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// HTTP request timeout in seconds. Unset keeps the client default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            check_interval_secs: default_check_interval(),
            timeout_secs: None,
        }
    }
}

fn default_window_days() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    86400
}

/// `[tls]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM bundle of CA certificates to trust instead of the web PKI roots.
    pub ca_bundle: Option<PathBuf>,
}

impl Settings {
    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DeviceTrustError::config(format!("invalid settings: {e}")))
    }

    /// Check the settings for consistency.
    ///
    /// A missing organization URL is not an error here: it may still be
    /// supplied on the command line.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(ref url) = self.org.url {
            match normalize_org_url(url) {
                Ok(parsed) if parsed.scheme() != "https" => {
                    errors.push("org.url must use HTTPS".to_string());
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("org.url is invalid: {e}")),
            }
        }

        if self.renewal.window_days == 0 {
            errors.push("renewal.window_days must be greater than zero".to_string());
        }
        if self.renewal.check_interval_secs == 0 {
            errors.push("renewal.check_interval_secs must be greater than zero".to_string());
        }

        if let Some(ref partitions) = self.keychain.access_partitions {
            if partitions.iter().any(|p| p.trim().is_empty()) {
                errors.push("keychain.access_partitions must not contain empty entries".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeviceTrustError::config(errors.join("; ")))
        }
    }

    /// Build the runtime configuration.
    pub fn into_config(self) -> Result<DeviceTrustConfig> {
        self.validate()?;

        let url = self
            .org
            .url
            .ok_or_else(|| DeviceTrustError::configuration_missing("organization URL"))?;

        let mut builder = DeviceTrustConfig::builder()
            .org_url(&url)
            .map_err(|e| DeviceTrustError::config(format!("invalid organization URL: {e}")))?
            .renewal_window(Duration::from_secs(self.renewal.window_days * 24 * 60 * 60))
            .check_interval(Duration::from_secs(self.renewal.check_interval_secs));

        if let Some(token) = self.org.token {
            builder = builder.org_token(token);
        }
        if let Some(partitions) = self.keychain.access_partitions {
            builder = builder.access_partitions(partitions);
        }
        if let Some(secs) = self.renewal.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(path) = self.tls.ca_bundle {
            let pem = std::fs::read(&path).map_err(|e| {
                DeviceTrustError::config(format!("failed to read {}: {e}", path.display()))
            })?;
            builder = builder.trust_explicit(vec![pem]);
        }

        builder.build().map_err(DeviceTrustError::config)
    }
}
