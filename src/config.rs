// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration for the device trust client.
//!
//! A [`DeviceTrustConfig`] is built once at process start and passed down
//! to every component by reference. It is never mutated afterwards.

use std::time::Duration;

use url::Url;

/// Credential store name.
pub const STORE_NAME: &str = "okta.keychain";

/// Label of the unlock secret registered in the user's default keychain.
pub const SECRET_ALIAS: &str = "device_trust";

/// Reserved common name of the device certificate.
pub const COMMON_NAME: &str = "Okta MTLS";

/// Label of the scheduled renewal unit.
pub const AGENT_LABEL: &str = "com.okta.devicetrust";

/// Version reported to the CA in every request.
pub const CLIENT_VERSION: &str = "1.2.0";

/// Applications granted access to the device key by default.
pub const DEFAULT_ACCESS_PARTITIONS: &[&str] = &[
    "apple-tool:",
    "apple:",
    "teamid:UBF8T346G9",
    "teamid:EQHXZ8M8AV",
    "teamid:M683GB7CPW",
    "teamid:AL798K98FX",
    "teamid:BQR82RBBHL",
];

/// Default renewal window: renew when fewer than 30 days remain.
pub const DEFAULT_RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default interval between scheduled renewal checks (one day).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const ENROLL_PATH: &str = "api/internal/device-trust/ca/v1/enroll/macos";
const RENEW_PATH: &str = "api/internal/device-trust/ca/v1/renew/macos";
const METADATA_PATH: &str = "api/internal/v1/device-trust/metadata";

/// Device trust client configuration.
#[derive(Clone)]
pub struct DeviceTrustConfig {
    /// Organization base URL (no trailing slash).
    pub org_url: Url,

    /// One-time registration token, required only for a first enrollment.
    pub org_token: Option<String>,

    /// Applications allowed to use the device key without prompting.
    pub access_partitions: Vec<String>,

    /// Renew when the certificate expires within this window.
    pub renewal_window: Duration,

    /// Interval of the scheduled renewal unit.
    pub check_interval: Duration,

    /// HTTP request timeout. `None` keeps the HTTP client default.
    pub timeout: Option<Duration>,

    /// Trust anchors for the CA connection.
    pub trust_anchors: TrustAnchors,
}

impl std::fmt::Debug for DeviceTrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTrustConfig")
            .field("org_url", &self.org_url.as_str())
            .field("org_token", &self.org_token.as_ref().map(|_| "<redacted>"))
            .field("access_partitions", &self.access_partitions)
            .field("renewal_window", &self.renewal_window)
            .field("check_interval", &self.check_interval)
            .field("timeout", &self.timeout)
            .field("trust_anchors", &self.trust_anchors)
            .finish()
    }
}

impl DeviceTrustConfig {
    /// Create a new configuration builder.
    pub fn builder() -> DeviceTrustConfigBuilder {
        DeviceTrustConfigBuilder::default()
    }

    /// URL of the enrollment endpoint.
    pub fn enroll_url(&self) -> Url {
        self.join(ENROLL_PATH)
    }

    /// URL of the renewal endpoint.
    pub fn renew_url(&self) -> Url {
        self.join(RENEW_PATH)
    }

    /// URL of the device trust metadata endpoint.
    pub fn metadata_url(&self) -> Url {
        let mut url = self.join(METADATA_PATH);
        url.query_pairs_mut().append_pair("platform", "macos");
        url
    }

    /// Host name of the organization.
    pub fn org_domain(&self) -> &str {
        self.org_url.host_str().unwrap_or_default()
    }

    /// Parent domain of the organization (the part after the first label).
    pub fn cell(&self) -> &str {
        let domain = self.org_domain();
        match domain.find('.') {
            Some(idx) => &domain[idx + 1..],
            None => domain,
        }
    }

    /// Wildcard matching every host in the organization's cell.
    pub fn org_wildcard(&self) -> String {
        format!("*.{}", self.cell())
    }

    /// Access partitions as a comma-separated list.
    pub fn access_partition_list(&self) -> String {
        self.access_partitions.join(",")
    }

    fn join(&self, path: &str) -> Url {
        let mut url = self.org_url.clone();
        let base = self.org_url.path().trim_end_matches('/');
        url.set_path(&format!("{}/{}", base, path));
        url
    }
}

/// Normalize an organization URL: add `https://` when no scheme is given
/// and strip trailing slashes.
pub fn normalize_org_url(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{}", trimmed))
    }
}

/// Strip scheme and trailing slash from a URL-ish string, leaving the host.
pub fn domain_from_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.to_string()
}

/// Parse a comma-separated access partition list.
///
/// Empty entries are dropped; order is preserved.
pub fn parse_partition_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Builder for [`DeviceTrustConfig`].
#[derive(Default)]
pub struct DeviceTrustConfigBuilder {
    org_url: Option<Url>,
    org_token: Option<String>,
    access_partitions: Option<Vec<String>>,
    renewal_window: Option<Duration>,
    check_interval: Option<Duration>,
    timeout: Option<Duration>,
    trust_anchors: Option<TrustAnchors>,
}

impl DeviceTrustConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the organization URL. A missing scheme defaults to `https://`.
    pub fn org_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.org_url = Some(normalize_org_url(url.as_ref())?);
        Ok(self)
    }

    /// Set the one-time registration token.
    pub fn org_token(mut self, token: impl Into<String>) -> Self {
        self.org_token = Some(token.into());
        self
    }

    /// Set the access partition allow-list.
    pub fn access_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access_partitions = Some(partitions.into_iter().map(Into::into).collect());
        self
    }

    /// Set the renewal window.
    pub fn renewal_window(mut self, window: Duration) -> Self {
        self.renewal_window = Some(window);
        self
    }

    /// Set the scheduled check interval.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// Set the HTTP request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use the built-in web PKI roots for the CA connection.
    pub fn trust_webpki_roots(mut self) -> Self {
        self.trust_anchors = Some(TrustAnchors::WebPki);
        self
    }

    /// Trust only the given PEM-encoded CA certificates.
    pub fn trust_explicit(mut self, ca_certs: Vec<Vec<u8>>) -> Self {
        self.trust_anchors = Some(TrustAnchors::Explicit(ca_certs));
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<DeviceTrustConfig, &'static str> {
        let org_url = self.org_url.ok_or("organization URL is required")?;

        let check_interval = self.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        if check_interval.is_zero() {
            return Err("check interval must be greater than zero");
        }

        Ok(DeviceTrustConfig {
            org_url,
            org_token: self.org_token.filter(|t| !t.is_empty()),
            access_partitions: self.access_partitions.unwrap_or_else(|| {
                DEFAULT_ACCESS_PARTITIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            renewal_window: self.renewal_window.unwrap_or(DEFAULT_RENEWAL_WINDOW),
            check_interval,
            timeout: self.timeout,
            trust_anchors: self.trust_anchors.unwrap_or_default(),
        })
    }
}

/// Trust anchor configuration for the CA connection.
#[derive(Clone, Default)]
pub enum TrustAnchors {
    /// Built-in web PKI roots.
    #[default]
    WebPki,

    /// Explicit PEM-encoded CA certificates.
    Explicit(Vec<Vec<u8>>),
}

impl std::fmt::Debug for TrustAnchors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebPki => write!(f, "WebPki"),
            Self::Explicit(certs) => write!(f, "Explicit({} certs)", certs.len()),
        }
    }
}
