//! Trust preferences.
//!
//! Tells the OS which identity to present to the organization's hosts so the
//! device certificate is offered silently during mutual TLS.

use std::sync::Arc;

use crate::command::{CommandRunner, Invocation};
use crate::config::{COMMON_NAME, STORE_NAME};
use crate::error::{DeviceTrustError, Result};
use crate::identity::UserAccount;

/// Hosts the device certificate is presented to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDomains {
    /// Certificate authentication host from the organization metadata.
    pub cert_auth_domain: Option<String>,
    /// Wildcard covering the organization's cell, e.g. `*.okta.com`.
    pub org_wildcard: String,
}

impl TrustDomains {
    /// Every domain, certificate authentication host first.
    pub fn all(&self) -> Vec<&str> {
        self.cert_auth_domain
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.org_wildcard.as_str()))
            .collect()
    }
}

/// Configures which identity is presented to the trust domains.
pub trait TrustPreferences {
    /// Prefer the device identity for `domains`.
    fn configure(&self, domains: &TrustDomains) -> Result<()>;

    /// Remove the preferences set by [`configure`](Self::configure).
    /// Absence is not an error.
    fn reset(&self, domains: &TrustDomains) -> Result<()>;
}

/// Identity preferences in the user's keychain (used by Safari and other
/// system TLS clients).
pub struct IdentityPreferences {
    runner: Arc<dyn CommandRunner>,
    account: UserAccount,
}

impl IdentityPreferences {
    /// Preferences of `account`.
    pub fn new(runner: Arc<dyn CommandRunner>, account: UserAccount) -> Self {
        Self { runner, account }
    }

    fn security(&self) -> Invocation {
        Invocation::new("security").as_user(self.account.run_as())
    }
}

impl TrustPreferences for IdentityPreferences {
    fn configure(&self, domains: &TrustDomains) -> Result<()> {
        tracing::info!("Configuring identity preferences for {}", domains.all().join(", "));
        for domain in domains.all() {
            let output = self.runner.run(
                &self
                    .security()
                    .args(["set-identity-preference", "-c", COMMON_NAME, "-s", domain, STORE_NAME]),
            )?;
            if !output.is_success() {
                return Err(DeviceTrustError::store(format!(
                    "set-identity-preference for {} failed ({})",
                    domain,
                    output.describe_failure()
                )));
            }
        }
        Ok(())
    }

    fn reset(&self, domains: &TrustDomains) -> Result<()> {
        for domain in domains.all() {
            match self
                .runner
                .run(&self.security().args(["set-identity-preference", "-n", "-s", domain]))
            {
                Ok(output) if !output.is_success() => tracing::debug!(
                    "identity preference for {} not reset: {}",
                    domain,
                    output.describe_failure()
                ),
                Ok(_) => {}
                Err(e) => tracing::debug!("identity preference for {} not reset: {}", domain, e),
            }
        }
        Ok(())
    }
}
