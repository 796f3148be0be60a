//! Provisioning, periodic renewal and uninstall.
//!
//! [`Provisioner::provision`] walks the device through a fixed sequence of
//! stages. A failure at any stage removes what earlier stages created before
//! the error is returned, so a failed run never leaves a half-configured
//! device behind. The periodic run ([`Provisioner::renew_if_needed`]) never
//! rolls back: a credential that cannot be renewed stays where it is.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::client::DeviceTrustClient;
use crate::config::{DeviceTrustConfig, AGENT_LABEL};
use crate::error::{DeviceTrustError, Result, Stage};
use crate::identity::DeviceIdentity;
use crate::preferences::{TrustDomains, TrustPreferences};
use crate::renewal::is_expired;
use crate::scheduler::{ScheduledUnit, UnitScheduler};
use crate::store::{CredentialManager, CredentialStatus, CredentialStore, StoredCredential, UnlockSecret};

/// Where a provisioning run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Nothing done yet.
    Start,
    /// The dedicated store exists and is unlocked.
    StoreReady,
    /// A valid credential is in the store.
    CredentialReady,
    /// Allow-listed applications can use the key.
    PartitionsConfigured,
    /// Trust preferences point at the credential.
    BrowsersConfigured,
    /// The renewal job is installed.
    SchedulerInstalled,
    /// Provisioning finished.
    Done,
}

impl ProvisioningState {
    /// Stage entered from this state, or `None` once finished.
    pub fn next_stage(self) -> Option<Stage> {
        match self {
            ProvisioningState::Start => Some(Stage::StoreReady),
            ProvisioningState::StoreReady => Some(Stage::CredentialReady),
            ProvisioningState::CredentialReady => Some(Stage::PartitionsConfigured),
            ProvisioningState::PartitionsConfigured => Some(Stage::BrowsersConfigured),
            ProvisioningState::BrowsersConfigured => Some(Stage::SchedulerInstalled),
            ProvisioningState::SchedulerInstalled | ProvisioningState::Done => None,
        }
    }

    /// State reached once `stage` completes.
    pub fn after(stage: Stage) -> Self {
        match stage {
            Stage::StoreReady => ProvisioningState::StoreReady,
            Stage::CredentialReady => ProvisioningState::CredentialReady,
            Stage::PartitionsConfigured => ProvisioningState::PartitionsConfigured,
            Stage::BrowsersConfigured => ProvisioningState::BrowsersConfigured,
            Stage::SchedulerInstalled => ProvisioningState::SchedulerInstalled,
        }
    }
}

/// Result of a periodic renewal check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A new certificate replaced the old one.
    Renewed {
        /// Fingerprint of the certificate now in use.
        fingerprint: String,
    },
    /// The certificate is outside the renewal window.
    NotDue,
    /// The dedicated store or its secret is missing.
    NoStore,
    /// The store holds no device certificate.
    NoCredential,
}

#[derive(Default)]
struct Progress {
    secret: Option<UnlockSecret>,
    domains: Option<TrustDomains>,
}

impl Progress {
    fn secret(&self) -> Result<&UnlockSecret> {
        self.secret
            .as_ref()
            .ok_or_else(|| DeviceTrustError::store("credential store is not ready"))
    }
}

/// Drives the device credential through its lifecycle.
pub struct Provisioner<S> {
    config: DeviceTrustConfig,
    identity: DeviceIdentity,
    client: DeviceTrustClient,
    credentials: CredentialManager<S>,
    preferences: Box<dyn TrustPreferences>,
    scheduler: Box<dyn UnitScheduler>,
    program: PathBuf,
}

impl<S: CredentialStore> Provisioner<S> {
    /// Wire the components of one run together.
    ///
    /// `program` is the executable the scheduled renewal job runs.
    pub fn new(
        config: DeviceTrustConfig,
        identity: DeviceIdentity,
        credentials: CredentialManager<S>,
        preferences: Box<dyn TrustPreferences>,
        scheduler: Box<dyn UnitScheduler>,
        program: PathBuf,
    ) -> Result<Self> {
        let client = DeviceTrustClient::new(&config, &identity)?;
        Ok(Self {
            config,
            identity,
            client,
            credentials,
            preferences,
            scheduler,
            program,
        })
    }

    /// Credential manager in use.
    pub fn credentials(&self) -> &CredentialManager<S> {
        &self.credentials
    }

    /// CA client in use.
    pub fn client(&self) -> &DeviceTrustClient {
        &self.client
    }

    /// Provision the device.
    ///
    /// Rerunning on a provisioned device converges: the store and a valid
    /// credential are reused and the renewal job is replaced, not duplicated.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceTrustError::Provisioning`] naming the failed stage
    /// after everything created so far has been removed.
    pub async fn provision(&self) -> Result<()> {
        tracing::info!("Okta Device Trust provisioning for user {}.", self.identity.os_user);
        let mut progress = Progress::default();
        let mut state = ProvisioningState::Start;

        while let Some(stage) = state.next_stage() {
            tracing::debug!("entering stage: {}", stage);
            if let Err(e) = self.enter(stage, &mut progress).await {
                tracing::error!("Okta Device Trust setup failed during {}: {}", stage, e);
                let domains = progress.domains.take().unwrap_or_else(|| self.fallback_domains());
                let teardown = Teardown::new(&self.credentials, self.preferences.as_ref()).with_domains(domains);
                if let Err(cleanup) = teardown.cleanup() {
                    tracing::warn!("Cleanup after failed setup was incomplete: {}", cleanup);
                }
                return Err(DeviceTrustError::provisioning(stage, e));
            }
            state = ProvisioningState::after(stage);
        }

        tracing::debug!("provisioning finished in state {:?}", state);
        tracing::info!("This device is now successfully setup for Okta Device Trust.");
        Ok(())
    }

    async fn enter(&self, stage: Stage, progress: &mut Progress) -> Result<()> {
        match stage {
            Stage::StoreReady => {
                progress.secret = Some(self.credentials.ensure_store()?);
            }
            Stage::CredentialReady => {
                self.ensure_credential(progress.secret()?).await?;
            }
            Stage::PartitionsConfigured => {
                self.credentials
                    .add_access_partitions(progress.secret()?, &self.config.access_partitions)?;
            }
            Stage::BrowsersConfigured => {
                let domains = self.trust_domains().await?;
                progress.domains = Some(domains.clone());
                self.preferences.configure(&domains)?;
            }
            Stage::SchedulerInstalled => {
                let unit = ScheduledUnit::renewal_check(&self.config, self.program.clone());
                self.scheduler.install(&unit)?;
            }
        }
        Ok(())
    }

    /// Make sure the store holds a usable credential.
    ///
    /// A valid credential is reused. One inside the renewal window is
    /// renewed; if that fails while it is still unexpired it is kept. With
    /// no credential, or an expired one that could not be renewed, the
    /// device enrolls with the registration token.
    async fn ensure_credential(&self, secret: &UnlockSecret) -> Result<()> {
        match self.credentials.credential_status() {
            CredentialStatus::Valid(current) => {
                tracing::info!(
                    "Valid Okta Device Trust certificate {} found; skipping enrollment.",
                    current.fingerprint()
                );
                Ok(())
            }
            CredentialStatus::NeedsRenewal(current) => {
                let renewal = self.renew(secret, &current).await;
                match renewal {
                    Ok(_) => Ok(()),
                    Err(e) if !is_expired(current.certificate.not_after(), SystemTime::now()) => {
                        tracing::warn!("Certificate renewal failed, keeping the current certificate: {}", e);
                        Ok(())
                    }
                    Err(e) if self.config.org_token.is_some() => {
                        tracing::warn!("Expired certificate could not be renewed ({}); enrolling again.", e);
                        self.enroll(secret).await
                    }
                    Err(e) => Err(e),
                }
            }
            CredentialStatus::Absent => self.enroll(secret).await,
        }
    }

    async fn enroll(&self, secret: &UnlockSecret) -> Result<()> {
        let token = self
            .config
            .org_token
            .as_deref()
            .ok_or_else(|| DeviceTrustError::configuration_missing("org token is required to enroll"))?;
        let credential = self.client.enroll(&self.identity, token).await?;
        self.credentials.import_credential(secret, credential)
    }

    async fn renew(&self, secret: &UnlockSecret, current: &StoredCredential) -> Result<String> {
        let credential = self.client.renew(&self.identity, &self.credentials).await?;
        let fingerprint = credential.certificate.fingerprint().to_string();
        self.credentials.replace_credential(secret, current, credential)?;
        Ok(fingerprint)
    }

    /// Periodic run: renew the credential if it is inside the window.
    ///
    /// Nothing is deleted on failure; the current credential stays in the
    /// store for the next attempt.
    pub async fn renew_if_needed(&self) -> Result<RenewalOutcome> {
        let Some(secret) = self.credentials.unlock_existing()? else {
            tracing::warn!("Okta keychain not found; device is not provisioned.");
            return Ok(RenewalOutcome::NoStore);
        };

        let current = match self.credentials.credential_status() {
            CredentialStatus::Absent => {
                tracing::warn!("No Okta Device Trust certificate found.");
                return Ok(RenewalOutcome::NoCredential);
            }
            CredentialStatus::Valid(_) => {
                tracing::info!("Certificate renewal not required.");
                return Ok(RenewalOutcome::NotDue);
            }
            CredentialStatus::NeedsRenewal(current) => current,
        };

        let fingerprint = self.renew(&secret, &current).await.map_err(|e| {
            tracing::error!("Certificate renewal failed: {}", e);
            e
        })?;

        if let Err(e) = self
            .credentials
            .add_access_partitions(&secret, &self.config.access_partitions)
        {
            tracing::warn!("Failed to configure keychain partitions: {}", e);
        }
        match self.trust_domains().await {
            Ok(domains) => {
                if let Err(e) = self.preferences.configure(&domains) {
                    tracing::warn!("Failed to configure trust preferences: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to get server metadata: {}", e),
        }

        Ok(RenewalOutcome::Renewed { fingerprint })
    }

    /// Remove everything provisioning created, including the renewal job.
    pub async fn uninstall(&self) -> Result<()> {
        let domains = match self.trust_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                tracing::warn!("Failed to get server metadata: {}", e);
                self.fallback_domains()
            }
        };
        Teardown::new(&self.credentials, self.preferences.as_ref())
            .with_domains(domains)
            .uninstall(self.scheduler.as_ref(), AGENT_LABEL)
    }

    async fn trust_domains(&self) -> Result<TrustDomains> {
        let cert_auth_domain = self.client.fetch_metadata().await?;
        Ok(TrustDomains {
            cert_auth_domain: Some(cert_auth_domain),
            org_wildcard: self.config.org_wildcard(),
        })
    }

    fn fallback_domains(&self) -> TrustDomains {
        TrustDomains {
            cert_auth_domain: None,
            org_wildcard: self.config.org_wildcard(),
        }
    }
}

/// Removes what provisioning created.
///
/// Works without an organization URL: trust preferences are only reset for
/// the domains it is given.
pub struct Teardown<'a, S> {
    credentials: &'a CredentialManager<S>,
    preferences: &'a dyn TrustPreferences,
    domains: Option<TrustDomains>,
}

impl<'a, S: CredentialStore> Teardown<'a, S> {
    /// Teardown of `credentials` and `preferences`.
    pub fn new(credentials: &'a CredentialManager<S>, preferences: &'a dyn TrustPreferences) -> Self {
        Self {
            credentials,
            preferences,
            domains: None,
        }
    }

    /// Also reset the trust preferences of `domains`.
    pub fn with_domains(mut self, domains: TrustDomains) -> Self {
        self.domains = Some(domains);
        self
    }

    /// Reset trust preferences, then delete the store (with its partition
    /// grants and credentials) and its registered secret.
    ///
    /// Idempotent: running it on a clean device succeeds.
    pub fn cleanup(&self) -> Result<()> {
        if let Some(domains) = &self.domains {
            if let Err(e) = self.preferences.reset(domains) {
                tracing::warn!("Failed to reset trust preferences: {}", e);
            }
        }
        self.credentials.teardown()
    }

    /// [`cleanup`](Self::cleanup) plus removal of the scheduled unit `label`.
    pub fn uninstall(&self, scheduler: &dyn UnitScheduler, label: &str) -> Result<()> {
        tracing::info!("Device Trust uninstalling..");
        let cleaned = self.cleanup();
        let removed = scheduler.remove(label);
        cleaned.and(removed)
    }
}
