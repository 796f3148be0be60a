//! Credential lifecycle on top of a [`CredentialStore`].

use std::time::SystemTime;

use super::{CredentialBundle, CredentialSelector, CredentialStore, StoredCredential, UnlockSecret};
use crate::config::COMMON_NAME;
use crate::error::{DeviceTrustError, Result};
use crate::renewal::RenewalPolicy;
use crate::types::Credential;

/// Partition every grant must include; the `security` tool itself needs it.
const REQUIRED_PARTITION: &str = "apple-tool:";

/// State of the device credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    /// No usable credential in the store.
    Absent,
    /// A credential exists and is outside the renewal window.
    Valid(StoredCredential),
    /// A credential exists but is expired or inside the renewal window.
    NeedsRenewal(StoredCredential),
}

/// Store setup, import, lookup, replacement and teardown of the device
/// credential.
pub struct CredentialManager<S> {
    store: S,
    policy: RenewalPolicy,
}

impl<S: CredentialStore> CredentialManager<S> {
    /// Manage credentials in `store` with the default renewal policy.
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RenewalPolicy::default())
    }

    /// Manage credentials in `store` with a custom renewal policy.
    pub fn with_policy(store: S, policy: RenewalPolicy) -> Self {
        Self { store, policy }
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Renewal policy in effect.
    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// Make sure the dedicated store exists, is unlocked and has its secret
    /// registered.
    ///
    /// An existing store with a registered secret is reused unchanged. A
    /// half-created store (or an orphaned secret) is removed first.
    pub fn ensure_store(&self) -> Result<UnlockSecret> {
        if self.store.store_exists()? {
            if let Some(secret) = self.store.find_unlock_secret()? {
                tracing::info!("Using existing keychain.");
                self.store.unlock_store(&secret)?;
                return Ok(secret);
            }
        }

        tracing::info!("Creating new keychain.");
        if let Err(e) = self.store.delete_store() {
            tracing::debug!("no previous keychain removed: {}", e);
        }
        if let Err(e) = self.store.delete_unlock_secret() {
            tracing::debug!("no previous keychain secret removed: {}", e);
        }

        let secret = UnlockSecret::generate();
        self.store.create_store(&secret)?;
        self.store.set_store_policy()?;

        let current = self.store.search_list()?;
        match merge_search_list(&current, self.store.store_name()) {
            Some(updated) => {
                self.store.set_search_list(&updated)?;
                tracing::info!("Okta keychain added to the keychain search list.");
            }
            None => tracing::debug!("keychain already in the search list"),
        }

        self.store.unlock_store(&secret)?;
        self.store.register_unlock_secret(&secret)?;
        Ok(secret)
    }

    /// Open an existing store for the periodic run.
    ///
    /// Returns `None` when the store or its secret is missing.
    pub fn unlock_existing(&self) -> Result<Option<UnlockSecret>> {
        if !self.store.store_exists()? {
            return Ok(None);
        }
        let Some(secret) = self.store.find_unlock_secret()? else {
            return Ok(None);
        };
        self.store.unlock_store(&secret)?;
        Ok(Some(secret))
    }

    /// Grant the allow-listed applications access to the device key.
    ///
    /// `apple-tool:` is always part of the grant.
    pub fn add_access_partitions(&self, secret: &UnlockSecret, allow_list: &[String]) -> Result<()> {
        let partitions = with_required_partition(allow_list);
        tracing::info!("Configure keychain partition: {}", partitions.join(","));
        self.store.set_access_partitions(secret, &partitions)
    }

    /// Import a new credential, replacing whatever is stored under the
    /// reserved common name.
    pub fn import_credential(&self, secret: &UnlockSecret, credential: Credential) -> Result<()> {
        match self.store.find_credentials(COMMON_NAME) {
            Ok(existing) => {
                for stale in existing {
                    if let Err(e) = self.store.delete_credential(&stale.selector()) {
                        tracing::warn!(
                            "Failed to remove existing certificate {}: {}",
                            stale.fingerprint(),
                            e
                        );
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to look up existing certificates: {}", e),
        }

        tracing::info!("Importing certificate.");
        let bundle = CredentialBundle::package(credential)?;
        self.store.unlock_store(secret)?;
        self.store.import_bundle(secret, &bundle)
    }

    /// Import `credential` and only then delete `outgoing`.
    ///
    /// The outgoing credential is untouched if the import fails or the new
    /// certificate cannot be found afterwards.
    pub fn replace_credential(
        &self,
        secret: &UnlockSecret,
        outgoing: &StoredCredential,
        credential: Credential,
    ) -> Result<()> {
        let bundle = CredentialBundle::package(credential)?;
        let incoming = bundle.fingerprint().to_string();

        self.store.unlock_store(secret)?;
        self.store.import_bundle(secret, &bundle)?;

        let present = self
            .store
            .find_credentials(COMMON_NAME)?
            .iter()
            .any(|c| c.fingerprint() == incoming);
        if !present {
            return Err(DeviceTrustError::store(format!(
                "renewed certificate {} not found after import",
                incoming
            )));
        }

        if outgoing.fingerprint() != incoming {
            self.store.delete_credential(&outgoing.selector())?;
        }
        tracing::info!("Certificate renewed ({} replaced by {}).", outgoing.fingerprint(), incoming);
        Ok(())
    }

    /// The current device credential.
    ///
    /// Fails closed: lookup errors and an empty store both yield `None`.
    /// With several candidates, the one expiring last wins.
    pub fn current_credential(&self) -> Option<StoredCredential> {
        match self.store.find_credentials(COMMON_NAME) {
            Ok(found) => found
                .into_iter()
                .max_by_key(|c| c.certificate.not_after()),
            Err(e) => {
                tracing::debug!("certificate lookup failed: {}", e);
                None
            }
        }
    }

    /// Classify the current credential at `now`.
    pub fn credential_status_at(&self, now: SystemTime) -> CredentialStatus {
        match self.current_credential() {
            None => CredentialStatus::Absent,
            Some(cred) => {
                let not_after = cred.certificate.not_after();
                if let Ok(remaining) = not_after.duration_since(now) {
                    tracing::info!(
                        "Certificate will expire in {} days",
                        remaining.as_secs() / 86400
                    );
                }
                if self.policy.needs_renewal(not_after, now) {
                    CredentialStatus::NeedsRenewal(cred)
                } else {
                    CredentialStatus::Valid(cred)
                }
            }
        }
    }

    /// Classify the current credential now.
    pub fn credential_status(&self) -> CredentialStatus {
        self.credential_status_at(SystemTime::now())
    }

    /// True if a credential exists, including one that is expired or inside
    /// the renewal window. Lookup and parse failures count as absent.
    pub fn has_valid_credential(&self) -> bool {
        !matches!(self.credential_status(), CredentialStatus::Absent)
    }

    /// True if a credential exists and is expired or inside the renewal window.
    pub fn needs_renewal(&self) -> bool {
        matches!(self.credential_status(), CredentialStatus::NeedsRenewal(_))
    }

    /// Sign `data` with the stored device key.
    pub fn sign_proof(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.store
            .sign(COMMON_NAME, data)
            .map_err(|e| match e {
                DeviceTrustError::Signing(_) => e,
                other => DeviceTrustError::signing(other.to_string()),
            })
    }

    /// Delete the dedicated store and its registered secret.
    ///
    /// Both steps run even if the first fails; absence is not an error.
    pub fn teardown(&self) -> Result<()> {
        tracing::info!("Clean up Okta keychain.");
        let store = self.store.delete_store();
        let secret = self.store.delete_unlock_secret();
        store.and(secret)
    }
}

/// Search list with `store` appended, or `None` if already present.
///
/// Entries are compared by file name so `~/Library/Keychains/okta.keychain-db`
/// matches `okta.keychain`. The order of existing entries is preserved.
pub fn merge_search_list(current: &[String], store: &str) -> Option<Vec<String>> {
    let present = current.iter().any(|entry| {
        let name = entry.rsplit('/').next().unwrap_or(entry);
        name == store || name.strip_suffix("-db") == Some(store)
    });
    if present {
        return None;
    }
    let mut updated = current.to_vec();
    updated.push(store.to_string());
    Some(updated)
}

fn with_required_partition(allow_list: &[String]) -> Vec<String> {
    let mut partitions: Vec<String> = Vec::with_capacity(allow_list.len() + 1);
    for p in allow_list {
        if !partitions.contains(p) {
            partitions.push(p.clone());
        }
    }
    if !partitions.iter().any(|p| p == REQUIRED_PARTITION) {
        partitions.push(REQUIRED_PARTITION.to_string());
    }
    partitions
}
