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

//! Protected credential storage.
//!
//! The device key and certificate live in a dedicated keychain whose unlock
//! secret is registered in the user's default keychain. Access goes through
//! the [`CredentialStore`] trait so the lifecycle logic in
//! [`CredentialManager`] can run against either the real keychain
//! ([`KeychainStore`]) or an in-memory fake ([`MemoryCredentialStore`]).
//!
//! # Example
//!
//! ```no_run
//! use okta_device_trust::store::{CredentialManager, MemoryCredentialStore};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = CredentialManager::new(MemoryCredentialStore::new());
//! let secret = manager.ensure_store()?;
//! manager.add_access_partitions(&secret, &["apple:".to_string()])?;
//! assert!(manager.current_credential().is_none());
//! # Ok(())
//! # }
//! ```

mod keychain;
mod manager;
mod memory;

pub use keychain::KeychainStore;
pub use manager::{merge_search_list, CredentialManager, CredentialStatus};
pub use memory::{MemoryCredentialStore, StoreOperation};

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

use crate::config::COMMON_NAME;
use crate::error::{DeviceTrustError, Result};
use crate::types::{Credential, IssuedCertificate};

const SECRET_LEN: usize = 40;

/// Capability interface of an OS credential store.
///
/// Methods are blocking. "Not found" is reported through `Option` or an
/// empty `Vec`; errors are reserved for operations that could not run.
pub trait CredentialStore: Send + Sync {
    /// True if the dedicated store exists.
    fn store_exists(&self) -> Result<bool>;

    /// Unlock secret registered in the default store, if any.
    fn find_unlock_secret(&self) -> Result<Option<UnlockSecret>>;

    /// Register the unlock secret in the default store.
    fn register_unlock_secret(&self, secret: &UnlockSecret) -> Result<()>;

    /// Remove the registered unlock secret. Absence is not an error.
    fn delete_unlock_secret(&self) -> Result<()>;

    /// Create the dedicated store protected by `secret`.
    fn create_store(&self, secret: &UnlockSecret) -> Result<()>;

    /// Delete the dedicated store. Absence is not an error.
    fn delete_store(&self) -> Result<()>;

    /// Disable auto-lock timeouts on the dedicated store.
    fn set_store_policy(&self) -> Result<()>;

    /// Current user search list.
    fn search_list(&self) -> Result<Vec<String>>;

    /// Replace the user search list.
    fn set_search_list(&self, entries: &[String]) -> Result<()>;

    /// Unlock the dedicated store.
    fn unlock_store(&self, secret: &UnlockSecret) -> Result<()>;

    /// Grant the listed applications access to keys in the store.
    fn set_access_partitions(&self, secret: &UnlockSecret, partitions: &[String]) -> Result<()>;

    /// Certificates in the store whose subject common name is `common_name`.
    fn find_credentials(&self, common_name: &str) -> Result<Vec<StoredCredential>>;

    /// Delete the identity (certificate and key) matching `selector`.
    fn delete_credential(&self, selector: &CredentialSelector) -> Result<()>;

    /// Import a packaged key and certificate.
    fn import_bundle(&self, secret: &UnlockSecret, bundle: &CredentialBundle) -> Result<()>;

    /// Sign `data` as CMS SignedData (SHA-256) with the identity named
    /// `common_name`, embedding the content. Returns DER.
    fn sign(&self, common_name: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// Entry that represents the dedicated store in the search list.
    fn store_name(&self) -> &str;
}

/// Random secret protecting the dedicated store.
#[derive(Clone, PartialEq, Eq)]
pub struct UnlockSecret(Zeroizing<String>);

impl UnlockSecret {
    /// Generate a new random alphanumeric secret.
    pub fn generate() -> Self {
        Self::new(random_alphanumeric(SECRET_LEN))
    }

    /// Wrap an existing secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// The secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for UnlockSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UnlockSecret(****)")
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Selects an identity to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSelector {
    /// Every identity with the given common name.
    CommonName(String),
    /// The identity whose certificate has the given SHA-1 fingerprint.
    Fingerprint(String),
}

/// A certificate found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    /// Parsed certificate.
    pub certificate: IssuedCertificate,
}

impl StoredCredential {
    /// SHA-1 fingerprint of the certificate.
    pub fn fingerprint(&self) -> &str {
        self.certificate.fingerprint()
    }

    /// Selector addressing exactly this credential.
    pub fn selector(&self) -> CredentialSelector {
        CredentialSelector::Fingerprint(self.fingerprint().to_string())
    }
}

/// Password-protected PKCS#12 bundle of a [`Credential`].
pub struct CredentialBundle {
    der: Zeroizing<Vec<u8>>,
    password: Zeroizing<String>,
    fingerprint: String,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CredentialBundle {
    /// Package a credential under a random one-time password.
    ///
    /// Consumes the credential; the private key only survives inside the
    /// encrypted bundle.
    pub fn package(credential: Credential) -> Result<Self> {
        let password = Zeroizing::new(random_alphanumeric(SECRET_LEN));
        let cert = credential.certificate.to_x509()?;

        let pkcs12 = Pkcs12::builder()
            .name(COMMON_NAME)
            .pkey(credential.key.pkey())
            .cert(&cert)
            .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .cert_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .mac_md(MessageDigest::sha256())
            .build2(&password)
            .map_err(|e| DeviceTrustError::store(format!("PKCS#12 packaging failed: {e}")))?;
        let der = pkcs12
            .to_der()
            .map_err(|e| DeviceTrustError::store(format!("PKCS#12 encoding failed: {e}")))?;

        Ok(Self {
            der: Zeroizing::new(der),
            password,
            fingerprint: credential.certificate.fingerprint().to_string(),
        })
    }

    /// DER encoding of the bundle.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// One-time bundle password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Fingerprint of the packaged certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
