//! In-memory credential store.
//!
//! Behaves like the dedicated keychain closely enough to exercise the whole
//! lifecycle: it checks the unlock secret, decrypts imported bundles, and
//! produces real CMS signatures. Any operation can be made to fail to
//! exercise rollback paths.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use super::{
    CredentialBundle, CredentialSelector, CredentialStore, StoredCredential, UnlockSecret,
};
use crate::config::STORE_NAME;
use crate::csr::KeyMaterial;
use crate::error::{DeviceTrustError, Result};
use crate::types::IssuedCertificate;

/// Store operations, used for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// [`CredentialStore::store_exists`].
    StoreExists,
    /// [`CredentialStore::find_unlock_secret`].
    FindSecret,
    /// [`CredentialStore::register_unlock_secret`].
    RegisterSecret,
    /// [`CredentialStore::delete_unlock_secret`].
    DeleteSecret,
    /// [`CredentialStore::create_store`].
    CreateStore,
    /// [`CredentialStore::delete_store`].
    DeleteStore,
    /// [`CredentialStore::set_store_policy`].
    SetPolicy,
    /// [`CredentialStore::search_list`].
    SearchList,
    /// [`CredentialStore::set_search_list`].
    SetSearchList,
    /// [`CredentialStore::unlock_store`].
    Unlock,
    /// [`CredentialStore::set_access_partitions`].
    SetPartitions,
    /// [`CredentialStore::find_credentials`].
    FindCredentials,
    /// [`CredentialStore::delete_credential`].
    DeleteCredential,
    /// [`CredentialStore::import_bundle`].
    Import,
    /// [`CredentialStore::sign`].
    Sign,
}

struct Identity {
    certificate: IssuedCertificate,
    common_name: String,
    key: PKey<Private>,
}

struct Keychain {
    secret: UnlockSecret,
    unlocked: bool,
    policy_set: bool,
    partitions: Vec<String>,
    identities: Vec<Identity>,
}

#[derive(Default)]
struct State {
    keychain: Option<Keychain>,
    registered_secret: Option<UnlockSecret>,
    search_list: Vec<String>,
    failures: HashSet<StoreOperation>,
    calls: Vec<StoreOperation>,
}

/// In-memory [`CredentialStore`].
///
/// Clones share state, so a test can keep a handle while the store is
/// owned by a [`super::CredentialManager`].
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    state: Arc<Mutex<State>>,
}

impl MemoryCredentialStore {
    /// Empty store with a default search list.
    pub fn new() -> Self {
        Self::with_search_list(vec!["login.keychain-db".to_string()])
    }

    /// Empty store with the given search list.
    pub fn with_search_list(search_list: Vec<String>) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.search_list = search_list;
        }
        store
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: StoreOperation) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(op);
        }
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    /// Number of times `op` was called.
    pub fn count(&self, op: StoreOperation) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.iter().filter(|c| **c == op).count())
            .unwrap_or(0)
    }

    /// Number of identities in the dedicated store.
    pub fn credential_count(&self) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.keychain.as_ref().map(|k| k.identities.len()))
            .unwrap_or(0)
    }

    /// Partitions most recently granted.
    pub fn partitions(&self) -> Vec<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.keychain.as_ref().map(|k| k.partitions.clone()))
            .unwrap_or_default()
    }

    /// True if the store policy was applied.
    pub fn policy_applied(&self) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.keychain.as_ref().map(|k| k.policy_set))
            .unwrap_or(false)
    }

    /// Place an identity directly into the dedicated store.
    pub fn insert_identity(&self, key: KeyMaterial, certificate: IssuedCertificate) -> Result<()> {
        let x509 = certificate.to_x509()?;
        let mut state = self.lock()?;
        let keychain = state
            .keychain
            .as_mut()
            .ok_or_else(|| DeviceTrustError::store("keychain does not exist"))?;
        keychain.identities.push(Identity {
            common_name: common_name(&x509),
            certificate,
            key: key.pkey().clone(),
        });
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DeviceTrustError::store("memory store poisoned"))
    }

    fn begin(&self, op: StoreOperation) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock()?;
        state.calls.push(op);
        if state.failures.contains(&op) {
            let err = match op {
                StoreOperation::Sign => DeviceTrustError::signing("injected signing failure"),
                other => DeviceTrustError::store(format!("injected failure in {:?}", other)),
            };
            return Err(err);
        }
        Ok(state)
    }
}

fn keychain_mut(state: &mut State) -> Result<&mut Keychain> {
    state
        .keychain
        .as_mut()
        .ok_or_else(|| DeviceTrustError::store("The specified keychain could not be found."))
}

fn unlocked_mut<'a>(state: &'a mut State, secret: &UnlockSecret) -> Result<&'a mut Keychain> {
    let keychain = keychain_mut(state)?;
    if keychain.secret != *secret {
        return Err(DeviceTrustError::store("The user name or passphrase you entered is not correct."));
    }
    if !keychain.unlocked {
        return Err(DeviceTrustError::store("keychain is locked"));
    }
    Ok(keychain)
}

fn common_name(x509: &X509) -> String {
    x509.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

impl CredentialStore for MemoryCredentialStore {
    fn store_exists(&self) -> Result<bool> {
        Ok(self.begin(StoreOperation::StoreExists)?.keychain.is_some())
    }

    fn find_unlock_secret(&self) -> Result<Option<UnlockSecret>> {
        Ok(self.begin(StoreOperation::FindSecret)?.registered_secret.clone())
    }

    fn register_unlock_secret(&self, secret: &UnlockSecret) -> Result<()> {
        let mut state = self.begin(StoreOperation::RegisterSecret)?;
        if state.registered_secret.is_some() {
            return Err(DeviceTrustError::store(
                "The specified item already exists in the keychain.",
            ));
        }
        state.registered_secret = Some(secret.clone());
        Ok(())
    }

    fn delete_unlock_secret(&self) -> Result<()> {
        self.begin(StoreOperation::DeleteSecret)?.registered_secret = None;
        Ok(())
    }

    fn create_store(&self, secret: &UnlockSecret) -> Result<()> {
        let mut state = self.begin(StoreOperation::CreateStore)?;
        if state.keychain.is_some() {
            return Err(DeviceTrustError::store("A keychain with the same name already exists."));
        }
        state.keychain = Some(Keychain {
            secret: secret.clone(),
            unlocked: true,
            policy_set: false,
            partitions: Vec::new(),
            identities: Vec::new(),
        });
        Ok(())
    }

    fn delete_store(&self) -> Result<()> {
        let mut state = self.begin(StoreOperation::DeleteStore)?;
        state.keychain = None;
        state
            .search_list
            .retain(|entry| entry.rsplit('/').next() != Some(STORE_NAME));
        Ok(())
    }

    fn set_store_policy(&self) -> Result<()> {
        let mut state = self.begin(StoreOperation::SetPolicy)?;
        keychain_mut(&mut state)?.policy_set = true;
        Ok(())
    }

    fn search_list(&self) -> Result<Vec<String>> {
        Ok(self.begin(StoreOperation::SearchList)?.search_list.clone())
    }

    fn set_search_list(&self, entries: &[String]) -> Result<()> {
        self.begin(StoreOperation::SetSearchList)?.search_list = entries.to_vec();
        Ok(())
    }

    fn unlock_store(&self, secret: &UnlockSecret) -> Result<()> {
        let mut state = self.begin(StoreOperation::Unlock)?;
        let keychain = keychain_mut(&mut state)?;
        if keychain.secret != *secret {
            return Err(DeviceTrustError::store(
                "The user name or passphrase you entered is not correct.",
            ));
        }
        keychain.unlocked = true;
        Ok(())
    }

    fn set_access_partitions(&self, secret: &UnlockSecret, partitions: &[String]) -> Result<()> {
        let mut state = self.begin(StoreOperation::SetPartitions)?;
        unlocked_mut(&mut state, secret)?.partitions = partitions.to_vec();
        Ok(())
    }

    fn find_credentials(&self, common_name: &str) -> Result<Vec<StoredCredential>> {
        let state = self.begin(StoreOperation::FindCredentials)?;
        Ok(state
            .keychain
            .as_ref()
            .map(|k| {
                k.identities
                    .iter()
                    .filter(|i| i.common_name == common_name)
                    .map(|i| StoredCredential {
                        certificate: i.certificate.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_credential(&self, selector: &CredentialSelector) -> Result<()> {
        let mut state = self.begin(StoreOperation::DeleteCredential)?;
        let keychain = keychain_mut(&mut state)?;
        let before = keychain.identities.len();
        keychain.identities.retain(|i| match selector {
            CredentialSelector::CommonName(cn) => i.common_name != *cn,
            CredentialSelector::Fingerprint(fp) => !i.certificate.fingerprint().eq_ignore_ascii_case(fp),
        });
        if keychain.identities.len() == before {
            return Err(DeviceTrustError::store("The specified item could not be found in the keychain."));
        }
        Ok(())
    }

    fn import_bundle(&self, secret: &UnlockSecret, bundle: &CredentialBundle) -> Result<()> {
        let mut state = self.begin(StoreOperation::Import)?;
        let keychain = unlocked_mut(&mut state, secret)?;

        let parsed = Pkcs12::from_der(bundle.der())
            .and_then(|p| p.parse2(bundle.password()))
            .map_err(|e| DeviceTrustError::store(format!("MAC verification failed: {e}")))?;
        let (Some(key), Some(cert)) = (parsed.pkey, parsed.cert) else {
            return Err(DeviceTrustError::store("bundle is missing the key or certificate"));
        };
        let cert_key = cert.public_key()?;
        if !key.public_eq(&cert_key) {
            return Err(DeviceTrustError::store("bundle key does not match certificate"));
        }

        let certificate = IssuedCertificate::from_der(&cert.to_der()?)?;
        keychain.identities.push(Identity {
            common_name: common_name(&cert),
            certificate,
            key,
        });
        Ok(())
    }

    fn sign(&self, common_name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.begin(StoreOperation::Sign)?;
        let keychain = state
            .keychain
            .as_ref()
            .ok_or_else(|| DeviceTrustError::signing("keychain does not exist"))?;
        let identity = keychain
            .identities
            .iter()
            .filter(|i| i.common_name == common_name)
            .max_by_key(|i| i.certificate.not_after())
            .ok_or_else(|| DeviceTrustError::signing(format!("no identity named '{common_name}'")))?;

        let cert = identity.certificate.to_x509()?;
        let cms = CmsContentInfo::sign(
            Some(&cert),
            Some(&identity.key),
            None,
            Some(data),
            CMSOptions::BINARY,
        )
        .map_err(|e| DeviceTrustError::signing(format!("CMS signing failed: {e}")))?;
        cms.to_der()
            .map_err(|e| DeviceTrustError::signing(format!("CMS encoding failed: {e}")))
    }

    fn store_name(&self) -> &str {
        STORE_NAME
    }
}
