//! macOS keychain adapter over the `security` command line tool.
//!
//! All commands run in the console user's context so they operate on the
//! user's keychains even when the binary is started by an MDM as root.

use std::path::PathBuf;
use std::sync::Arc;

use super::{
    CredentialBundle, CredentialSelector, CredentialStore, StoredCredential, UnlockSecret,
};
use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::config::{SECRET_ALIAS, STORE_NAME};
use crate::error::{DeviceTrustError, Result};
use crate::identity::UserAccount;
use crate::types::IssuedCertificate;

const SECURITY: &str = "security";
const PEM_END: &str = "-----END CERTIFICATE-----";
const NOT_FOUND: &str = "could not be found";

/// [`CredentialStore`] backed by the user's `okta.keychain`.
pub struct KeychainStore {
    runner: Arc<dyn CommandRunner>,
    account: UserAccount,
}

impl KeychainStore {
    /// Adapter for `account`'s keychains.
    pub fn new(runner: Arc<dyn CommandRunner>, account: UserAccount) -> Self {
        Self { runner, account }
    }

    /// Path of the dedicated keychain.
    pub fn keychain_path(&self) -> PathBuf {
        self.account.keychains_dir().join(STORE_NAME)
    }

    fn security(&self) -> Invocation {
        Invocation::new(SECURITY).as_user(self.account.run_as())
    }

    fn run(&self, invocation: Invocation) -> Result<CommandOutput> {
        self.runner.run(&invocation)
    }

    fn run_checked(&self, invocation: Invocation, what: &str) -> Result<CommandOutput> {
        let output = self.run(invocation)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(DeviceTrustError::store(format!(
                "{} failed ({})",
                what,
                output.describe_failure()
            )))
        }
    }

    fn tolerant(&self, invocation: Invocation, what: &str) {
        match self.run(invocation) {
            Ok(output) if !output.is_success() => {
                tracing::debug!("{} skipped: {}", what, output.describe_failure())
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("{} skipped: {}", what, e),
        }
    }

    /// Private scratch directory in the user's home, owned by the user.
    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix(".okta-device-trust-")
            .tempdir_in(&self.account.home)?;
        self.account.take_ownership(dir.path())?;
        Ok(dir)
    }
}

impl CredentialStore for KeychainStore {
    fn store_exists(&self) -> Result<bool> {
        let output = self.run(self.security().arg("show-keychain-info").arg(STORE_NAME))?;
        if !output.is_success() {
            tracing::debug!("Okta keychain does not exist.");
        }
        Ok(output.is_success())
    }

    fn find_unlock_secret(&self) -> Result<Option<UnlockSecret>> {
        let output = self.run(
            self.security()
                .args(["find-generic-password", "-l", SECRET_ALIAS, "-w"])
                .quiet_output(),
        )?;
        if !output.is_success() {
            tracing::debug!("Okta password does not exist.");
            return Ok(None);
        }
        Ok(output
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(UnlockSecret::new))
    }

    fn register_unlock_secret(&self, secret: &UnlockSecret) -> Result<()> {
        self.run_checked(
            self.security()
                .args([
                    "add-generic-password",
                    "-a",
                    SECRET_ALIAS,
                    "-l",
                    SECRET_ALIAS,
                    "-s",
                    SECRET_ALIAS,
                    "-A",
                    "-w",
                ])
                .secret_arg(secret.expose()),
            "add-generic-password",
        )?;
        Ok(())
    }

    fn delete_unlock_secret(&self) -> Result<()> {
        self.tolerant(
            self.security()
                .args(["delete-generic-password", "-l", SECRET_ALIAS]),
            "delete-generic-password",
        );
        Ok(())
    }

    fn create_store(&self, secret: &UnlockSecret) -> Result<()> {
        self.run_checked(
            self.security()
                .args(["create-keychain", "-p"])
                .secret_arg(secret.expose())
                .arg(STORE_NAME),
            "create-keychain",
        )?;
        Ok(())
    }

    fn delete_store(&self) -> Result<()> {
        self.tolerant(
            self.security().args(["delete-keychain", STORE_NAME]),
            "delete-keychain",
        );
        Ok(())
    }

    fn set_store_policy(&self) -> Result<()> {
        self.run_checked(
            self.security().args(["set-keychain-settings", STORE_NAME]),
            "set-keychain-settings",
        )?;
        Ok(())
    }

    fn search_list(&self) -> Result<Vec<String>> {
        let output = self.run_checked(
            self.security().args(["list-keychains", "-d", "user"]),
            "list-keychains",
        )?;
        Ok(parse_search_list(&output.stdout))
    }

    fn set_search_list(&self, entries: &[String]) -> Result<()> {
        self.run_checked(
            self.security()
                .args(["list-keychains", "-d", "user", "-s"])
                .args(entries.iter().cloned()),
            "list-keychains -s",
        )?;
        Ok(())
    }

    fn unlock_store(&self, secret: &UnlockSecret) -> Result<()> {
        self.run_checked(
            self.security()
                .args(["unlock-keychain", "-p"])
                .secret_arg(secret.expose())
                .arg(STORE_NAME),
            "unlock-keychain",
        )?;
        Ok(())
    }

    fn set_access_partitions(&self, secret: &UnlockSecret, partitions: &[String]) -> Result<()> {
        self.run_checked(
            self.security()
                .args(["set-key-partition-list", "-S"])
                .arg(partitions.join(","))
                .args(["-s", "-k"])
                .secret_arg(secret.expose())
                .arg(STORE_NAME),
            "set-key-partition-list",
        )?;
        Ok(())
    }

    fn find_credentials(&self, common_name: &str) -> Result<Vec<StoredCredential>> {
        let output = self.run(
            self.security()
                .args(["find-certificate", "-a", "-c", common_name, "-Z", "-p", STORE_NAME]),
        )?;
        if !output.is_success() {
            if output.stderr.contains(NOT_FOUND) {
                return Ok(Vec::new());
            }
            return Err(DeviceTrustError::store(format!(
                "find-certificate failed ({})",
                output.describe_failure()
            )));
        }

        split_pem_certificates(&output.stdout)
            .into_iter()
            .map(|pem| {
                IssuedCertificate::from_pem(pem.as_bytes())
                    .map(|certificate| StoredCredential { certificate })
            })
            .collect()
    }

    fn delete_credential(&self, selector: &CredentialSelector) -> Result<()> {
        let invocation = match selector {
            CredentialSelector::CommonName(cn) => {
                self.security().args(["delete-identity", "-c", cn.as_str(), STORE_NAME])
            }
            CredentialSelector::Fingerprint(fp) => {
                self.security().args(["delete-identity", "-Z", fp.as_str(), STORE_NAME])
            }
        };
        self.run_checked(invocation, "delete-identity")?;
        Ok(())
    }

    fn import_bundle(&self, _secret: &UnlockSecret, bundle: &CredentialBundle) -> Result<()> {
        let scratch = self.scratch_dir()?;
        let path = scratch.path().join("device.p12");
        std::fs::write(&path, bundle.der())?;
        self.account.take_ownership(&path)?;

        let keychain = self.keychain_path();
        self.run_checked(
            self.security()
                .arg("import")
                .arg(path.to_string_lossy())
                .args(["-x", "-A", "-k"])
                .arg(keychain.to_string_lossy())
                .arg("-P")
                .secret_arg(bundle.password()),
            "import",
        )?;
        Ok(())
    }

    fn sign(&self, common_name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let scratch = self
            .scratch_dir()
            .map_err(|e| DeviceTrustError::signing(e.to_string()))?;
        let input = scratch.path().join("claims.json");
        let output_path = scratch.path().join("claims.p7");
        std::fs::write(&input, data).map_err(|e| DeviceTrustError::signing(e.to_string()))?;
        self.account
            .take_ownership(&input)
            .map_err(|e| DeviceTrustError::signing(e.to_string()))?;

        let keychain = self.keychain_path();
        let output = self.run(
            self.security()
                .args(["cms", "-S", "-H", "SHA256", "-k"])
                .arg(keychain.to_string_lossy())
                .args(["-N", common_name, "-i"])
                .arg(input.to_string_lossy())
                .arg("-o")
                .arg(output_path.to_string_lossy()),
        )?;
        if !output.is_success() {
            return Err(DeviceTrustError::signing(format!(
                "security cms failed ({})",
                output.describe_failure()
            )));
        }

        let signed = std::fs::read(&output_path)
            .map_err(|e| DeviceTrustError::signing(format!("no CMS output: {e}")))?;
        if signed.is_empty() {
            return Err(DeviceTrustError::signing("security cms produced no output"));
        }
        Ok(signed)
    }

    fn store_name(&self) -> &str {
        STORE_NAME
    }
}

/// Parse `security list-keychains` output into entries.
pub(crate) fn parse_search_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Extract every PEM certificate block, skipping the `SHA-1 hash:` lines.
pub(crate) fn split_pem_certificates(output: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            current = Some(String::new());
        }
        if let Some(ref mut block) = current {
            block.push_str(line);
            block.push('\n');
            if line.starts_with(PEM_END) {
                blocks.extend(current.take());
            }
        }
    }

    blocks
}
