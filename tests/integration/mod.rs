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

//! Integration test utilities and helpers
//!
//! A mock device trust CA built on wiremock that signs the CSRs it receives
//! with a throwaway test CA, plus in-memory stand-ins for the preference
//! and scheduler seams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef, X509Req, X509};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use okta_device_trust::command::{CommandOutput, CommandRunner, Invocation};
use okta_device_trust::csr::KeyMaterial;
use okta_device_trust::preferences::{TrustDomains, TrustPreferences};
use okta_device_trust::scheduler::{ScheduledUnit, UnitScheduler};
use okta_device_trust::store::{CredentialManager, MemoryCredentialStore};
use okta_device_trust::{
    DeviceIdentity, DeviceTrustConfig, DeviceTrustError, IssuedCertificate, OsVersion,
    Provisioner, UserAccount,
};

/// CA operation paths
pub const PATH_ENROLL: &str = "/api/internal/device-trust/ca/v1/enroll/macos";
pub const PATH_RENEW: &str = "/api/internal/device-trust/ca/v1/renew/macos";
pub const PATH_METADATA: &str = "/api/internal/v1/device-trust/metadata";

/// Host returned by the metadata endpoint
pub const CERT_AUTH_DOMAIN: &str = "device-trust.okta.test";

pub const DAY: i64 = 24 * 60 * 60;

pub const PROGRAM: &str = "/usr/local/bin/okta-device-trust";

/// JSON bodies received by a mocked endpoint
pub type Requests = Arc<Mutex<Vec<Value>>>;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Throwaway certificate authority
pub struct TestCa {
    key: PKey<Private>,
    cert: X509,
    serial: AtomicU32,
}

impl TestCa {
    pub fn new() -> Self {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let name = name("MTLS Certificate Authority");

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(now() - DAY).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(now() + 3650 * DAY).unwrap())
            .unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        Self {
            key,
            cert: builder.build(),
            serial: AtomicU32::new(2),
        }
    }

    /// Issue a certificate for `public_key` valid for `valid_secs` from now.
    ///
    /// A negative `valid_secs` yields an already expired certificate.
    pub fn issue(&self, subject: &X509NameRef, public_key: &PKeyRef<Public>, valid_secs: i64) -> X509 {
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(self.serial.fetch_add(1, Ordering::SeqCst))
            .unwrap()
            .to_asn1_integer()
            .unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(subject).unwrap();
        builder.set_issuer_name(self.cert.subject_name()).unwrap();
        builder.set_pubkey(public_key).unwrap();

        let not_after = now() + valid_secs;
        let not_before = (now() - DAY).min(not_after - 60);
        builder
            .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
            .unwrap();
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    /// Verify a DER CSR and issue a DER certificate for it.
    pub fn issue_for_csr(&self, csr_der: &[u8], valid_secs: i64) -> Vec<u8> {
        let request = X509Req::from_der(csr_der).unwrap();
        let public_key = request.public_key().unwrap();
        assert!(request.verify(&public_key).unwrap(), "CSR signature invalid");
        self.issue(request.subject_name(), &public_key, valid_secs)
            .to_der()
            .unwrap()
    }

    /// A device key and certificate as the CA would have issued them.
    pub fn device_identity(&self, valid_secs: i64) -> (KeyMaterial, IssuedCertificate) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let public_key = PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        let cert = self.issue(&name("Okta MTLS"), &public_key, valid_secs);
        let issued = IssuedCertificate::from_der(&cert.to_der().unwrap()).unwrap();
        (KeyMaterial::from_pkey(key), issued)
    }
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_text("CN", common_name).unwrap();
    builder.build()
}

/// Signs the CSR in each request body and answers like the device trust CA
pub struct IssuingResponder {
    ca: Arc<TestCa>,
    valid_secs: i64,
    requests: Requests,
}

impl Respond for IssuingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let csr = BASE64_STANDARD
            .decode(body["csr"].as_str().unwrap())
            .unwrap();
        let cert = self.ca.issue_for_csr(&csr, self.valid_secs);
        self.requests.lock().unwrap().push(body);
        ResponseTemplate::new(200)
            .set_body_json(json!({ "issuedCertificate": BASE64_STANDARD.encode(cert) }))
    }
}

/// Mock device trust CA for integration tests
pub struct MockCaServer {
    server: MockServer,
    ca: Arc<TestCa>,
}

impl MockCaServer {
    /// Start a new mock CA
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
            ca: Arc::new(TestCa::new()),
        }
    }

    /// Base URL of the mock server
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// The CA signing issued certificates
    pub fn ca(&self) -> &TestCa {
        &self.ca
    }

    async fn mount_issuing(&self, endpoint: &str, valid_secs: i64, expected: Option<u64>) -> Requests {
        let requests = Requests::default();
        let mut mock = Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(IssuingResponder {
                ca: self.ca.clone(),
                valid_secs,
                requests: requests.clone(),
            });
        if let Some(times) = expected {
            mock = mock.expect(times);
        }
        mock.mount(&self.server).await;
        requests
    }

    /// Enrollment issuing certificates valid for `days`
    pub async fn mock_enroll(&self, days: i64) -> Requests {
        self.mount_issuing(PATH_ENROLL, days * DAY, None).await
    }

    /// Enrollment that must be called exactly `times` times
    pub async fn mock_enroll_times(&self, days: i64, times: u64) -> Requests {
        self.mount_issuing(PATH_ENROLL, days * DAY, Some(times)).await
    }

    /// Renewal issuing certificates valid for `days`
    pub async fn mock_renew(&self, days: i64) -> Requests {
        self.mount_issuing(PATH_RENEW, days * DAY, None).await
    }

    /// Renewal that must be called exactly `times` times
    pub async fn mock_renew_times(&self, days: i64, times: u64) -> Requests {
        self.mount_issuing(PATH_RENEW, days * DAY, Some(times)).await
    }

    /// An error answer on `endpoint`
    pub async fn mock_error(&self, endpoint: &str, status: u16, body: Value) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Metadata pointing at [`CERT_AUTH_DOMAIN`]
    pub async fn mock_metadata(&self) {
        Mock::given(method("GET"))
            .and(path(PATH_METADATA))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "certAuthDomain": format!("https://{}/", CERT_AUTH_DOMAIN)
            })))
            .mount(&self.server)
            .await;
    }

    /// Config for this server, with an optional registration token
    pub fn config(&self, token: Option<&str>) -> DeviceTrustConfig {
        let mut builder = DeviceTrustConfig::builder()
            .org_url(self.url())
            .expect("Valid URL");
        if let Some(token) = token {
            builder = builder.org_token(token);
        }
        builder.build().expect("Valid config")
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        hardware_uuid: "564D8E62-73F1-4A0B-9D2C-7A1B5C3E9F10".to_string(),
        display_name: "Alice's MacBook Pro".to_string(),
        os_user: "alice".to_string(),
        os_version: OsVersion::new(14, 2, 1),
    }
}

/// Place a CA-issued credential into `store`, creating the store first.
///
/// Returns the certificate fingerprint.
pub fn seed_credential(store: &MemoryCredentialStore, ca: &TestCa, valid_secs: i64) -> String {
    CredentialManager::new(store.clone())
        .ensure_store()
        .expect("store setup");
    let (key, cert) = ca.device_identity(valid_secs);
    let fingerprint = cert.fingerprint().to_string();
    store.insert_identity(key, cert).expect("seed identity");
    fingerprint
}

/// Trust preferences that remember what they were asked to do
#[derive(Clone, Default)]
pub struct RecordingPreferences {
    pub configured: Arc<Mutex<Vec<TrustDomains>>>,
    pub resets: Arc<Mutex<Vec<TrustDomains>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingPreferences {
    /// Preferences whose `configure` fails
    pub fn failing() -> Self {
        let prefs = Self::default();
        prefs.fail.store(true, Ordering::SeqCst);
        prefs
    }
}

impl TrustPreferences for RecordingPreferences {
    fn configure(&self, domains: &TrustDomains) -> okta_device_trust::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceTrustError::store("set-identity-preference failed"));
        }
        self.configured.lock().unwrap().push(domains.clone());
        Ok(())
    }

    fn reset(&self, domains: &TrustDomains) -> okta_device_trust::Result<()> {
        self.resets.lock().unwrap().push(domains.clone());
        Ok(())
    }
}

/// Scheduler keeping units in memory, keyed by label
#[derive(Clone, Default)]
pub struct MemoryScheduler {
    units: Arc<Mutex<HashMap<String, ScheduledUnit>>>,
    installs: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl MemoryScheduler {
    /// Scheduler whose `install` fails
    pub fn failing() -> Self {
        let scheduler = Self::default();
        scheduler.fail.store(true, Ordering::SeqCst);
        scheduler
    }

    pub fn unit(&self, label: &str) -> Option<ScheduledUnit> {
        self.units.lock().unwrap().get(label).cloned()
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().unwrap().len()
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

impl UnitScheduler for MemoryScheduler {
    fn install(&self, unit: &ScheduledUnit) -> okta_device_trust::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceTrustError::scheduler_install("launchctl load failed"));
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.units
            .lock()
            .unwrap()
            .insert(unit.label.clone(), unit.clone());
        Ok(())
    }

    fn remove(&self, label: &str) -> okta_device_trust::Result<()> {
        self.units.lock().unwrap().remove(label);
        Ok(())
    }

    fn is_installed(&self, label: &str) -> bool {
        self.units.lock().unwrap().contains_key(label)
    }
}

/// The components a provisioner is wired from, kept for inspection
#[derive(Clone, Default)]
pub struct Harness {
    pub store: MemoryCredentialStore,
    pub preferences: RecordingPreferences,
    pub scheduler: MemoryScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemoryCredentialStore::new(),
            ..Default::default()
        }
    }

    pub fn provisioner(&self, config: DeviceTrustConfig) -> Provisioner<MemoryCredentialStore> {
        Provisioner::new(
            config,
            identity(),
            CredentialManager::new(self.store.clone()),
            Box::new(self.preferences.clone()),
            Box::new(self.scheduler.clone()),
            PROGRAM.into(),
        )
        .expect("Provisioner creation failed")
    }
}

/// Command runner that succeeds without running anything
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    /// Program followed by its arguments, for each call
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose first argument is `subcommand`
    pub fn count(&self, program: &str, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c[0] == program && c.get(1).map(String::as_str) == Some(subcommand))
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation) -> okta_device_trust::Result<CommandOutput> {
        let mut call = vec![invocation.program().to_string()];
        call.extend(invocation.arg_values().iter().map(|a| a.to_string()));
        self.calls.lock().unwrap().push(call);
        Ok(CommandOutput::success(""))
    }
}

/// An account whose home is `home`, owned by the current user
pub fn local_account(home: &Path) -> UserAccount {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::metadata(home).unwrap();
    UserAccount {
        name: "alice".to_string(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        home: home.to_path_buf(),
    }
}
