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

//! Integration tests for first-time provisioning, convergence and rollback

use serde_json::json;

use crate::integration::{
    seed_credential, Harness, MemoryScheduler, MockCaServer, RecordingPreferences, CERT_AUTH_DOMAIN,
    DAY, PATH_ENROLL, PATH_RENEW, PROGRAM,
};
use okta_device_trust::config::AGENT_LABEL;
use okta_device_trust::store::{CredentialStore, StoreOperation};
use okta_device_trust::{DeviceTrustError, Stage};

fn assert_rolled_back(harness: &Harness) {
    assert!(!harness.store.store_exists().unwrap(), "keychain left behind");
    assert!(harness.store.find_unlock_secret().unwrap().is_none(), "secret left behind");
    assert_eq!(harness.store.credential_count(), 0);
    assert!(!harness
        .store
        .search_list()
        .unwrap()
        .iter()
        .any(|entry| entry.contains("okta.keychain")));
}

#[tokio::test]
async fn test_fresh_device_is_provisioned() {
    let mock = MockCaServer::start().await;
    let enrollments = mock.mock_enroll(365).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let result = harness.provisioner(mock.config(Some("T1"))).provision().await;
    assert!(result.is_ok(), "provision failed: {:?}", result.err());

    assert!(harness.store.store_exists().unwrap());
    assert!(harness.store.find_unlock_secret().unwrap().is_some());
    assert!(harness.store.policy_applied());
    assert_eq!(harness.store.credential_count(), 1);
    assert_eq!(
        harness.store.search_list().unwrap(),
        vec!["login.keychain-db", "okta.keychain"]
    );

    let partitions = harness.store.partitions();
    assert_eq!(partitions[0], "apple-tool:");
    assert!(partitions.contains(&"teamid:UBF8T346G9".to_string()));

    let configured = harness.preferences.configured.lock().unwrap();
    assert_eq!(configured.len(), 1);
    assert_eq!(configured[0].cert_auth_domain.as_deref(), Some(CERT_AUTH_DOMAIN));

    let unit = harness.scheduler.unit(AGENT_LABEL).expect("renewal unit installed");
    assert_eq!(unit.program.to_str(), Some(PROGRAM));
    assert_eq!(unit.arguments[0], "renew");
    assert_eq!(unit.arguments[2], mock.url());
    assert!(!unit.arguments.iter().any(|a| a == "T1"));

    assert_eq!(enrollments.lock().unwrap()[0]["orgToken"], "T1");
}

#[tokio::test]
async fn test_rerun_converges() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll_times(365, 1).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let provisioner = harness.provisioner(mock.config(Some("T1")));
    provisioner.provision().await.unwrap();
    let first = provisioner.credentials().current_credential().unwrap();

    provisioner.provision().await.unwrap();

    assert_eq!(harness.store.credential_count(), 1);
    assert_eq!(provisioner.credentials().current_credential().unwrap(), first);
    assert_eq!(harness.store.count(StoreOperation::CreateStore), 1);
    assert_eq!(
        harness
            .store
            .search_list()
            .unwrap()
            .iter()
            .filter(|e| e.contains("okta.keychain"))
            .count(),
        1
    );
    assert_eq!(harness.scheduler.install_count(), 2);
    assert_eq!(harness.scheduler.unit_count(), 1);
}

#[tokio::test]
async fn test_existing_valid_credential_skips_enrollment() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll_times(365, 0).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let fingerprint = seed_credential(&harness.store, mock.ca(), 200 * DAY);

    harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap();

    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fingerprint(), fingerprint);
}

#[tokio::test]
async fn test_expiring_credential_renewed_during_provisioning() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll_times(365, 0).await;
    mock.mock_renew_times(365, 1).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let old = seed_credential(&harness.store, mock.ca(), 5 * DAY);

    harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap();

    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_ne!(current[0].fingerprint(), old);
}

#[tokio::test]
async fn test_expired_credential_reenrolls_when_renewal_fails() {
    let mock = MockCaServer::start().await;
    mock.mock_error(PATH_RENEW, 400, json!({ "errorSummary": "invalid_token" }))
        .await;
    mock.mock_enroll_times(365, 1).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let old = seed_credential(&harness.store, mock.ca(), -DAY);

    harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap();

    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_ne!(current[0].fingerprint(), old);
}

#[tokio::test]
async fn test_missing_token_fails_before_contacting_ca() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll_times(365, 0).await;

    let harness = Harness::new();
    let err = harness
        .provisioner(mock.config(None))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::CredentialReady));
    assert!(err.is_configuration());
    assert_rolled_back(&harness);
}

#[tokio::test]
async fn test_rejected_enrollment_rolls_back() {
    let mock = MockCaServer::start().await;
    mock.mock_error(PATH_ENROLL, 400, json!({ "errorSummary": "invalid_token" }))
        .await;

    let harness = Harness::new();
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::CredentialReady));
    assert!(err.to_string().contains("invalid_token"));
    assert_rolled_back(&harness);
    assert_eq!(harness.scheduler.unit_count(), 0);
}

#[tokio::test]
async fn test_store_failure_reports_store_stage() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll_times(365, 0).await;

    let harness = Harness::new();
    harness.store.fail_on(StoreOperation::CreateStore);
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::StoreReady));
    harness.store.clear_failures();
    assert_rolled_back(&harness);
}

#[tokio::test]
async fn test_partition_failure_rolls_back() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll(365).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    harness.store.fail_on(StoreOperation::SetPartitions);
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::PartitionsConfigured));
    assert_rolled_back(&harness);
    assert!(harness.preferences.configured.lock().unwrap().is_empty());

    let resets = harness.preferences.resets.lock().unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].cert_auth_domain, None);
}

#[tokio::test]
async fn test_preference_failure_rolls_back() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll(365).await;
    mock.mock_metadata().await;

    let mut harness = Harness::new();
    harness.preferences = RecordingPreferences::failing();
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::BrowsersConfigured));
    assert_rolled_back(&harness);

    let resets = harness.preferences.resets.lock().unwrap();
    assert_eq!(resets[0].cert_auth_domain.as_deref(), Some(CERT_AUTH_DOMAIN));
}

#[tokio::test]
async fn test_metadata_failure_rolls_back() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll(365).await;

    let harness = Harness::new();
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::BrowsersConfigured));
    assert_rolled_back(&harness);
}

#[tokio::test]
async fn test_scheduler_failure_rolls_back() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll(365).await;
    mock.mock_metadata().await;

    let mut harness = Harness::new();
    harness.scheduler = MemoryScheduler::failing();
    let err = harness
        .provisioner(mock.config(Some("T1")))
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::SchedulerInstalled));
    assert!(matches!(err, DeviceTrustError::Provisioning { .. }));
    assert_rolled_back(&harness);
}

#[tokio::test]
async fn test_uninstall_removes_everything() {
    let mock = MockCaServer::start().await;
    mock.mock_enroll(365).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let provisioner = harness.provisioner(mock.config(Some("T1")));
    provisioner.provision().await.unwrap();

    provisioner.uninstall().await.unwrap();
    assert_rolled_back(&harness);
    assert_eq!(harness.scheduler.unit_count(), 0);
    let resets = harness.preferences.resets.lock().unwrap();
    assert_eq!(resets[0].cert_auth_domain.as_deref(), Some(CERT_AUTH_DOMAIN));
    drop(resets);

    provisioner.uninstall().await.unwrap();
}
