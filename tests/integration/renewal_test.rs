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

//! Integration tests for the scheduled renewal run

use serde_json::json;

use crate::integration::{seed_credential, Harness, MockCaServer, DAY, PATH_RENEW};
use okta_device_trust::store::{CredentialManager, CredentialStore, StoreOperation};
use okta_device_trust::{DeviceTrustError, RenewalOutcome};

#[tokio::test]
async fn test_unprovisioned_device_skips_renewal() {
    let mock = MockCaServer::start().await;
    mock.mock_renew_times(365, 0).await;

    let harness = Harness::new();
    let outcome = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap();

    assert_eq!(outcome, RenewalOutcome::NoStore);
    assert!(!harness.store.store_exists().unwrap());
}

#[tokio::test]
async fn test_empty_store_reports_no_credential() {
    let mock = MockCaServer::start().await;
    mock.mock_renew_times(365, 0).await;

    let harness = Harness::new();
    CredentialManager::new(harness.store.clone())
        .ensure_store()
        .unwrap();

    let outcome = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap();
    assert_eq!(outcome, RenewalOutcome::NoCredential);
}

#[tokio::test]
async fn test_credential_outside_window_is_not_renewed() {
    let mock = MockCaServer::start().await;
    mock.mock_renew_times(365, 0).await;

    let harness = Harness::new();
    let fingerprint = seed_credential(&harness.store, mock.ca(), 200 * DAY);

    let outcome = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap();

    assert_eq!(outcome, RenewalOutcome::NotDue);
    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current[0].fingerprint(), fingerprint);
    assert_eq!(harness.store.count(StoreOperation::Sign), 0);
}

#[tokio::test]
async fn test_expiring_credential_is_replaced() {
    let mock = MockCaServer::start().await;
    mock.mock_renew_times(365, 1).await;
    mock.mock_metadata().await;

    let harness = Harness::new();
    let old = seed_credential(&harness.store, mock.ca(), 10 * DAY);

    let outcome = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap();

    let RenewalOutcome::Renewed { fingerprint } = outcome else {
        panic!("expected renewal, got {:?}", outcome);
    };
    assert_ne!(fingerprint, old);

    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fingerprint(), fingerprint);

    assert_eq!(harness.store.count(StoreOperation::SetPartitions), 1);
    assert_eq!(harness.preferences.configured.lock().unwrap().len(), 1);
    assert_eq!(harness.scheduler.install_count(), 0);
}

#[tokio::test]
async fn test_renewal_succeeds_without_metadata() {
    let mock = MockCaServer::start().await;
    mock.mock_renew(365).await;

    let harness = Harness::new();
    seed_credential(&harness.store, mock.ca(), 10 * DAY);

    let outcome = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap();

    assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));
    assert!(harness.preferences.configured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_renewal_leaves_credential_untouched() {
    let mock = MockCaServer::start().await;
    mock.mock_error(PATH_RENEW, 400, json!({ "errorSummary": "invalid_token" }))
        .await;

    let harness = Harness::new();
    let old = seed_credential(&harness.store, mock.ca(), 10 * DAY);

    let err = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await
        .unwrap_err();

    assert!(matches!(err, DeviceTrustError::Renewal(_)));
    assert!(err.to_string().contains("invalid_token"));

    assert!(harness.store.store_exists().unwrap());
    assert!(harness.store.find_unlock_secret().unwrap().is_some());
    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fingerprint(), old);
    assert_eq!(harness.store.count(StoreOperation::DeleteCredential), 0);
}

#[tokio::test]
async fn test_failed_import_keeps_old_credential() {
    let mock = MockCaServer::start().await;
    mock.mock_renew(365).await;

    let harness = Harness::new();
    let old = seed_credential(&harness.store, mock.ca(), 10 * DAY);
    harness.store.fail_on(StoreOperation::Import);

    let result = harness
        .provisioner(mock.config(None))
        .renew_if_needed()
        .await;
    assert!(result.is_err());

    harness.store.clear_failures();
    let current = harness.store.find_credentials("Okta MTLS").unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fingerprint(), old);
}
