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

//! Integration tests for the launch agent scheduler and uninstall

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::integration::{local_account, RecordingPreferences, RecordingRunner};
use okta_device_trust::config::AGENT_LABEL;
use okta_device_trust::scheduler::{LaunchAgentScheduler, ScheduledUnit, UnitScheduler};
use okta_device_trust::store::{CredentialManager, CredentialStore, MemoryCredentialStore};
use okta_device_trust::{DeviceTrustConfig, Teardown};

struct Fixture {
    home: tempfile::TempDir,
    program: PathBuf,
    runner: Arc<RecordingRunner>,
    scheduler: LaunchAgentScheduler,
}

fn fixture() -> Fixture {
    let home = tempfile::tempdir().unwrap();
    let program = home.path().join("okta-device-trust-download");
    fs::write(&program, b"#!/bin/sh\nexit 0\n").unwrap();

    let runner = Arc::new(RecordingRunner::default());
    let scheduler = LaunchAgentScheduler::new(runner.clone(), local_account(home.path()));
    Fixture {
        home,
        program,
        runner,
        scheduler,
    }
}

fn unit(fixture: &Fixture) -> ScheduledUnit {
    let config = DeviceTrustConfig::builder()
        .org_url("acme.okta.com")
        .expect("Valid URL")
        .build()
        .expect("Valid config");
    ScheduledUnit::renewal_check(&config, fixture.program.clone())
}

#[test]
fn test_repeated_installs_leave_one_agent() {
    let fixture = fixture();
    let unit = unit(&fixture);

    for _ in 0..3 {
        fixture.scheduler.install(&unit).unwrap();
    }

    let agents: Vec<_> = fs::read_dir(fixture.home.path().join("Library/LaunchAgents"))
        .unwrap()
        .collect();
    assert_eq!(agents.len(), 1);
    assert!(fixture.scheduler.is_installed(AGENT_LABEL));

    assert_eq!(fixture.runner.count("launchctl", "load"), 3);
    assert_eq!(fixture.runner.count("launchctl", "unload"), 2);

    let plist = fs::read_to_string(fixture.scheduler.plist_path(AGENT_LABEL)).unwrap();
    let installed = fixture.scheduler.installed_program();
    assert!(plist.contains(&format!("<string>{}</string>", installed.display())));
    assert!(plist.contains("<string>renew</string>"));
    assert!(plist.contains("<string>https://acme.okta.com</string>"));
}

#[test]
fn test_installed_program_is_owner_executable_only() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = fixture();
    fixture.scheduler.install(&unit(&fixture)).unwrap();

    let installed = fixture.scheduler.installed_program();
    assert_eq!(installed, fixture.home.path().join("Library/Okta/okta-device-trust"));
    let mode = fs::metadata(&installed).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o500);
}

#[test]
fn test_remove_is_idempotent() {
    let fixture = fixture();
    fixture.scheduler.install(&unit(&fixture)).unwrap();

    fixture.scheduler.remove(AGENT_LABEL).unwrap();
    fixture.scheduler.remove(AGENT_LABEL).unwrap();

    assert!(!fixture.scheduler.is_installed(AGENT_LABEL));
    assert!(!fixture.home.path().join("Library/Okta").exists());
    assert_eq!(fixture.runner.count("launchctl", "remove"), 2);
}

#[test]
fn test_uninstall_on_clean_device() {
    let fixture = fixture();
    let credentials = CredentialManager::new(MemoryCredentialStore::new());
    let preferences = RecordingPreferences::default();

    let teardown = Teardown::new(&credentials, &preferences);
    teardown.uninstall(&fixture.scheduler, AGENT_LABEL).unwrap();
    teardown.uninstall(&fixture.scheduler, AGENT_LABEL).unwrap();

    assert!(!credentials.store().store_exists().unwrap());
    assert!(preferences.resets.lock().unwrap().is_empty());
}
