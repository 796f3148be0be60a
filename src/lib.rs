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

//! # okta-device-trust
//!
//! Device trust credential lifecycle for managed macOS devices.
//!
//! The crate provisions a per-user device credential (a private key and a
//! certificate issued by the organization's device trust CA) into a
//! dedicated keychain, grants approved applications access to it, points
//! the system's TLS identity preferences at it and installs a scheduled job
//! that renews it before it expires.
//!
//! ## Provisioning
//!
//! ```no_run
//! use std::sync::Arc;
//! use okta_device_trust::command::SystemCommandRunner;
//! use okta_device_trust::identity::IdentityResolver;
//! use okta_device_trust::preferences::IdentityPreferences;
//! use okta_device_trust::scheduler::LaunchAgentScheduler;
//! use okta_device_trust::store::{CredentialManager, KeychainStore};
//! use okta_device_trust::{DeviceTrustConfig, Provisioner};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceTrustConfig::builder()
//!     .org_url("acme.okta.com")?
//!     .org_token("registration-token")
//!     .build()?;
//!
//! let runner = Arc::new(SystemCommandRunner::new());
//! let (identity, account) = IdentityResolver::new(runner.clone()).resolve()?;
//!
//! let store = KeychainStore::new(runner.clone(), account.clone());
//! let scheduler = LaunchAgentScheduler::new(runner.clone(), account.clone());
//! let provisioner = Provisioner::new(
//!     config,
//!     identity,
//!     CredentialManager::new(store),
//!     Box::new(IdentityPreferences::new(runner, account)),
//!     Box::new(scheduler),
//!     std::env::current_exe()?,
//! )?;
//!
//! provisioner.provision().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Renewal
//!
//! The scheduled job calls [`Provisioner::renew_if_needed`]. Nothing is
//! deleted when renewal fails; the current credential stays usable until
//! it expires.
//!
//! ## Testing without a keychain
//!
//! [`store::MemoryCredentialStore`] implements the credential store in
//! memory with failure injection, so the whole lifecycle can run against a
//! mock CA.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod command;
pub mod config;
pub mod csr;
pub mod error;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod preferences;
pub mod renewal;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod tls;
pub mod token;
pub mod types;

// Re-export main types at crate root for convenience
pub use client::DeviceTrustClient;
pub use config::{DeviceTrustConfig, DeviceTrustConfigBuilder, TrustAnchors};
pub use error::{DeviceTrustError, Result, Stage};
pub use identity::{DeviceIdentity, OsVersion, UserAccount};
pub use orchestrator::{ProvisioningState, Provisioner, RenewalOutcome, Teardown};
pub use types::{Credential, IssuedCertificate};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
