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

//! File-based settings.
//!
//! MDM deployments usually pass the organization URL and token as command
//! line words, but a TOML file can supply the same values:
//!
//! ```toml
//! [org]
//! url = "https://acme.okta.com"
//! token = "registration-token"
//!
//! [keychain]
//! access_partitions = ["apple-tool:", "apple:", "teamid:UBF8T346G9"]
//!
//! [renewal]
//! window_days = 30
//! check_interval_secs = 86400
//!
//! [tls]
//! ca_bundle = "/Library/Application Support/Okta/ca.pem"
//! ```

mod file;
mod loader;

pub use file::{KeychainSettings, OrgSettings, RenewalSettings, Settings, TlsSettings};
pub use loader::{SettingsLoader, CONFIG_ENV_VAR};
