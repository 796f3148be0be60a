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

//! Certificate expiration policy.
//!
//! Renewal is driven by the scheduled unit (see [`crate::scheduler`]), which
//! runs the binary once a day. Each run asks the policy whether the current
//! credential is close enough to expiry to be renewed.
//!
//! ```
//! use std::time::{Duration, SystemTime};
//! use okta_device_trust::renewal::RenewalPolicy;
//!
//! let policy = RenewalPolicy::default();
//! let now = SystemTime::now();
//! assert!(policy.needs_renewal(now + Duration::from_secs(10 * 86400), now));
//! assert!(!policy.needs_renewal(now + Duration::from_secs(365 * 86400), now));
//! ```

use std::time::{Duration, SystemTime};

use x509_cert::time::Time;

use crate::config::DEFAULT_RENEWAL_WINDOW;

/// Decides when a credential is due for renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    window: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RENEWAL_WINDOW)
    }
}

impl RenewalPolicy {
    /// Renew when fewer than `window` of validity remain.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Renewal window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// True if a certificate expiring at `not_after` must be renewed at `now`.
    ///
    /// An already expired certificate needs renewal.
    pub fn needs_renewal(&self, not_after: SystemTime, now: SystemTime) -> bool {
        match time_until_expiry(not_after, now) {
            Some(remaining) => remaining < self.window,
            None => true,
        }
    }
}

/// Time left until `not_after`, or `None` once it has passed.
pub fn time_until_expiry(not_after: SystemTime, now: SystemTime) -> Option<Duration> {
    not_after.duration_since(now).ok().filter(|d| !d.is_zero())
}

/// True if `not_after` has passed at `now`.
pub fn is_expired(not_after: SystemTime, now: SystemTime) -> bool {
    time_until_expiry(not_after, now).is_none()
}

/// Convert an X.509 validity time to [`SystemTime`].
pub fn parse_x509_time(x509_time: &Time) -> SystemTime {
    let duration = match x509_time {
        Time::UtcTime(utc) => utc.to_unix_duration(),
        Time::GeneralTime(r#gen) => r#gen.to_unix_duration(),
    };
    SystemTime::UNIX_EPOCH + duration
}
