//! Renewal proof-of-possession claims.
//!
//! The claims are serialized to JSON and signed as CMS SignedData by the
//! credential store with the current device key. The key never leaves the
//! store; see [`crate::store::CredentialStore::sign`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DeviceTrustError, Result};
use crate::identity::DeviceIdentity;
use crate::types::DevicePayload;

/// Token lifetime after issue.
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Clock skew tolerated before issue.
pub const TOKEN_SKEW_SECS: i64 = 300;

/// Claims signed with the current device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalClaims {
    /// Device the token is for.
    pub device: DevicePayload,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Not valid before (unix seconds).
    pub nbf: i64,
}

impl RenewalClaims {
    /// Claims issued at `now`, valid from five minutes earlier until one hour later.
    pub fn new(identity: &DeviceIdentity, now: SystemTime) -> Result<Self> {
        let iat = now
            .duration_since(UNIX_EPOCH)
            .map_err(|_| DeviceTrustError::signing("system clock is before the unix epoch"))?
            .as_secs() as i64;

        Ok(Self {
            device: DevicePayload::from(identity),
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
            nbf: iat - TOKEN_SKEW_SECS,
        })
    }

    /// JSON bytes to be signed.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DeviceTrustError::signing(format!("claims serialization failed: {e}")))
    }
}
