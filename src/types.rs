//! Wire records and certificate types.
//!
//! Requests and responses are typed; a CA response that does not carry a
//! parseable certificate is rejected here, at the parse boundary.

use std::time::SystemTime;

use base64::prelude::*;
use der::{Decode, Encode};
use openssl::hash::MessageDigest;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

use crate::csr::KeyMaterial;
use crate::error::{DeviceTrustError, Result};
use crate::identity::DeviceIdentity;
use crate::renewal::parse_x509_time;

/// Device description sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePayload {
    /// Hardware UUID.
    pub uuid: String,
    /// Computer name.
    pub display_name: String,
}

impl From<&DeviceIdentity> for DevicePayload {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            uuid: identity.hardware_uuid.clone(),
            display_name: identity.display_name.clone(),
        }
    }
}

/// Body of an enrollment request.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {
    /// Client version.
    pub client_version: String,
    /// One-time registration token.
    pub org_token: String,
    /// Device description.
    pub device: DevicePayload,
    /// Base64 DER PKCS#10 request.
    pub csr: String,
    /// Console user.
    pub user: String,
}

impl std::fmt::Debug for EnrollmentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentRequest")
            .field("client_version", &self.client_version)
            .field("org_token", &"<redacted>")
            .field("device", &self.device)
            .field("user", &self.user)
            .finish()
    }
}

/// Body of a renewal request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRequest {
    /// Client version.
    pub client_version: String,
    /// Base64 CMS SignedData over the renewal claims.
    pub device_renewal_token: String,
    /// Device description.
    pub device: DevicePayload,
    /// Base64 DER PKCS#10 request.
    pub csr: String,
    /// Console user.
    pub user: String,
}

/// Successful CA response to enroll or renew.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceResponse {
    /// Base64 DER certificate.
    pub issued_certificate: String,
}

/// Device trust metadata of the organization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    /// Host that performs certificate authentication.
    pub cert_auth_domain: String,
}

/// An X.509 certificate that has been parsed and validated.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    der: Vec<u8>,
    not_after: SystemTime,
    fingerprint: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("fingerprint", &self.fingerprint)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl IssuedCertificate {
    /// Parse a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)
            .map_err(|e| DeviceTrustError::certificate(format!("invalid certificate: {e}")))?;
        let not_after = parse_x509_time(&cert.tbs_certificate.validity.not_after);

        let x509 = X509::from_der(der)
            .map_err(|e| DeviceTrustError::certificate(format!("invalid certificate: {e}")))?;
        let digest = x509
            .digest(MessageDigest::sha1())
            .map_err(|e| DeviceTrustError::certificate(format!("fingerprint failed: {e}")))?;

        Ok(Self {
            der: cert
                .to_der()
                .map_err(|e| DeviceTrustError::certificate(format!("re-encoding failed: {e}")))?,
            not_after,
            fingerprint: format_fingerprint(&digest),
        })
    }

    /// Parse a base64 DER certificate as returned by the CA.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let der = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| DeviceTrustError::certificate(format!("invalid base64: {e}")))?;
        Self::from_der(&der)
    }

    /// Parse a single PEM certificate.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let x509 = X509::from_pem(pem)
            .map_err(|e| DeviceTrustError::certificate(format!("invalid PEM certificate: {e}")))?;
        let der = x509
            .to_der()
            .map_err(|e| DeviceTrustError::certificate(format!("invalid certificate: {e}")))?;
        Self::from_der(&der)
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// End of the validity period.
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// SHA-1 fingerprint, upper-case hex without separators.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Parsed openssl certificate.
    pub fn to_x509(&self) -> Result<X509> {
        X509::from_der(&self.der)
            .map_err(|e| DeviceTrustError::certificate(format!("invalid certificate: {e}")))
    }
}

/// Format a digest as upper-case hex.
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02X}", b)).collect()
}

/// A freshly issued certificate together with its private key.
///
/// Not `Clone`: the key is moved into the credential store on import.
#[derive(Debug)]
pub struct Credential {
    /// Private key.
    pub key: KeyMaterial,
    /// Certificate issued for the key.
    pub certificate: IssuedCertificate,
}

impl Credential {
    /// Pair a key with its certificate, checking that they belong together.
    pub fn new(key: KeyMaterial, certificate: IssuedCertificate) -> Result<Self> {
        let x509 = certificate.to_x509()?;
        let cert_key = x509
            .public_key()
            .map_err(|e| DeviceTrustError::certificate(format!("no public key: {e}")))?;
        if !key.matches(&cert_key) {
            return Err(DeviceTrustError::certificate(
                "issued certificate does not match the request key",
            ));
        }
        Ok(Self { key, certificate })
    }
}
