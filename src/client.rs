//! CA enrollment and renewal client.
//!
//! [`DeviceTrustClient`] talks to the organization's device trust CA:
//! enrollment with a one-time registration token, renewal with a token
//! signed by the current device key, and the metadata lookup used to
//! configure trust preferences.

use std::time::SystemTime;

use base64::prelude::*;
use reqwest::StatusCode;
use serde::Serialize;

use crate::config::{domain_from_url, DeviceTrustConfig, CLIENT_VERSION};
use crate::csr::{KeyMaterial, SigningRequest};
use crate::error::{DeviceTrustError, Result};
use crate::identity::{DeviceIdentity, OsVersion};
use crate::store::{CredentialManager, CredentialStore};
use crate::tls::build_http_client;
use crate::token::RenewalClaims;
use crate::types::{
    Credential, DevicePayload, EnrollmentRequest, IssuanceResponse, IssuedCertificate,
    MetadataResponse, RenewalRequest,
};

/// Which CA operation a response belongs to.
#[derive(Debug, Clone, Copy)]
enum Operation {
    Enroll,
    Renew,
}

impl Operation {
    fn error(self, msg: String) -> DeviceTrustError {
        match self {
            Operation::Enroll => DeviceTrustError::enrollment(msg),
            Operation::Renew => DeviceTrustError::renewal(msg),
        }
    }
}

/// User agent reported to the CA.
///
/// `Okta Device Registration Task/1.2.0 (Macintosh; arm64 Mac OS X 14_2_1)`
pub fn user_agent(os_version: &OsVersion) -> String {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    };
    format!(
        "Okta Device Registration Task/{} (Macintosh; {} Mac OS X {})",
        CLIENT_VERSION,
        arch,
        os_version.underscored()
    )
}

/// Client for the device trust CA.
#[derive(Debug)]
pub struct DeviceTrustClient {
    config: DeviceTrustConfig,
    http: reqwest::Client,
}

impl DeviceTrustClient {
    /// Create a client for `config`, identifying as `identity`'s OS.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS configuration fails.
    pub fn new(config: &DeviceTrustConfig, identity: &DeviceIdentity) -> Result<Self> {
        let http = build_http_client(config, &user_agent(&identity.os_version))?;
        Ok(Self {
            config: config.clone(),
            http,
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &DeviceTrustConfig {
        &self.config
    }

    /// Enroll the device with a one-time registration token.
    pub async fn enroll(&self, identity: &DeviceIdentity, org_token: &str) -> Result<Credential> {
        tracing::info!("Enrolling device certificate.");
        let key = KeyMaterial::generate()?;
        let csr = SigningRequest::for_device(&key)?;

        let request = EnrollmentRequest {
            client_version: CLIENT_VERSION.to_string(),
            org_token: org_token.to_string(),
            device: DevicePayload::from(identity),
            csr: csr.to_base64(),
            user: identity.os_user.clone(),
        };

        let certificate = self
            .issue(Operation::Enroll, self.config.enroll_url(), &request)
            .await?;
        tracing::info!("Enrollment succeeded.");
        Credential::new(key, certificate)
    }

    /// Renew the device certificate, proving possession of the current key.
    ///
    /// The renewal token is signed before any network traffic; a signing
    /// failure is returned as [`DeviceTrustError::Signing`] without
    /// contacting the CA.
    pub async fn renew<S: CredentialStore>(
        &self,
        identity: &DeviceIdentity,
        manager: &CredentialManager<S>,
    ) -> Result<Credential> {
        tracing::info!("Renewing device certificate.");
        let claims = RenewalClaims::new(identity, SystemTime::now())?;
        let signed = manager.sign_proof(&claims.to_json()?)?;

        let key = KeyMaterial::generate()?;
        let csr = SigningRequest::for_device(&key)?;

        let request = RenewalRequest {
            client_version: CLIENT_VERSION.to_string(),
            device_renewal_token: BASE64_STANDARD.encode(signed),
            device: DevicePayload::from(identity),
            csr: csr.to_base64(),
            user: identity.os_user.clone(),
        };

        let certificate = self
            .issue(Operation::Renew, self.config.renew_url(), &request)
            .await?;
        tracing::info!("Renewal succeeded.");
        Credential::new(key, certificate)
    }

    /// Look up the host that performs certificate authentication.
    ///
    /// Returns the bare domain, without scheme or trailing slash.
    pub async fn fetch_metadata(&self) -> Result<String> {
        let url = self.config.metadata_url();
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DeviceTrustError::config(format!("metadata request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeviceTrustError::config(format!("failed to read metadata response: {e}")))?;
        if !status.is_success() {
            tracing::error!("Failed to get metadata. Response: {}", body);
            return Err(DeviceTrustError::config(format!(
                "metadata request returned HTTP {}",
                status.as_u16()
            )));
        }

        let metadata: MetadataResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Unexpected metadata response: {}", body);
            DeviceTrustError::config(format!("invalid metadata response: {e}"))
        })?;
        Ok(domain_from_url(&metadata.cert_auth_domain))
    }

    async fn issue<T: Serialize>(
        &self,
        operation: Operation,
        url: url::Url,
        request: &T,
    ) -> Result<IssuedCertificate> {
        tracing::debug!("POST {}", url);

        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| operation.error(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| operation.error(format!("failed to read response: {e}")))?;

        parse_issuance(operation, status, &body)
    }
}

fn parse_issuance(operation: Operation, status: StatusCode, body: &str) -> Result<IssuedCertificate> {
    if !status.is_success() {
        tracing::error!("CA returned HTTP {}. Response: {}", status.as_u16(), body);
        return Err(operation.error(format!("HTTP {}: {}", status.as_u16(), body.trim())));
    }

    let parsed: IssuanceResponse = serde_json::from_str(body).map_err(|_| {
        tracing::error!("Unexpected CA response: {}", body);
        operation.error(format!("unexpected response: {}", body.trim()))
    })?;

    IssuedCertificate::from_base64(&parsed.issued_certificate).map_err(|e| {
        tracing::error!("CA returned an invalid certificate: {}", e);
        operation.error(format!("invalid certificate in response: {e}"))
    })
}
