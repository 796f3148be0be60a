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

//! Key generation and Certificate Signing Request construction.
//!
//! Every enrollment and every renewal uses a fresh RSA-2048 key. The request
//! is built with `rcgen` from the openssl-generated key:
//!
//! ```no_run
//! use okta_device_trust::csr::{KeyMaterial, SigningRequest};
//!
//! let key = KeyMaterial::generate().expect("key generation");
//! let csr = SigningRequest::for_device(&key).expect("CSR");
//! println!("{}", csr.to_base64());
//! ```

use base64::prelude::*;
use der::Encode;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use rustls_pki_types::PrivatePkcs8KeyDer;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use zeroize::Zeroizing;

use crate::config::COMMON_NAME;
use crate::error::{DeviceTrustError, Result};

const RSA_BITS: u32 = 2048;
const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];

/// A device private key.
///
/// Deliberately not `Clone`; it is consumed when packaged for import.
pub struct KeyMaterial {
    pkey: PKey<Private>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial(RSA-{})", self.pkey.bits())
    }
}

impl KeyMaterial {
    /// Generate a new RSA-2048 key.
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(RSA_BITS)
            .map_err(|e| DeviceTrustError::csr(format!("key generation failed: {e}")))?;
        let pkey = PKey::from_rsa(rsa)
            .map_err(|e| DeviceTrustError::csr(format!("key generation failed: {e}")))?;
        Ok(Self { pkey })
    }

    /// Wrap an existing key.
    pub fn from_pkey(pkey: PKey<Private>) -> Self {
        Self { pkey }
    }

    /// Borrow the underlying key.
    pub fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    /// True if `public` is the public half of this key.
    pub fn matches(&self, public: &PKey<Public>) -> bool {
        self.pkey.public_eq(public)
    }

    fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.pkey
            .private_key_to_pkcs8()
            .map(Zeroizing::new)
            .map_err(|e| DeviceTrustError::csr(format!("key export failed: {e}")))
    }
}

/// A DER-encoded PKCS#10 request.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    der: Vec<u8>,
}

impl SigningRequest {
    /// Build the device request: `C=US, ST=CA, O=Okta, CN=Okta MTLS`.
    pub fn for_device(key: &KeyMaterial) -> Result<Self> {
        CsrBuilder::new()
            .country("US")
            .state("CA")
            .organization("Okta")
            .common_name(COMMON_NAME)
            .build(key)
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 DER, as sent to the CA.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.der)
    }
}

/// Builder for device signing requests.
///
/// Requests always carry `keyUsage = digitalSignature, nonRepudiation,
/// keyEncipherment` and `basicConstraints = CA:false`.
pub struct CsrBuilder {
    params: CertificateParams,
}

impl Default for CsrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        Self { params }
    }

    /// Set the Country (C).
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.params
            .distinguished_name
            .push(DnType::CountryName, country.into());
        self
    }

    /// Set the State or Province (ST).
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.params
            .distinguished_name
            .push(DnType::StateOrProvinceName, state.into());
        self
    }

    /// Set the Organization (O).
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.params
            .distinguished_name
            .push(DnType::OrganizationName, org.into());
        self
    }

    /// Set the Common Name (CN).
    pub fn common_name(mut self, cn: impl Into<String>) -> Self {
        self.params
            .distinguished_name
            .push(DnType::CommonName, cn.into());
        self
    }

    /// Sign the request with `key`.
    pub fn build(mut self, key: &KeyMaterial) -> Result<SigningRequest> {
        self.params.custom_extensions = device_extensions()?;

        let pkcs8 = key.to_pkcs8_der()?;
        let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_slice());
        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| DeviceTrustError::csr(format!("failed to load key: {e}")))?;

        let csr = self
            .params
            .serialize_request(&key_pair)
            .map_err(|e| DeviceTrustError::csr(format!("failed to serialize CSR: {e}")))?;

        Ok(SigningRequest {
            der: csr.der().to_vec(),
        })
    }
}

fn device_extensions() -> Result<Vec<CustomExtension>> {
    let key_usage = KeyUsage(
        KeyUsages::DigitalSignature | KeyUsages::NonRepudiation | KeyUsages::KeyEncipherment,
    )
    .to_der()
    .map_err(|e| DeviceTrustError::csr(format!("keyUsage encoding failed: {e}")))?;

    let basic_constraints = BasicConstraints {
        ca: false,
        path_len_constraint: None,
    }
    .to_der()
    .map_err(|e| DeviceTrustError::csr(format!("basicConstraints encoding failed: {e}")))?;

    Ok(vec![
        CustomExtension::from_oid_content(OID_KEY_USAGE, key_usage),
        CustomExtension::from_oid_content(OID_BASIC_CONSTRAINTS, basic_constraints),
    ])
}
