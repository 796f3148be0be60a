//! HTTP client construction for the CA connection.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::config::{DeviceTrustConfig, TrustAnchors};
use crate::error::{DeviceTrustError, Result};

const JSON: &str = "application/json";

/// Build a reqwest Client over rustls for `config`.
///
/// TLS 1.2 is the minimum. No request timeout is set unless the
/// configuration asks for one.
pub fn build_http_client(config: &DeviceTrustConfig, user_agent: &str) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(JSON));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));

    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .user_agent(user_agent)
        .default_headers(headers);

    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }

    match &config.trust_anchors {
        TrustAnchors::WebPki => {
            builder = builder.tls_built_in_root_certs(true);
        }
        TrustAnchors::Explicit(ca_certs) => {
            builder = builder.tls_built_in_root_certs(false);
            for ca_pem in ca_certs {
                for cert in reqwest::Certificate::from_pem_bundle(ca_pem).map_err(|e| {
                    DeviceTrustError::tls(format!("Failed to parse CA certificate: {}", e))
                })? {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }
    }

    builder
        .build()
        .map_err(|e| DeviceTrustError::tls(format!("Failed to build HTTP client: {}", e)))
}
