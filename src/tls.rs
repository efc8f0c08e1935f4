// Copyright Istio Authors
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

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls_pemfile::Item;
use x509_parser::certificate::X509Certificate;

use crate::config::RootCert;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("invalid root certificate: {0}")]
    InvalidRootCert(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate parse: {0}")]
    CertificateParseNomError(#[from] x509_parser::nom::Err<x509_parser::error::X509Error>),

    #[error("certificate: {0}")]
    CertificateParseError(String),
}

pub(crate) static TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

// All crypto MUST be done via the below providers.
//
// rcgen does its own key generation; it is compiled against the same backend through the
// feature flags.

#[cfg(feature = "tls-aws-lc")]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        // Limit to only the subset of ciphers that are FIPS compatible
        cipher_suites: vec![
            rustls::crypto::aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
            rustls::crypto::aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ],
        ..rustls::crypto::aws_lc_rs::default_provider()
    })
}

#[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        // Limit to only the subset of ciphers that are FIPS compatible
        cipher_suites: vec![
            rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ],
        ..rustls::crypto::ring::default_provider()
    })
}

async fn root_to_store(root_cert: &RootCert) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    match root_cert {
        RootCert::File(f) => {
            let certfile = tokio::fs::read(f)
                .await
                .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
            let mut reader = std::io::BufReader::new(Cursor::new(certfile));
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
            roots.add_parsable_certificates(certs);
        }
        RootCert::Static(b) => {
            let mut reader = std::io::BufReader::new(Cursor::new(b));
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
            roots.add_parsable_certificates(certs);
        }
        RootCert::Default => {
            let native = rustls_native_certs::load_native_certs();
            if native.certs.is_empty() {
                if let Some(e) = native.errors.first() {
                    return Err(Error::InvalidRootCert(e.to_string()));
                }
            }
            roots.add_parsable_certificates(native.certs);
        }
    };
    Ok(roots)
}

/// Client configuration for talking to control plane dependencies such as the remote
/// secret backend.
pub async fn client_config(root_cert: &RootCert) -> Result<ClientConfig, Error> {
    let roots = root_to_store(root_cert).await?;
    Ok(ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiration {
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl Expiration {
    /// Reads the validity of the first certificate in `pem`.
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let mut reader = std::io::BufReader::new(Cursor::new(pem));
        let parsed = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::CertificateParseError(e.to_string()))?
            .ok_or_else(|| Error::CertificateParseError("no certificate".to_string()))?;
        let Item::X509Certificate(der) = parsed else {
            return Err(Error::CertificateParseError("no certificate".to_string()));
        };
        let (_, cert) = x509_parser::parse_x509_certificate(&der)?;
        Ok(expiration(cert))
    }

    /// The point after which the certificate should be replaced: 4/5 into its lifetime.
    pub fn refresh_at(&self) -> SystemTime {
        match self.not_after.duration_since(self.not_before) {
            Ok(valid_for) => self.not_before + valid_for.mul_f64(0.8),
            Err(_) => self.not_after,
        }
    }

    pub fn expiring_soon(&self, now: SystemTime) -> bool {
        now >= self.refresh_at()
    }
}

fn expiration(cert: X509Certificate) -> Expiration {
    Expiration {
        not_before: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_before
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
        not_after: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_after
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
    }
}
