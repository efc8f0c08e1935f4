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

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rcgen::{CertificateParams, KeyPair as RcgenKeyPair};

use super::{CaManager, Error, KeyPair, builtin};
use crate::mesh::CaBackend;
use crate::secrets::split_pem_blocks;
use crate::strng::Strng;

pub const TYPE: &str = "provided";

/// ProvidedCaManager signs workload certificates with a CA supplied by the operator.
/// The certificate and key are configured on the backend either inline (`cert`, `key`)
/// or as paths (`certFile`, `keyFile`).
pub struct ProvidedCaManager {
    validity: Duration,
}

impl ProvidedCaManager {
    pub fn new(validity: Duration) -> Self {
        ProvidedCaManager { validity }
    }
}

async fn read_pem(backend: &CaBackend, inline: &str, file: &str) -> Result<String, Error> {
    if let Some(pem) = backend.conf.get(inline) {
        return Ok(pem.clone());
    }
    match backend.conf.get(file) {
        Some(path) => tokio::fs::read_to_string(path).await.map_err(|source| Error::Io {
            path: path.clone(),
            source,
        }),
        None => Err(Error::InvalidConfig {
            backend: backend.name.clone(),
            reason: format!("one of {inline} or {file} must be set"),
        }),
    }
}

#[async_trait]
impl CaManager for ProvidedCaManager {
    async fn root_certs(&self, _mesh: &str, backend: &CaBackend) -> Result<Vec<Bytes>, Error> {
        let pem = read_pem(backend, "cert", "certFile").await?;
        let blocks = split_pem_blocks(pem.as_bytes());
        if blocks.is_empty() {
            return Err(Error::InvalidConfig {
                backend: backend.name.clone(),
                reason: "no certificate found".to_string(),
            });
        }
        Ok(blocks)
    }

    async fn generate_workload_cert(
        &self,
        mesh: &str,
        backend: &CaBackend,
        services: &[Strng],
    ) -> Result<KeyPair, Error> {
        let cert_pem = read_pem(backend, "cert", "certFile").await?;
        let key_pem = read_pem(backend, "key", "keyFile").await?;
        let key = RcgenKeyPair::from_pem(&key_pem)?;
        // Re-signing the parsed parameters yields an issuer with the same subject and key,
        // which is all that is needed to sign leaves.
        let issuer = CertificateParams::from_ca_cert_pem(&cert_pem)?.self_signed(&key)?;
        builtin::sign_workload_cert(mesh, services, self.validity, &issuer, &key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rcgen::{BasicConstraints, IsCa};

    use super::*;
    use crate::strng;

    fn provided_backend() -> (CaBackend, String) {
        let key = RcgenKeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let mut conf = BTreeMap::new();
        conf.insert("cert".to_string(), cert.pem());
        conf.insert("key".to_string(), key.serialize_pem());
        (
            CaBackend {
                name: strng::new("ca-provided"),
                type_: strng::new(TYPE),
                conf,
            },
            cert.pem(),
        )
    }

    #[tokio::test]
    async fn root_is_the_configured_cert() {
        let (backend, pem) = provided_backend();
        let ca = ProvidedCaManager::new(Duration::from_secs(60));
        let roots = ca.root_certs("m1", &backend).await.unwrap();
        assert_eq!(roots, vec![Bytes::from(pem)]);
    }

    #[tokio::test]
    async fn signs_with_configured_key() {
        let (backend, _) = provided_backend();
        let ca = ProvidedCaManager::new(Duration::from_secs(60));
        let pair = ca
            .generate_workload_cert("m1", &backend, &[strng::new("backend")])
            .await
            .unwrap();
        assert!(pair.cert_pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn missing_material() {
        let (mut backend, _) = provided_backend();
        backend.conf.remove("key");
        let ca = ProvidedCaManager::new(Duration::from_secs(60));
        let err = ca
            .generate_workload_cert("m1", &backend, &[strng::new("backend")])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration of CA backend ca-provided: one of key or keyFile must be set"
        );

        backend.conf.insert("certFile".to_string(), "/nonexistent/ca.pem".to_string());
        backend.conf.remove("cert");
        assert!(matches!(
            ca.root_certs("m1", &backend).await,
            Err(Error::Io { .. })
        ));
    }
}
