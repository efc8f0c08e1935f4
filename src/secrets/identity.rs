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

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Error, Issued, Secret, SecretProvider, resolve_backend, split_pem_blocks};
use crate::auth::Credential;
use crate::ca::CaManagers;
use crate::mesh::Identity;
use crate::store::ResourceManager;

/// IdentityCertProvider signs a workload certificate for the services of an identity.
/// Generation failures are returned as they are; retrying is up to the caller.
pub struct IdentityCertProvider {
    resources: Arc<dyn ResourceManager>,
    managers: CaManagers,
}

impl IdentityCertProvider {
    pub fn new(resources: Arc<dyn ResourceManager>, managers: CaManagers) -> Self {
        IdentityCertProvider {
            resources,
            managers,
        }
    }
}

#[async_trait]
impl SecretProvider for IdentityCertProvider {
    async fn get(&self, identity: &Identity, _: Option<&Credential>) -> Result<Issued, Error> {
        if identity.services.is_empty() {
            return Err(Error::NoServices(identity.mesh.clone()));
        }
        let (backend, manager) =
            resolve_backend(self.resources.as_ref(), &self.managers, &identity.mesh).await?;
        let pair = manager
            .generate_workload_cert(&identity.mesh, &backend, &identity.services)
            .await
            .map_err(|source| Error::Generate {
                identity: identity.clone(),
                backend: backend.name.clone(),
                source,
            })?;
        debug!(%identity, backend=%backend.name, "issued identity certificate");
        Ok(Issued {
            secret: Secret::IdentityCert {
                pem_certs: split_pem_blocks(&pair.cert_pem),
                pem_key: pair.key_pem,
            },
            backend: backend.name,
        })
    }

    fn requires_identity(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::ca::{self, CaManager, KeyPair};
    use crate::mesh::CaBackend;
    use crate::store::MemoryStore;
    use crate::strng::{self, Strng};
    use crate::test_helpers::{ca_managers, mesh};

    #[tokio::test]
    async fn signs_for_identity() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_mesh(mesh("m1", "ca-1", &["ca-1"]));
        let p = IdentityCertProvider::new(store, ca_managers());
        let identity = Identity {
            mesh: strng::new("m1"),
            services: vec![strng::new("backend")],
        };
        let issued = p.get(&identity, None).await.unwrap();
        assert_eq!(issued.backend, "ca-1");
        let Secret::IdentityCert { pem_certs, pem_key } = issued.secret else {
            panic!("expected identity cert");
        };
        assert_eq!(pem_certs.len(), 1);
        assert!(!pem_key.is_empty());
    }

    #[tokio::test]
    async fn empty_identity_is_rejected() {
        let p = IdentityCertProvider::new(Arc::new(MemoryStore::new()), ca_managers());
        let identity = Identity {
            mesh: strng::new("m1"),
            services: vec![],
        };
        assert!(matches!(
            p.get(&identity, None).await,
            Err(Error::NoServices(_))
        ));
    }

    struct FailingCa;

    #[async_trait]
    impl CaManager for FailingCa {
        async fn root_certs(&self, _: &str, _: &CaBackend) -> Result<Vec<bytes::Bytes>, ca::Error> {
            Ok(vec![])
        }

        async fn generate_workload_cert(
            &self,
            _: &str,
            backend: &CaBackend,
            _: &[Strng],
        ) -> Result<KeyPair, ca::Error> {
            Err(ca::Error::InvalidConfig {
                backend: backend.name.clone(),
                reason: "signing key unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn generation_errors_carry_context() {
        let store = Arc::new(MemoryStore::new());
        let mut m = mesh("m1", "ca-1", &["ca-1"]);
        m.mtls.as_mut().unwrap().backends[0] = CaBackend {
            name: strng::new("ca-1"),
            type_: strng::new("failing"),
            conf: BTreeMap::new(),
        };
        store.upsert_mesh(m);
        let managers = ca_managers()
            .with("failing", FailingCa)
            .with("unused", ca::BuiltinCaManager::new(Duration::from_secs(1)));
        let p = IdentityCertProvider::new(store, managers);
        let identity = Identity {
            mesh: strng::new("m1"),
            services: vec![strng::new("backend")],
        };
        let err = p.get(&identity, None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to generate identity certificate for m1/backend with CA backend ca-1: \
             invalid configuration of CA backend ca-1: signing key unavailable"
        );
    }
}
