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

use super::{Error, Issued, Secret, SecretProvider, resolve_backend};
use crate::auth::Credential;
use crate::ca::CaManagers;
use crate::mesh::Identity;
use crate::store::ResourceManager;

/// MeshCaProvider serves the trusted root bundle of the mesh's enabled CA backend.
pub struct MeshCaProvider {
    resources: Arc<dyn ResourceManager>,
    managers: CaManagers,
}

impl MeshCaProvider {
    pub fn new(resources: Arc<dyn ResourceManager>, managers: CaManagers) -> Self {
        MeshCaProvider {
            resources,
            managers,
        }
    }
}

#[async_trait]
impl SecretProvider for MeshCaProvider {
    async fn get(&self, identity: &Identity, _: Option<&Credential>) -> Result<Issued, Error> {
        let (backend, manager) =
            resolve_backend(self.resources.as_ref(), &self.managers, &identity.mesh).await?;
        let pem_certs = manager
            .root_certs(&identity.mesh, &backend)
            .await
            .map_err(|source| Error::RootCerts {
                mesh: identity.mesh.clone(),
                backend: backend.name.clone(),
                source,
            })?;
        debug!(mesh=%identity.mesh, backend=%backend.name, certs=pem_certs.len(), "issued mesh ca");
        Ok(Issued {
            secret: Secret::MeshCa { pem_certs },
            backend: backend.name,
        })
    }

    fn requires_identity(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::strng;
    use crate::test_helpers::{ca_managers, mesh};

    fn provider(store: Arc<MemoryStore>) -> MeshCaProvider {
        MeshCaProvider::new(store, ca_managers())
    }

    fn identity(mesh: &str) -> Identity {
        Identity {
            mesh: strng::new(mesh),
            services: vec![strng::new("backend")],
        }
    }

    #[tokio::test]
    async fn serves_enabled_backend_root() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_mesh(mesh("m1", "ca-2", &["ca-1", "ca-2"]));
        let p = provider(store);
        let issued = p.get(&identity("m1"), None).await.unwrap();
        assert_eq!(issued.backend, "ca-2");
        let Secret::MeshCa { pem_certs } = issued.secret else {
            panic!("expected mesh ca");
        };
        assert_eq!(pem_certs.len(), 1);
        assert!(!p.requires_identity());
    }

    #[tokio::test]
    async fn resolution_failures() {
        let store = Arc::new(MemoryStore::new());
        let p = provider(store.clone());
        let err = p.get(&identity("m1"), None).await.unwrap_err();
        assert_eq!(err.to_string(), "mesh m1 not found");
        assert!(err.is_not_found());

        store.upsert_mesh(mesh("m1", "", &["ca-1"]));
        let err = p.get(&identity("m1"), None).await.unwrap_err();
        assert!(matches!(err, Error::NoEnabledBackend(_)), "{err}");

        store.upsert_mesh(mesh("m1", "ca-9", &["ca-1"]));
        let err = p.get(&identity("m1"), None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownBackend { .. }), "{err}");

        let mut m = mesh("m1", "ca-1", &["ca-1"]);
        m.mtls.as_mut().unwrap().backends[0].type_ = strng::new("vault");
        store.upsert_mesh(m);
        let err = p.get(&identity("m1"), None).await.unwrap_err();
        assert_eq!(err.to_string(), "no CA manager registered for backend type vault");
    }
}
