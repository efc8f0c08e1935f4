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

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::ConfigSource;
use crate::mesh::{Dataplane, Mesh, ProxyId};
use crate::strng::Strng;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("resource store unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Error::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// ResourceManager resolves the Mesh and Dataplane resources secrets are derived from.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn get_dataplane(&self, proxy: &ProxyId) -> Result<Dataplane, Error>;

    async fn get_mesh(&self, name: &str) -> Result<Mesh, Error>;

    /// Lists meshes, restricted to the mesh called `name` when set.
    async fn list_meshes(&self, name: Option<&str>) -> Result<Vec<Mesh>, Error>;
}

#[derive(Default, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalResources {
    #[serde(default)]
    pub meshes: Vec<Mesh>,
    #[serde(default)]
    pub dataplanes: Vec<Dataplane>,
}

#[derive(Default, Debug)]
struct Resources {
    meshes: BTreeMap<Strng, Mesh>,
    dataplanes: BTreeMap<ProxyId, Dataplane>,
}

/// MemoryStore keeps resources in memory. It is populated from a local YAML file or
/// mutated directly.
#[derive(Default, Debug)]
pub struct MemoryStore {
    resources: RwLock<Resources>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip_all, name = "local_resources")]
    pub async fn load(source: &ConfigSource) -> anyhow::Result<Self> {
        let r: LocalResources = serde_yaml::from_str(&source.read_to_string().await?)?;
        let store = Self::new();
        store.replace(r);
        Ok(store)
    }

    /// Replaces the whole content of the store.
    pub fn replace(&self, r: LocalResources) {
        let num_meshes = r.meshes.len();
        let num_dataplanes = r.dataplanes.len();
        let mut resources = self.resources.write().unwrap();
        resources.meshes = r.meshes.into_iter().map(|m| (m.name.clone(), m)).collect();
        resources.dataplanes = r
            .dataplanes
            .into_iter()
            .map(|dp| (dp.proxy_id(), dp))
            .collect();
        info!(%num_meshes, %num_dataplanes, "local resources loaded");
    }

    pub fn upsert_mesh(&self, mesh: Mesh) {
        debug!(mesh=%mesh.name, "upsert mesh");
        let mut resources = self.resources.write().unwrap();
        resources.meshes.insert(mesh.name.clone(), mesh);
    }

    pub fn delete_mesh(&self, name: &str) -> Option<Mesh> {
        self.resources.write().unwrap().meshes.remove(name)
    }

    pub fn upsert_dataplane(&self, dp: Dataplane) {
        debug!(proxy=%dp.proxy_id(), "upsert dataplane");
        let mut resources = self.resources.write().unwrap();
        resources.dataplanes.insert(dp.proxy_id(), dp);
    }

    pub fn delete_dataplane(&self, proxy: &ProxyId) -> Option<Dataplane> {
        self.resources.write().unwrap().dataplanes.remove(proxy)
    }
}

#[async_trait]
impl ResourceManager for MemoryStore {
    async fn get_dataplane(&self, proxy: &ProxyId) -> Result<Dataplane, Error> {
        self.resources
            .read()
            .unwrap()
            .dataplanes
            .get(proxy)
            .cloned()
            .ok_or_else(|| Error::not_found("dataplane", proxy))
    }

    async fn get_mesh(&self, name: &str) -> Result<Mesh, Error> {
        self.resources
            .read()
            .unwrap()
            .meshes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("mesh", name))
    }

    async fn list_meshes(&self, name: Option<&str>) -> Result<Vec<Mesh>, Error> {
        let resources = self.resources.read().unwrap();
        Ok(resources
            .meshes
            .values()
            .filter(|m| name.is_none_or(|n| m.name == n))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::test_helpers::{dataplane, mesh};

    #[tokio::test]
    async fn not_found_is_distinguishable() {
        let store = MemoryStore::new();
        let err = store
            .get_dataplane(&ProxyId::new("m1", "dp-1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "dataplane m1.dp-1 not found");
        assert!(store.get_mesh("m1").await.unwrap_err().is_not_found());
        assert!(!Error::Unavailable("down".to_string()).is_not_found());
    }

    #[tokio::test]
    async fn list_meshes_filters_by_name() {
        let store = MemoryStore::new();
        store.upsert_mesh(mesh("m1", "ca-1", &["ca-1"]));
        store.upsert_mesh(mesh("m2", "", &[]));
        assert_eq!(store.list_meshes(None).await.unwrap().len(), 2);
        let m1 = store.list_meshes(Some("m1")).await.unwrap();
        assert_eq!(m1.len(), 1);
        assert_eq!(m1[0].name, "m1");
        assert!(store.list_meshes(Some("m3")).await.unwrap().is_empty());

        store.delete_mesh("m1");
        assert!(store.list_meshes(Some("m1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_and_delete_dataplane() {
        let store = MemoryStore::new();
        let dp = dataplane("m1", "dp-1", &["backend"]);
        store.upsert_dataplane(dp.clone());
        assert_eq!(store.get_dataplane(&dp.proxy_id()).await.unwrap(), dp);
        assert_eq!(store.delete_dataplane(&dp.proxy_id()), Some(dp.clone()));
        assert!(store.get_dataplane(&dp.proxy_id()).await.is_err());
    }

    #[tokio::test]
    async fn load_local_resources() {
        let yaml = r#"
meshes:
- name: default
  mtls:
    enabledBackend: ca-1
    backends:
    - name: ca-1
      type: builtin
dataplanes:
- mesh: default
  name: backend-01
  networking:
    inbound:
    - port: 8080
      tags:
        kuma.io/service: backend
"#;
        let store = MemoryStore::load(&ConfigSource::Static(Bytes::from_static(yaml.as_bytes())))
            .await
            .unwrap();
        let dp = store
            .get_dataplane(&ProxyId::new("default", "backend-01"))
            .await
            .unwrap();
        assert_eq!(dp.identity().unwrap().services, vec!["backend"]);
        assert!(store.get_mesh("default").await.unwrap().mtls_enabled());
    }

    #[tokio::test]
    async fn load_rejects_unknown_fields() {
        let yaml = "workloads: []";
        let res = MemoryStore::load(&ConfigSource::Static(Bytes::from_static(yaml.as_bytes()))).await;
        assert!(res.is_err());
    }
}
