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
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, info, instrument, warn};

use super::handler::now_nanos;
use super::metrics::{CertGenerated, Outcome, SnapshotGenerated};
use super::{Error, Snapshot, SnapshotCache, SnapshotInfo, format_version, parse_version};
use crate::mesh::{Dataplane, Identity, ProxyId};
use crate::metrics::{IncrementRecorder, Metrics, Recorder};
use crate::secrets::{self, Issued, Providers};
use crate::store::ResourceManager;
use crate::tls::Expiration;

/// Reconciler keeps the snapshot of a proxy consistent with its mesh's CA configuration.
#[derive(Clone)]
pub struct Reconciler {
    resources: Arc<dyn ResourceManager>,
    providers: Providers,
    cache: Arc<SnapshotCache>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        resources: Arc<dyn ResourceManager>,
        providers: Providers,
        cache: Arc<SnapshotCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Reconciler {
            resources,
            providers,
            cache,
            metrics,
        }
    }

    pub(super) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Regenerates the snapshot of `proxy` if it is missing or stale, and removes it when
    /// the proxy no longer needs secrets. Errors leave the cache untouched.
    #[instrument(name = "reconcile", skip_all, fields(proxy = %proxy))]
    pub async fn reconcile(&self, proxy: &ProxyId) -> Result<Outcome, Error> {
        let res = self.reconcile_inner(proxy).await;
        let outcome = res.as_ref().copied().unwrap_or(Outcome::Error);
        self.metrics.increment(&outcome);
        res
    }

    async fn reconcile_inner(&self, proxy: &ProxyId) -> Result<Outcome, Error> {
        let dataplane = match self.resources.get_dataplane(proxy).await {
            Ok(dp) => dp,
            Err(e) if e.is_not_found() => {
                info!("dataplane not found, clearing snapshot");
                self.cache.clear(proxy);
                return Ok(Outcome::Cleared);
            }
            Err(e) => return Err(e.into()),
        };

        let mut meshes = self.resources.list_meshes(Some(proxy.mesh.as_str())).await?;
        if meshes.len() != 1 {
            return Err(Error::MeshCount {
                mesh: proxy.mesh.to_string(),
                count: meshes.len(),
            });
        }
        let mesh = meshes.remove(0);
        let Some(backend) = mesh.enabled_backend_name().cloned() else {
            if self.cache.clear(proxy) {
                info!(mesh = %mesh.name, "mTLS disabled, cleared snapshot");
            }
            return Ok(Outcome::Cleared);
        };

        let identity = identity(&dataplane)?;
        let mut mesh_ca = None;
        if let Some(current) = self.cache.get(proxy) {
            let (_, cached_backend) = parse_version(&current.version)?;
            let reason = if cached_backend != backend.as_str() {
                Some("CA backend changed")
            } else if current.info.services != identity.services {
                Some("services changed")
            } else if current.info.expiration.expiring_soon(SystemTime::now()) {
                Some("certificate expiring")
            } else {
                let ca = self.providers.mesh_ca.get(&identity, None).await?;
                let changed = current.resources.get(&secrets::MESH_CA) != Some(&ca.secret);
                mesh_ca = Some(ca);
                changed.then_some("CA bundle changed")
            };
            match reason {
                Some(reason) => info!(reason, version = %current.version, "regenerating snapshot"),
                None => {
                    debug!(version = %current.version, "snapshot is fresh");
                    return Ok(Outcome::Skipped);
                }
            }
        }

        let started = Instant::now();
        let Issued {
            secret: identity_cert,
            backend: issued_by,
        } = self.providers.identity_cert.get(&identity, None).await?;
        // The CA bundle must come from the backend that signed the identity cert.
        let mesh_ca = match mesh_ca {
            Some(ca) if ca.backend == issued_by => ca,
            _ => self.providers.mesh_ca.get(&identity, None).await?,
        };
        if mesh_ca.backend != issued_by {
            return Err(Error::BackendMismatch {
                mesh_ca: mesh_ca.backend.to_string(),
                identity_cert: issued_by.to_string(),
            });
        }
        let expiration = match identity_cert.pem_certs().first() {
            Some(leaf) => Expiration::from_pem(leaf)?,
            None => {
                return Err(secrets::Error::InvalidResource(
                    "identity certificate has no certificates".to_string(),
                )
                .into());
            }
        };
        if expiration.expiring_soon(SystemTime::now()) {
            warn!(
                ?expiration,
                "issued certificate is already due for refresh, it will be regenerated every tick"
            );
        }

        if issued_by != backend {
            info!(%backend, %issued_by, "CA backend changed during generation");
        }
        let version = format_version(now_nanos(), &issued_by);
        let snapshot = Snapshot {
            version: version.clone(),
            resources: BTreeMap::from([
                (secrets::IDENTITY_CERT, identity_cert),
                (secrets::MESH_CA, mesh_ca.secret),
            ]),
            info: SnapshotInfo {
                generated: SystemTime::now(),
                expiration,
                services: identity.services,
            },
        };
        self.cache.set(proxy.clone(), snapshot);
        self.metrics.record(&SnapshotGenerated, started.elapsed());
        self.metrics.increment(&CertGenerated(&proxy.mesh));
        info!(version, "published snapshot");
        Ok(Outcome::Generated)
    }
}

fn identity(dataplane: &Dataplane) -> Result<Identity, Error> {
    dataplane
        .identity()
        .map_err(|e| Error::Identity(dataplane.proxy_id(), e))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use matches::assert_matches;

    use super::*;
    use crate::auth::Credential;
    use crate::secrets::{Secret, SecretProvider};
    use crate::store::MemoryStore;
    use crate::strng;
    use crate::test_helpers::{ca_managers, dataplane, mesh};

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<SnapshotCache>,
        reconciler: Reconciler,
        proxy: ProxyId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.upsert_mesh(mesh("m1", "ca-1", &["ca-1", "ca-2"]));
        store.upsert_dataplane(dataplane("m1", "dp-1", &["backend"]));
        let cache = Arc::new(SnapshotCache::new());
        let providers = Providers::local(store.clone(), ca_managers());
        let reconciler = Reconciler::new(
            store.clone(),
            providers,
            cache.clone(),
            Arc::new(Metrics::default()),
        );
        Fixture {
            store,
            cache,
            reconciler,
            proxy: ProxyId::new("m1", "dp-1"),
        }
    }

    #[tokio::test]
    async fn first_reconcile_publishes_both_secrets() {
        let f = fixture();
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Generated);
        let snap = f.cache.get(&f.proxy).unwrap();
        let (_, backend) = parse_version(&snap.version).unwrap();
        assert_eq!(backend, "ca-1");
        assert_eq!(snap.resources.len(), 2);
        assert_eq!(snap.info.services, vec![strng::new("backend")]);
        assert!(matches!(
            snap.resources[&secrets::IDENTITY_CERT],
            Secret::IdentityCert { .. }
        ));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        let writes = f.cache.writes();
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Skipped);
        assert_eq!(f.cache.writes(), writes);
    }

    #[tokio::test]
    async fn backend_change_regenerates() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        let before = f.cache.get(&f.proxy).unwrap();

        f.store.upsert_mesh(mesh("m1", "ca-2", &["ca-1", "ca-2"]));
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Generated);
        let after = f.cache.get(&f.proxy).unwrap();
        assert_eq!(parse_version(&after.version).unwrap().1, "ca-2");
        assert_ne!(
            before.resources[&secrets::MESH_CA],
            after.resources[&secrets::MESH_CA]
        );
        assert_ne!(
            before.resources[&secrets::IDENTITY_CERT],
            after.resources[&secrets::IDENTITY_CERT]
        );
    }

    #[tokio::test]
    async fn services_change_regenerates() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        f.store
            .upsert_dataplane(dataplane("m1", "dp-1", &["backend", "metrics"]));
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Generated);
        assert_eq!(
            f.cache.get(&f.proxy).unwrap().info.services,
            vec![strng::new("backend"), strng::new("metrics")]
        );
    }

    #[tokio::test]
    async fn disabling_mtls_clears() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        f.store.upsert_mesh(mesh("m1", "", &["ca-1"]));
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Cleared);
        assert!(f.cache.get(&f.proxy).is_none());
    }

    #[tokio::test]
    async fn deleted_dataplane_clears() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        f.store.delete_dataplane(&f.proxy);
        assert_eq!(f.reconciler.reconcile(&f.proxy).await.unwrap(), Outcome::Cleared);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn errors_leave_cache_alone() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        let writes = f.cache.writes();

        // enabled backend that is not defined
        f.store.upsert_mesh(mesh("m1", "ca-3", &["ca-1"]));
        let err = f.reconciler.reconcile(&f.proxy).await.unwrap_err();
        assert_matches!(err, Error::Secrets(secrets::Error::UnknownBackend { .. }));

        f.store.delete_mesh("m1");
        let err = f.reconciler.reconcile(&f.proxy).await.unwrap_err();
        assert_matches!(err, Error::MeshCount { count: 0, .. });
        assert_eq!(f.cache.writes(), writes);
    }

    #[tokio::test]
    async fn corrupt_version_is_an_error() {
        let f = fixture();
        f.reconciler.reconcile(&f.proxy).await.unwrap();
        let mut snap = (*f.cache.get(&f.proxy).unwrap()).clone();
        snap.version = "corrupt".to_string();
        f.cache.set(f.proxy.clone(), snap);
        let err = f.reconciler.reconcile(&f.proxy).await.unwrap_err();
        assert_matches!(err, Error::MalformedVersion(_));
    }

    /// Switches the mesh to `ca-2` right before issuing.
    struct SwitchBackend {
        store: Arc<MemoryStore>,
        inner: Arc<dyn SecretProvider>,
    }

    #[async_trait]
    impl SecretProvider for SwitchBackend {
        async fn get(
            &self,
            identity: &Identity,
            credential: Option<&Credential>,
        ) -> Result<Issued, secrets::Error> {
            self.store.upsert_mesh(mesh("m1", "ca-2", &["ca-1", "ca-2"]));
            self.inner.get(identity, credential).await
        }

        fn requires_identity(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn version_names_the_issuing_backend() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_mesh(mesh("m1", "ca-1", &["ca-1", "ca-2"]));
        store.upsert_dataplane(dataplane("m1", "dp-1", &["backend"]));
        let cache = Arc::new(SnapshotCache::new());
        let local = Providers::local(store.clone(), ca_managers());
        let providers = Providers {
            mesh_ca: local.mesh_ca.clone(),
            identity_cert: Arc::new(SwitchBackend {
                store: store.clone(),
                inner: local.identity_cert.clone(),
            }),
        };
        let reconciler = Reconciler::new(
            store.clone(),
            providers,
            cache.clone(),
            Arc::new(Metrics::default()),
        );
        let proxy = ProxyId::new("m1", "dp-1");

        assert_eq!(reconciler.reconcile(&proxy).await.unwrap(), Outcome::Generated);
        let snap = cache.get(&proxy).unwrap();
        assert_eq!(parse_version(&snap.version).unwrap().1, "ca-2");
        let identity = Identity {
            mesh: strng::new("m1"),
            services: vec![strng::new("backend")],
        };
        let ca = local.mesh_ca.get(&identity, None).await.unwrap();
        assert_eq!(ca.backend, "ca-2");
        assert_eq!(snap.resources[&secrets::MESH_CA], ca.secret);
    }
}
