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
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::{Error, SnapshotCache, format_version};
use crate::auth::Credential;
use crate::mesh::{Identity, ProxyId};
use crate::secrets::{Providers, Secret};

/// DiscoveryHandler resolves a requested resource name to a secret, serving the proxy's
/// cached snapshot when there is one and asking the provider otherwise.
#[derive(Clone)]
pub struct DiscoveryHandler {
    providers: Providers,
    cache: Arc<SnapshotCache>,
}

impl DiscoveryHandler {
    pub fn new(providers: Providers, cache: Arc<SnapshotCache>) -> Self {
        DiscoveryHandler { providers, cache }
    }

    /// Returns the version and secret to serve for `name`.
    pub async fn resolve(
        &self,
        proxy: &ProxyId,
        identity: &Identity,
        name: &str,
        credential: Option<&Credential>,
    ) -> Result<(String, Secret), Error> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| Error::UnknownResource(name.to_string()))?;
        if let Some(snapshot) = self.cache.get(proxy) {
            if let Some(secret) = snapshot.resources.get(name) {
                return Ok((snapshot.version.clone(), secret.clone()));
            }
        }
        debug!(%proxy, name, "no cached snapshot, asking provider");
        let credential = if provider.requires_identity() {
            credential
        } else {
            None
        };
        let issued = provider.get(identity, credential).await?;
        Ok((format_version(now_nanos(), &issued.backend), issued.secret))
    }
}

pub(super) fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::sds::{Snapshot, SnapshotInfo, parse_version};
    use crate::secrets::{self, Issued, SecretProvider};
    use crate::strng;
    use crate::tls::Expiration;

    /// Hands out a fixed CA and remembers which credential it was called with.
    #[derive(Default)]
    struct Recording {
        requires_identity: bool,
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl SecretProvider for Recording {
        async fn get(
            &self,
            _: &Identity,
            credential: Option<&Credential>,
        ) -> Result<Issued, secrets::Error> {
            self.seen
                .lock()
                .unwrap()
                .push(credential.map(|c| c.as_str().to_string()));
            Ok(Issued {
                secret: Secret::MeshCa {
                    pem_certs: vec![Bytes::from_static(b"ca")],
                },
                backend: strng::new("ca-1"),
            })
        }

        fn requires_identity(&self) -> bool {
            self.requires_identity
        }
    }

    fn handler(ca: Arc<Recording>, cache: Arc<SnapshotCache>) -> DiscoveryHandler {
        let providers = Providers {
            mesh_ca: ca.clone(),
            identity_cert: ca,
        };
        DiscoveryHandler::new(providers, cache)
    }

    fn identity() -> Identity {
        Identity {
            mesh: strng::new("m1"),
            services: vec![strng::new("backend")],
        }
    }

    #[tokio::test]
    async fn pull_through() {
        let ca = Arc::new(Recording::default());
        let h = handler(ca.clone(), Arc::new(SnapshotCache::new()));
        let proxy = ProxyId::new("m1", "dp-1");
        let cred = Credential::new("token");
        let (version, secret) = h
            .resolve(&proxy, &identity(), "mesh_ca", Some(&cred))
            .await
            .unwrap();
        assert_eq!(parse_version(&version).unwrap().1, "ca-1");
        assert_eq!(secret.pem_certs(), &[Bytes::from_static(b"ca")]);
        // the provider trusts the authenticated identity, so it never sees the credential
        assert_eq!(*ca.seen.lock().unwrap(), vec![None]);

        let ca = Arc::new(Recording {
            requires_identity: true,
            ..Default::default()
        });
        let h = handler(ca.clone(), Arc::new(SnapshotCache::new()));
        h.resolve(&proxy, &identity(), "identity_cert", Some(&cred))
            .await
            .unwrap();
        assert_eq!(*ca.seen.lock().unwrap(), vec![Some("token".to_string())]);
    }

    #[tokio::test]
    async fn serves_cached_snapshot() {
        let ca = Arc::new(Recording::default());
        let cache = Arc::new(SnapshotCache::new());
        let proxy = ProxyId::new("m1", "dp-1");
        let cached = Secret::MeshCa {
            pem_certs: vec![Bytes::from_static(b"cached")],
        };
        let now = SystemTime::now();
        cache.set(
            proxy.clone(),
            Snapshot {
                version: "42-ca-1".to_string(),
                resources: BTreeMap::from([(secrets::MESH_CA, cached.clone())]),
                info: SnapshotInfo {
                    generated: now,
                    expiration: Expiration {
                        not_before: now,
                        not_after: now,
                    },
                    services: vec![],
                },
            },
        );
        let h = handler(ca.clone(), cache);
        let got = h.resolve(&proxy, &identity(), "mesh_ca", None).await.unwrap();
        assert_eq!(got, ("42-ca-1".to_string(), cached));
        assert!(ca.seen.lock().unwrap().is_empty());

        let err = h
            .resolve(&proxy, &identity(), "bogus", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownResource(_)));
    }
}
