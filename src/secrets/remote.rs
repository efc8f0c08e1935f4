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

//! Secrets issued by a remote, Vault-PKI shaped, secret management system. Every mesh has
//! its own PKI mount and every service a role of the same name on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{Error, Issued, Secret, SecretProvider, split_pem_blocks};
use crate::auth::Credential;
use crate::config::RemoteSecretConfig;
use crate::mesh::Identity;
use crate::store::ResourceManager;
use crate::strng::Strng;
use crate::{strng, tls};

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct CaChain {
    certificate: String,
}

#[derive(Deserialize)]
struct IssuedCert {
    certificate: String,
    private_key: String,
    #[serde(default)]
    ca_chain: Vec<String>,
}

#[derive(serde::Serialize)]
struct IssueRequest<'a> {
    common_name: &'a str,
    uri_sans: String,
}

/// RemoteClient talks to the remote secret management API. Cloning is cheap.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<Inner>,
}

struct Inner {
    address: String,
    token_path: Option<PathBuf>,
    mount_prefix: String,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    resources: Arc<dyn ResourceManager>,
}

impl RemoteClient {
    pub async fn new(
        cfg: RemoteSecretConfig,
        resources: Arc<dyn ResourceManager>,
    ) -> Result<Self, tls::Error> {
        let cc = tls::client_config(&cfg.root_cert).await?;
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(5)));
        http.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(cc)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(RemoteClient {
            inner: Arc::new(Inner {
                address: cfg.address.trim_end_matches('/').to_string(),
                token_path: cfg.token_path,
                mount_prefix: cfg.mount_prefix,
                client,
                resources,
            }),
        })
    }

    fn mount(&self, mesh: &str) -> String {
        format!("{}{}", self.inner.mount_prefix, mesh)
    }

    async fn token(&self) -> Result<Option<String>, Error> {
        let Some(path) = &self.inner.token_path else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Transport(format!("failed to read token {}: {e}", path.display())))?;
        Ok(Some(token.trim().to_string()))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), Error> {
        let uri = format!("{}{}", self.inner.address, path);
        let mut req = Request::builder().method(method).uri(&uri);
        if let Some(token) = self.token().await? {
            req = req.header(TOKEN_HEADER, token);
        }
        if body.is_some() {
            req = req.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let req = req
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Transport(e.to_string()))?;
        let res = self
            .inner
            .client
            .request(req)
            .await
            .map_err(|e| Error::Transport(format!("{uri}: {e}")))?;
        let status = res.status();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("{uri}: {e}")))?
            .to_bytes();
        debug!(%uri, %status, "remote secret backend response");
        Ok((status, body))
    }

    /// Labels what the remote issues with the mesh's enabled backend, so cached snapshots
    /// follow backend changes the same way locally issued ones do.
    async fn backend_name(&self, mesh: &str) -> Result<Strng, Error> {
        let m = self.inner.resources.get_mesh(mesh).await.map_err(|e| {
            if e.is_not_found() {
                Error::MeshNotFound(strng::new(mesh))
            } else {
                Error::Store(e)
            }
        })?;
        m.enabled_backend_name()
            .cloned()
            .ok_or_else(|| Error::NoEnabledBackend(m.name.clone()))
    }

    #[instrument(skip_all, fields(mesh=%identity.mesh))]
    pub async fn ca_chain(&self, identity: &Identity) -> Result<Vec<Bytes>, Error> {
        let path = format!("/v1/{}/cert/ca_chain", self.mount(&identity.mesh));
        let (status, body) = self.call(Method::GET, &path, None).await?;
        check_status(status, &body, identity)?;
        let chain: Envelope<CaChain> = parse(&body)?;
        Ok(split_pem_blocks(chain.data.certificate.as_bytes()))
    }

    #[instrument(skip_all, fields(%identity))]
    pub async fn issue(&self, identity: &Identity) -> Result<(Vec<Bytes>, Bytes), Error> {
        let Some(role) = identity.services.first() else {
            return Err(Error::NoServices(identity.mesh.clone()));
        };
        let path = format!("/v1/{}/issue/{}", self.mount(&identity.mesh), role);
        let req = IssueRequest {
            common_name: role,
            uri_sans: identity.spiffe_ids().join(","),
        };
        let body = serde_json::to_vec(&req).map_err(|e| Error::Transport(e.to_string()))?;
        let (status, body) = self.call(Method::POST, &path, Some(body)).await?;
        check_status(status, &body, identity)?;
        let issued: Envelope<IssuedCert> = parse(&body)?;
        let mut certs = split_pem_blocks(issued.data.certificate.as_bytes());
        if certs.is_empty() {
            return Err(Error::InvalidResource(
                "remote secret backend returned no certificate".to_string(),
            ));
        }
        for c in &issued.data.ca_chain {
            certs.extend(split_pem_blocks(c.as_bytes()));
        }
        Ok((certs, Bytes::from(issued.data.private_key)))
    }
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| {
        Error::InvalidResource(format!("unexpected remote secret backend response: {e}"))
    })
}

/// Translates the error taxonomy of the remote system into domain errors.
fn check_status(status: StatusCode, body: &[u8], identity: &Identity) -> Result<(), Error> {
    if status.is_success() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(body);
    let err = if status == StatusCode::NOT_FOUND || text.contains("no handler for route") {
        Error::NoPki(identity.mesh.clone())
    } else if text.contains("unknown role") {
        Error::NoRole {
            mesh: identity.mesh.clone(),
            service: identity.services.first().cloned().unwrap_or_default(),
        }
    } else if status == StatusCode::FORBIDDEN || text.contains("permission denied") {
        Error::PermissionDenied
    } else {
        Error::Remote {
            status: status.as_u16(),
            body: text.trim().to_string(),
        }
    };
    warn!(%status, "remote secret backend refused request: {err}");
    Err(err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    MeshCa,
    IdentityCert,
}

/// RemoteSecretProvider serves one of the two secrets from a RemoteClient. The remote
/// system's own access token authorizes issuance, so no request credential is needed.
pub struct RemoteSecretProvider {
    client: RemoteClient,
    kind: Kind,
}

impl RemoteSecretProvider {
    pub fn mesh_ca(client: RemoteClient) -> Self {
        RemoteSecretProvider {
            client,
            kind: Kind::MeshCa,
        }
    }

    pub fn identity_cert(client: RemoteClient) -> Self {
        RemoteSecretProvider {
            client,
            kind: Kind::IdentityCert,
        }
    }
}

#[async_trait]
impl SecretProvider for RemoteSecretProvider {
    async fn get(&self, identity: &Identity, _: Option<&Credential>) -> Result<Issued, Error> {
        let backend = self.client.backend_name(&identity.mesh).await?;
        let secret = match self.kind {
            Kind::MeshCa => Secret::MeshCa {
                pem_certs: self.client.ca_chain(identity).await?,
            },
            Kind::IdentityCert => {
                let (pem_certs, pem_key) = self.client.issue(identity).await?;
                Secret::IdentityCert { pem_certs, pem_key }
            }
        };
        Ok(Issued { secret, backend })
    }

    fn requires_identity(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_helpers::mesh;
    use crate::test_helpers::remote::MockRemote;

    fn identity() -> Identity {
        Identity {
            mesh: strng::new("m1"),
            services: vec![strng::new("backend")],
        }
    }

    async fn client(remote: &MockRemote) -> RemoteClient {
        let store = Arc::new(MemoryStore::new());
        store.upsert_mesh(mesh("m1", "vault-1", &["vault-1"]));
        RemoteClient::new(remote.config(), store).await.unwrap()
    }

    #[tokio::test]
    async fn issues_from_remote() {
        let remote = MockRemote::spawn().await;
        remote.provision("kuma-pki-m1", &["backend"]);
        let c = client(&remote).await;

        let ca = RemoteSecretProvider::mesh_ca(c.clone())
            .get(&identity(), None)
            .await
            .unwrap();
        assert_eq!(ca.backend, "vault-1");
        assert_eq!(ca.secret.pem_certs().len(), 1);

        let id = RemoteSecretProvider::identity_cert(c)
            .get(&identity(), None)
            .await
            .unwrap();
        let Secret::IdentityCert { pem_certs, pem_key } = id.secret else {
            panic!("expected identity cert");
        };
        // leaf followed by the issuing CA
        assert_eq!(pem_certs.len(), 2);
        assert!(pem_key.starts_with(b"-----BEGIN"));
        assert_eq!(
            remote.last_token().as_deref(),
            Some(crate::test_helpers::remote::TOKEN)
        );
    }

    #[tokio::test]
    async fn unterminated_pem_chain() {
        let remote = MockRemote::spawn().await;
        remote.provision("kuma-pki-m1", &["backend"]);
        remote.unterminated_pem();
        let c = client(&remote).await;

        let id = RemoteSecretProvider::identity_cert(c)
            .get(&identity(), None)
            .await
            .unwrap();
        assert_eq!(id.secret.pem_certs().len(), 2);
        for cert in id.secret.pem_certs() {
            assert!(cert.ends_with(b"-----END CERTIFICATE-----\n"), "{cert:?}");
        }

        let (_, decoded) = Secret::from_any(&id.secret.to_any("identity_cert")).unwrap();
        assert_eq!(decoded.pem_certs().len(), 2);
        assert_eq!(decoded, id.secret);
    }

    #[tokio::test]
    async fn no_pki_for_mesh() {
        let remote = MockRemote::spawn().await;
        let c = client(&remote).await;
        let err = RemoteSecretProvider::identity_cert(c)
            .get(&identity(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no PKI enabled for mesh"), "{err}");
    }

    #[tokio::test]
    async fn unknown_role() {
        let remote = MockRemote::spawn().await;
        remote.provision("kuma-pki-m1", &["web"]);
        let c = client(&remote).await;
        let err = RemoteSecretProvider::identity_cert(c)
            .get(&identity(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no role for service `backend` in mesh `m1`");
    }

    #[test]
    fn status_translation() {
        let id = identity();
        assert!(check_status(StatusCode::OK, b"", &id).is_ok());
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN, br#"{"errors":["permission denied"]}"#, &id),
            Err(Error::PermissionDenied)
        ));
        assert!(matches!(
            check_status(
                StatusCode::BAD_REQUEST,
                br#"{"errors":["no handler for route 'kuma-pki-m1/issue/backend'"]}"#,
                &id
            ),
            Err(Error::NoPki(_))
        ));
        let err = check_status(StatusCode::BAD_GATEWAY, b"upstream down\n", &id).unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote secret backend returned 502: upstream down"
        );
    }
}
