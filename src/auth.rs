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

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::mesh::{self, Identity, ProxyId};
use crate::store::{self, ResourceManager};
use crate::strng;
use crate::strng::Strng;

mod platform;
mod token;

pub use platform::{KubeTokenReviewer, PlatformTokenAuthenticator, ReviewedUser, TokenReviewer};
pub use token::{Claims, SignedTokenAuthenticator, SigningKey};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token was issued for proxy {token} but presented by {claimed}")]
    ProxyMismatch { claimed: ProxyId, token: String },
    #[error("token review failed: {0}")]
    TokenReview(String),
    #[error("token is not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("token belongs to namespace {token:?} but proxy {proxy} is in namespace {expected:?}")]
    NamespaceMismatch {
        proxy: ProxyId,
        expected: String,
        token: String,
    },
    #[error("dataplane {0} not found")]
    DataplaneNotFound(ProxyId),
    #[error("failed to resolve dataplane {0}: {1}")]
    Store(ProxyId, #[source] store::Error),
    #[error(transparent)]
    Identity(#[from] mesh::Error),
}

/// An opaque bearer credential presented out of band on a stream.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Strng);

impl Credential {
    pub fn new(s: impl AsRef<str>) -> Self {
        Credential(strng::new(s))
    }

    /// Parses an `authorization` value. The `Bearer ` prefix is optional.
    pub fn from_authorization(value: &str) -> Option<Self> {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if token.is_empty() {
            None
        } else {
            Some(Credential::new(token))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Authenticator verifies the credential of a proxy claiming to be `proxy` and resolves
/// what that proxy may request. Implementations fail closed.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        proxy: &ProxyId,
        credential: Option<&Credential>,
    ) -> Result<Identity, Error>;
}

/// Looks up the Dataplane of `proxy` and derives its Identity.
pub(crate) async fn resolve_identity(
    resources: &dyn ResourceManager,
    proxy: &ProxyId,
) -> Result<Identity, Error> {
    let dp = resources.get_dataplane(proxy).await.map_err(|e| {
        if e.is_not_found() {
            Error::DataplaneNotFound(proxy.clone())
        } else {
            Error::Store(proxy.clone(), e)
        }
    })?;
    Ok(dp.identity()?)
}

/// NoopAuthenticator trusts the claimed proxy id. It still requires the Dataplane to exist.
pub struct NoopAuthenticator {
    resources: Arc<dyn ResourceManager>,
}

impl NoopAuthenticator {
    pub fn new(resources: Arc<dyn ResourceManager>) -> Self {
        NoopAuthenticator { resources }
    }
}

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate(
        &self,
        proxy: &ProxyId,
        _: Option<&Credential>,
    ) -> Result<Identity, Error> {
        resolve_identity(self.resources.as_ref(), proxy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_helpers::dataplane;

    #[test]
    fn credential_from_authorization() {
        assert_eq!(
            Credential::from_authorization("Bearer abc.def").unwrap().as_str(),
            "abc.def"
        );
        assert_eq!(Credential::from_authorization("abc").unwrap().as_str(), "abc");
        assert_eq!(Credential::from_authorization("Bearer "), None);
        assert_eq!(Credential::from_authorization(""), None);
        assert_eq!(
            format!("{:?}", Credential::new("secret")),
            "Credential(<redacted>)"
        );
    }

    #[tokio::test]
    async fn noop_resolves_dataplane() {
        let store = Arc::new(MemoryStore::new());
        let auth = NoopAuthenticator::new(store.clone());
        let proxy = ProxyId::new("m1", "dp-1");
        assert!(matches!(
            auth.authenticate(&proxy, None).await,
            Err(Error::DataplaneNotFound(_))
        ));

        store.upsert_dataplane(dataplane("m1", "dp-1", &["backend"]));
        let id = auth.authenticate(&proxy, None).await.unwrap();
        assert_eq!(id.to_string(), "m1/backend");

        store.upsert_dataplane(dataplane("m1", "dp-1", &[]));
        assert!(matches!(
            auth.authenticate(&proxy, None).await,
            Err(Error::Identity(mesh::Error::NoServices(_)))
        ));
    }
}
