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
use bytes::Bytes;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Authenticator, Credential, Error, resolve_identity};
use crate::mesh::{Identity, ProxyId};
use crate::store::ResourceManager;

/// Claims of a dataplane token. A token names exactly one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub name: String,
    pub mesh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl Claims {
    pub fn proxy_id(&self) -> ProxyId {
        ProxyId::new(&self.mesh, &self.name)
    }
}

/// Shared HMAC key used to sign and verify dataplane tokens.
#[derive(Clone)]
pub struct SigningKey(Bytes);

impl SigningKey {
    pub fn new(key: impl Into<Bytes>) -> Self {
        SigningKey(key.into())
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.0),
        )
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Dataplane tokens are not required to expire; `exp` is checked when present.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.0),
            &validation,
        )?;
        Ok(data.claims)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// SignedTokenAuthenticator verifies tokens signed with a shared key. The proxy named in the
/// token must be exactly the proxy the stream claims to be.
pub struct SignedTokenAuthenticator {
    key: SigningKey,
    resources: Arc<dyn ResourceManager>,
}

impl SignedTokenAuthenticator {
    pub fn new(key: SigningKey, resources: Arc<dyn ResourceManager>) -> Self {
        SignedTokenAuthenticator { key, resources }
    }
}

#[async_trait]
impl Authenticator for SignedTokenAuthenticator {
    async fn authenticate(
        &self,
        proxy: &ProxyId,
        credential: Option<&Credential>,
    ) -> Result<Identity, Error> {
        let credential = credential.ok_or(Error::MissingCredential)?;
        let claims = self.key.verify(credential.as_str())?;
        if claims.mesh != proxy.mesh.as_str() || claims.name != proxy.name.as_str() {
            return Err(Error::ProxyMismatch {
                claimed: proxy.clone(),
                token: claims.proxy_id().to_string(),
            });
        }
        debug!(%proxy, "token verified");
        resolve_identity(self.resources.as_ref(), proxy).await
    }
}
