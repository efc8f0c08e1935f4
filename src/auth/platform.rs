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
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use super::{Authenticator, Credential, Error, resolve_identity};
use crate::mesh::{Identity, ProxyId};
use crate::store::ResourceManager;

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// The user a platform token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewedUser {
    pub username: String,
}

impl ReviewedUser {
    /// Namespace of a service account user (`system:serviceaccount:<ns>:<name>`).
    pub fn namespace(&self) -> Option<&str> {
        let rest = self.username.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
        rest.split_once(':').map(|(ns, _)| ns)
    }
}

/// TokenReviewer delegates token verification to the platform.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn review(&self, token: &str) -> Result<ReviewedUser, Error>;
}

/// KubeTokenReviewer submits tokens to the Kubernetes TokenReview API.
pub struct KubeTokenReviewer {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl KubeTokenReviewer {
    pub fn new(client: Client, audiences: Option<Vec<String>>) -> Self {
        KubeTokenReviewer { client, audiences }
    }
}

fn reviewed_user(status: TokenReviewStatus) -> Result<ReviewedUser, Error> {
    if !status.authenticated.unwrap_or(false) {
        return Err(Error::NotAuthenticated(
            status
                .error
                .unwrap_or_else(|| "token authentication failed".to_string()),
        ));
    }
    let username = status
        .user
        .and_then(|u| u.username)
        .ok_or_else(|| Error::TokenReview("authenticated user has no username".to_string()))?;
    Ok(ReviewedUser { username })
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<ReviewedUser, Error> {
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };
        let result = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| Error::TokenReview(e.to_string()))?;
        let status = result
            .status
            .ok_or_else(|| Error::TokenReview("no status returned".to_string()))?;
        reviewed_user(status)
    }
}

/// PlatformTokenAuthenticator accepts platform issued service account tokens. The token's
/// namespace must be the namespace encoded in the proxy name.
pub struct PlatformTokenAuthenticator {
    reviewer: Arc<dyn TokenReviewer>,
    resources: Arc<dyn ResourceManager>,
}

impl PlatformTokenAuthenticator {
    pub fn new(reviewer: Arc<dyn TokenReviewer>, resources: Arc<dyn ResourceManager>) -> Self {
        PlatformTokenAuthenticator {
            reviewer,
            resources,
        }
    }
}

#[async_trait]
impl Authenticator for PlatformTokenAuthenticator {
    async fn authenticate(
        &self,
        proxy: &ProxyId,
        credential: Option<&Credential>,
    ) -> Result<Identity, Error> {
        let credential = credential.ok_or(Error::MissingCredential)?;
        let user = self.reviewer.review(credential.as_str()).await?;
        let expected = proxy.namespace().unwrap_or_default();
        let token_ns = user.namespace().unwrap_or_default();
        if expected.is_empty() || token_ns != expected {
            return Err(Error::NamespaceMismatch {
                proxy: proxy.clone(),
                expected: expected.to_string(),
                token: token_ns.to_string(),
            });
        }
        debug!(%proxy, username=%user.username, "token reviewed");
        resolve_identity(self.resources.as_ref(), proxy).await
    }
}
