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

//! Bootstrap tokens for dataplanes. A token issued here is accepted by the
//! signed-token authenticator configured with the same key.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::{Claims, SigningKey};
use crate::hyper_util::{Body, empty_response, plaintext_response};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("invalid token request: {0}")]
    Request(#[from] serde_json::Error),
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Sign(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    mesh: String,
}

/// TokenIssuer signs dataplane tokens.
#[derive(Clone, Debug)]
pub struct TokenIssuer {
    key: SigningKey,
}

impl TokenIssuer {
    pub fn new(key: SigningKey) -> Self {
        TokenIssuer { key }
    }

    pub fn issue(&self, name: &str, mesh: &str) -> Result<String, Error> {
        if name.is_empty() {
            return Err(Error::EmptyField("name"));
        }
        if mesh.is_empty() {
            return Err(Error::EmptyField("mesh"));
        }
        let claims = Claims {
            name: name.to_string(),
            mesh: mesh.to_string(),
            exp: None,
        };
        Ok(self.key.sign(&claims)?)
    }

    async fn issue_from<B>(&self, body: B) -> Result<String, Error>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let body = body
            .collect()
            .await
            .map_err(|e| Error::Body(e.to_string()))?
            .to_bytes();
        let req: TokenRequest = serde_json::from_slice(&body)?;
        let token = self.issue(&req.name, &req.mesh)?;
        debug!(name = %req.name, mesh = %req.mesh, "issued dataplane token");
        Ok(token)
    }
}

/// Serves `POST /token` with a `{"name": .., "mesh": ..}` body.
pub async fn handle_token<B>(issuer: &TokenIssuer, req: Request<B>) -> Response<Body>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if req.method() != Method::POST {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    match issuer.issue_from(req.into_body()).await {
        Ok(token) => plaintext_response(StatusCode::OK, token),
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                warn!("token request failed: {e}");
            }
            plaintext_response(status, format!("{e}\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::Full;
    use matches::assert_matches;

    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(SigningKey::new("secret"))
    }

    fn post(body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/token")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_string(resp: Response<Body>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn issued_token_verifies() {
        let resp = handle_token(&issuer(), post(r#"{"name":"web-1","mesh":"default"}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let token = body_string(resp).await;
        let claims = SigningKey::new("secret").verify(&token).unwrap();
        assert_eq!(claims.name, "web-1");
        assert_eq!(claims.mesh, "default");
        assert!(SigningKey::new("other").verify(&token).is_err());
    }

    #[tokio::test]
    async fn bad_requests() {
        for body in ["not json", r#"{"name":"","mesh":"default"}"#, r#"{"name":"web-1"}"#] {
            let resp = handle_token(&issuer(), post(body)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn only_post() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/token")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = handle_token(&issuer(), req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn empty_fields() {
        assert_matches!(issuer().issue("", "m"), Err(Error::EmptyField("name")));
        assert_matches!(issuer().issue("n", ""), Err(Error::EmptyField("mesh")));
    }
}
