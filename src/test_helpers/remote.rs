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

//! An in-process stand-in for a Vault-style PKI secrets engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;

use crate::ca::CaManager;
use crate::ca::builtin::{self, BuiltinCaManager};
use crate::config::{RemoteSecretConfig, RootCert};
use crate::drain::{self, DrainTrigger};
use crate::hyper_util::{self, Body};
use crate::mesh::CaBackend;
use crate::strng;

pub const TOKEN: &str = "s.mock-remote-token";
pub const MOUNT_PREFIX: &str = "kuma-pki-";

struct State {
    ca: BuiltinCaManager,
    // mount -> roles
    mounts: Mutex<HashMap<String, HashSet<String>>>,
    last_token: Mutex<Option<String>>,
    // Strip the trailing newline of each PEM field, as Vault's PKI engine does.
    vault_pem: AtomicBool,
}

pub struct MockRemote {
    address: SocketAddr,
    state: Arc<State>,
    token_path: PathBuf,
    _drain: DrainTrigger,
}

impl MockRemote {
    pub async fn spawn() -> MockRemote {
        let (drain_tx, drain_rx) = drain::new();
        let state = Arc::new(State {
            ca: BuiltinCaManager::new(Duration::from_secs(60 * 60)),
            mounts: Default::default(),
            last_token: Default::default(),
            vault_pem: AtomicBool::new(false),
        });
        let server = hyper_util::Server::bind(
            "mock-remote",
            "127.0.0.1:0".parse().unwrap(),
            drain_rx,
            Duration::from_secs(1),
            state.clone(),
        )
        .await
        .unwrap();
        let address = server.address();
        server.spawn(|state, req| async move { Ok(handle(&state, req).await) });

        let token_path =
            std::env::temp_dir().join(format!("mesh-sds-remote-token-{}", address.port()));
        std::fs::write(&token_path, format!("{TOKEN}\n")).unwrap();
        MockRemote {
            address,
            state,
            token_path,
            _drain: drain_tx,
        }
    }

    /// Enables a PKI mount that can issue certificates for `roles`.
    pub fn provision(&self, mount: &str, roles: &[&str]) {
        self.state.mounts.lock().unwrap().insert(
            mount.to_string(),
            roles.iter().map(|r| r.to_string()).collect(),
        );
    }

    /// Returns PEM fields without a trailing newline after the END line.
    pub fn unterminated_pem(&self) {
        self.state.vault_pem.store(true, Ordering::Relaxed);
    }

    pub fn last_token(&self) -> Option<String> {
        self.state.last_token.lock().unwrap().clone()
    }

    pub fn config(&self) -> RemoteSecretConfig {
        RemoteSecretConfig {
            address: format!("http://{}", self.address),
            token_path: Some(self.token_path.clone()),
            mount_prefix: MOUNT_PREFIX.to_string(),
            root_cert: RootCert::Default,
        }
    }
}

impl Drop for MockRemote {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.token_path);
    }
}

fn json_response(code: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

fn pem_field(state: &State, pem: &[u8]) -> String {
    let pem = String::from_utf8_lossy(pem);
    if state.vault_pem.load(Ordering::Relaxed) {
        pem.trim_end().to_string()
    } else {
        pem.to_string()
    }
}

fn errors(code: StatusCode, msg: String) -> Response<Body> {
    json_response(code, json!({ "errors": [msg] }))
}

fn backend(mount: &str) -> CaBackend {
    CaBackend {
        name: strng::new(mount),
        type_: strng::new(builtin::TYPE),
        conf: BTreeMap::new(),
    }
}

async fn handle(state: &State, req: Request<Incoming>) -> Response<Body> {
    let token = req
        .headers()
        .get("X-Vault-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_token.lock().unwrap() = token;

    let path = req.uri().path().to_string();
    let Some(route) = path.strip_prefix("/v1/") else {
        return errors(StatusCode::NOT_FOUND, format!("no handler for route '{path}'"));
    };
    let mut parts = route.splitn(3, '/');
    let (mount, kind, rest) = (
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    );
    let roles = state.mounts.lock().unwrap().get(&mount).cloned();
    let Some(roles) = roles else {
        return errors(StatusCode::NOT_FOUND, format!("no handler for route '{route}'"));
    };
    let ca = &state.ca;
    let backend = backend(&mount);

    match (req.method().clone(), kind.as_str(), rest.as_str()) {
        (Method::GET, "cert", "ca_chain") => {
            let roots = ca.root_certs(&mount, &backend).await.unwrap();
            let chain: Vec<u8> = roots.concat();
            json_response(
                StatusCode::OK,
                json!({ "data": { "certificate": pem_field(state, &chain) } }),
            )
        }
        (Method::POST, "issue", role) => {
            if !roles.contains(role) {
                return errors(StatusCode::BAD_REQUEST, format!("unknown role: {role}"));
            }
            let body: Bytes = req.into_body().collect().await.unwrap().to_bytes();
            let request: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(e) => return errors(StatusCode::BAD_REQUEST, e.to_string()),
            };
            let common_name = request["common_name"].as_str().unwrap_or_default();
            let pair = ca
                .generate_workload_cert(&mount, &backend, &[strng::new(common_name)])
                .await
                .unwrap();
            let roots = ca.root_certs(&mount, &backend).await.unwrap();
            json_response(
                StatusCode::OK,
                json!({ "data": {
                    "certificate": pem_field(state, &pair.cert_pem),
                    "private_key": pem_field(state, &pair.key_pem),
                    "ca_chain": roots.iter().map(|r| pem_field(state, r)).collect::<Vec<_>>(),
                }}),
            )
        }
        _ => errors(StatusCode::NOT_FOUND, format!("no handler for route '{route}'")),
    }
}
