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

//! Runs the full secret discovery server in process, for tests that talk to it over TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use super::ca_managers;
use crate::app::{self, Bound, Components};
use crate::auth::{Claims, SignedTokenAuthenticator, SigningKey};
use crate::config::{AuthMode, Config, ConfigSource};
use crate::secrets::Providers;
use crate::store::MemoryStore;
use crate::tokens::TokenIssuer;
use crate::xds::base::Node;
use crate::xds::discovery::{DiscoveryRequest, DiscoveryResponse};
use crate::xds::sds::secret_discovery_service_client::SecretDiscoveryServiceClient;

const SIGNING_KEY: &str = "test-signing-key";

pub struct TestSds {
    pub sds_address: SocketAddr,
    pub admin_address: SocketAddr,
    pub store: Arc<MemoryStore>,
    key: SigningKey,
    bound: Bound,
}

/// A request stream opened against the server.
pub struct TestStream {
    pub requests: mpsc::Sender<DiscoveryRequest>,
    pub responses: Streaming<DiscoveryResponse>,
}

impl TestStream {
    pub async fn send(&self, req: DiscoveryRequest) {
        self.requests.send(req).await.unwrap();
    }

    /// The next response, or `None` if nothing arrives within `wait`.
    pub async fn recv_within(
        &mut self,
        wait: Duration,
    ) -> Option<Result<DiscoveryResponse, Status>> {
        match tokio::time::timeout(wait, self.responses.message()).await {
            Ok(Ok(Some(resp))) => Some(Ok(resp)),
            Ok(Ok(None)) => None,
            Ok(Err(status)) => Some(Err(status)),
            Err(_) => None,
        }
    }

    pub async fn recv(&mut self) -> Result<DiscoveryResponse, Status> {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("expected a response")
    }
}

impl TestSds {
    pub async fn spawn() -> TestSds {
        super::initialize_telemetry();
        let store = Arc::new(MemoryStore::new());
        let key = SigningKey::new(SIGNING_KEY);
        let config = Arc::new(Config {
            sds_addr: "127.0.0.1:0".parse().unwrap(),
            admin_addr: "127.0.0.1:0".parse().unwrap(),
            auth_mode: AuthMode::Token,
            token_signing_key: Some(ConfigSource::Static(Bytes::from_static(
                SIGNING_KEY.as_bytes(),
            ))),
            reconcile_interval: Duration::from_millis(100),
            termination_grace_period: Duration::from_secs(1),
            num_worker_threads: 1,
            ..Default::default()
        });
        let components = Components {
            resources: store.clone(),
            providers: Providers::local(store.clone(), ca_managers()),
            authenticator: Arc::new(SignedTokenAuthenticator::new(key.clone(), store.clone())),
            issuer: Some(TokenIssuer::new(key.clone())),
        };
        let bound = app::build_with(config, components).await.unwrap();
        TestSds {
            sds_address: bound.sds_address,
            admin_address: bound.admin_address,
            store,
            key,
            bound,
        }
    }

    pub fn token(&self, mesh: &str, name: &str) -> String {
        self.key
            .sign(&Claims {
                name: name.to_string(),
                mesh: mesh.to_string(),
                exp: None,
            })
            .unwrap()
    }

    pub async fn client(&self) -> SecretDiscoveryServiceClient<Channel> {
        let channel = Channel::from_shared(format!("http://{}", self.sds_address))
            .unwrap()
            .connect()
            .await
            .unwrap();
        SecretDiscoveryServiceClient::new(channel)
    }

    /// Opens a stream presenting `token` as its credential.
    pub async fn open(&self, token: Option<&str>) -> Result<TestStream, Status> {
        let (tx, rx) = mpsc::channel(8);
        let mut req = tonic::Request::new(ReceiverStream::new(rx));
        if let Some(token) = token {
            req.metadata_mut()
                .insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        let responses = self.client().await.stream_secrets(req).await?.into_inner();
        Ok(TestStream {
            requests: tx,
            responses,
        })
    }

    /// Fetches an admin endpoint, returning the status code and body.
    pub async fn admin_get(&self, path: &str) -> (u16, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let resp = client
            .get(format!("http://{}{path}", self.admin_address).parse().unwrap())
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    pub async fn shutdown(self) {
        self.bound.drain().await
    }
}

/// A request for `name` from the proxy with node id `node_id` (`<mesh>.<name>`).
pub fn request(node_id: &str, name: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(Node {
            id: node_id.to_string(),
            ..Default::default()
        }),
        resource_names: vec![name.to_string()],
        ..Default::default()
    }
}

/// Acknowledges `resp`.
pub fn ack(node_id: &str, name: &str, resp: &DiscoveryResponse) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: resp.version_info.clone(),
        response_nonce: resp.nonce.clone(),
        ..request(node_id, name)
    }
}
