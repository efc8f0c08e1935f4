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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::time;

use mesh_sds::auth::SigningKey;
use mesh_sds::config::{AuthMode, Config, ConfigSource};
use mesh_sds::test_helpers::initialize_telemetry;

const LOCAL_RESOURCES: &str = r#"
meshes:
- name: default
  mtls:
    enabledBackend: ca-1
    backends:
    - name: ca-1
      type: builtin
dataplanes:
- mesh: default
  name: web-1
  networking:
    inbound:
    - port: 8080
      tags:
        kuma.io/service: web
"#;

fn test_config() -> Config {
    Config {
        sds_addr: "127.0.0.1:0".parse().unwrap(),
        admin_addr: "127.0.0.1:0".parse().unwrap(),
        auth_mode: AuthMode::Token,
        token_signing_key: Some(ConfigSource::Static(Bytes::from_static(b"app-test-key"))),
        local_resources: Some(ConfigSource::Static(Bytes::from_static(
            LOCAL_RESOURCES.as_bytes(),
        ))),
        termination_grace_period: Duration::from_secs(1),
        num_worker_threads: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn shutdown_lifecycle() {
    initialize_telemetry();

    let app = mesh_sds::app::build(Arc::new(test_config())).await.unwrap();

    let shutdown = app.shutdown.trigger().clone();
    let (app, _shutdown) = tokio::join!(
        time::timeout(Duration::from_secs(5), app.wait_termination()),
        shutdown.shutdown_now()
    );
    app.expect("app shuts down")
        .expect("app exits without error")
}

// A port conflict on any address fails the build instead of silently failing.
async fn bind_conflict<F: FnOnce(&mut Config) -> &mut SocketAddr>(f: F) {
    initialize_telemetry();
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config();
    let sa = f(&mut cfg);
    *sa = l.local_addr().unwrap();
    let app = mesh_sds::app::build(Arc::new(cfg)).await;
    assert!(app.is_err(), "expected bind conflict");
}

#[tokio::test]
async fn sds_bind_conflict() {
    bind_conflict(|c| &mut c.sds_addr).await;
}

#[tokio::test]
async fn admin_bind_conflict() {
    bind_conflict(|c| &mut c.admin_addr).await;
}

#[tokio::test]
async fn token_mode_requires_key() {
    initialize_telemetry();
    let cfg = Config {
        token_signing_key: None,
        ..test_config()
    };
    assert!(mesh_sds::app::build(Arc::new(cfg)).await.is_err());
}

#[tokio::test]
async fn admin_issues_tokens_and_reports_ready() {
    initialize_telemetry();
    let app = mesh_sds::app::build(Arc::new(test_config())).await.unwrap();
    let admin = app.admin_address;
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();

    let mut ready = false;
    for _ in 0..50 {
        let resp = client
            .get(format!("http://{admin}/ready").parse().unwrap())
            .await
            .unwrap();
        if resp.status() == StatusCode::OK {
            ready = true;
            break;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ready, "server never became ready");

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{admin}/token"))
        .body(Full::new(Bytes::from_static(
            br#"{"name":"web-1","mesh":"default"}"#,
        )))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let token = resp.into_body().collect().await.unwrap().to_bytes();
    let claims = SigningKey::new("app-test-key")
        .verify(std::str::from_utf8(&token).unwrap())
        .unwrap();
    assert_eq!(claims.name, "web-1");
    assert_eq!(claims.mesh, "default");

    drop(client);
    app.drain().await;
}
