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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::drain::DrainWatcher;
use crate::hyper_util::{self, Body, empty_response, plaintext_response};
use crate::readiness::Ready;
use crate::tokens::{self, TokenIssuer};
use crate::{signal, telemetry};

/// State shared by every admin request.
pub struct State {
    pub issuer: Option<TokenIssuer>,
    pub registry: Arc<Mutex<Registry>>,
    pub ready: Ready,
    pub shutdown_trigger: signal::ShutdownTrigger,
}

/// Service serves the admin endpoints: dataplane tokens, metrics, readiness and log levels.
pub struct Service {
    s: hyper_util::Server<State>,
}

impl Service {
    pub async fn new(
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        deadline: Duration,
        state: State,
    ) -> std::io::Result<Self> {
        let s = hyper_util::Server::bind("admin", addr, drain_rx, deadline, state).await?;
        Ok(Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s
            .spawn(|state, req| async move { route(&state, req).await });
    }
}

pub(crate) async fn route<B>(state: &State, req: Request<B>) -> anyhow::Result<Response<Body>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    Ok(match req.uri().path() {
        "/token" => match &state.issuer {
            Some(issuer) => tokens::handle_token(issuer, req).await,
            None => plaintext_response(
                StatusCode::NOT_FOUND,
                "token issuing requires AUTH_MODE=token\n",
            ),
        },
        "/metrics" => handle_metrics(&state.registry)?,
        "/ready" => handle_ready(&state.ready),
        "/logging" => handle_logging(req),
        "/quitquitquit" => handle_server_shutdown(&state.shutdown_trigger, req).await,
        _ => empty_response(StatusCode::NOT_FOUND),
    })
}

fn handle_metrics(registry: &Mutex<Registry>) -> anyhow::Result<Response<Body>> {
    let mut buf = String::new();
    {
        let registry = registry.lock().unwrap();
        encode(&mut buf, &registry)?;
    }
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            hyper::header::CONTENT_TYPE,
            "application/openmetrics-text;charset=utf-8;version=1.0.0",
        )
        .body(Body::from(buf))?)
}

fn handle_ready(ready: &Ready) -> Response<Body> {
    let pending = ready.pending();
    if pending.is_empty() {
        plaintext_response(StatusCode::OK, "ready\n")
    } else {
        plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("not ready, pending: {}\n", pending.join(", ")),
        )
    }
}

async fn handle_server_shutdown<B>(
    shutdown_trigger: &signal::ShutdownTrigger,
    req: Request<B>,
) -> Response<Body> {
    match *req.method() {
        Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(StatusCode::OK, "shutdown now\n")
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

// Follows envoy's admin endpoint: https://www.envoyproxy.io/docs/envoy/latest/operations/admin#post--logging
// Only a single `level` parameter is understood.
static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}={level1},{mod2}={level2}\t(To change specific mods' logging level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. mesh_sds::sds
";

fn handle_logging<B>(req: Request<B>) -> Response<Body> {
    match *req.method() {
        Method::POST => {
            let qp: HashMap<String, String> = req
                .uri()
                .query()
                .map(|v| {
                    url::form_urlencoded::parse(v.as_bytes())
                        .into_owned()
                        .collect()
                })
                .unwrap_or_default();
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").cloned();
            if level.is_some() || reset.is_some() {
                change_log_level(reset.is_some(), &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Body> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => {
            plaintext_response(StatusCode::OK, format!("current log level is {loglevel}\n"))
        }
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Body> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}
