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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, warn};

use crate::drain::{self, DrainWatcher};

pub type Body = Full<Bytes>;

pub fn empty_response(code: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = code;
    resp
}

pub fn plaintext_response(code: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    resp
}

fn http1_server() -> http1::Builder {
    let mut b = http1::Builder::new();
    b.timer(TokioTimer::new())
        .half_close(true)
        .header_read_timeout(Duration::from_secs(2))
        .max_buf_size(8 * 1024);
    b
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1 plaintext only
/// * Draining
pub struct Server<S> {
    name: String,
    address: SocketAddr,
    listener: TcpListener,
    drain_rx: DrainWatcher,
    deadline: Duration,
    state: S,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        deadline: Duration,
        s: S,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            address,
            listener,
            drain_rx,
            deadline,
            state: s,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Body>, anyhow::Error>> + Send + 'static,
    {
        let address = self.address;
        let name = self.name;
        let state = Arc::new(self.state);
        let f = Arc::new(f);
        let listener = self.listener;
        info!(%address, component = name, "listener established");
        tokio::spawn(
            drain::run_with_drain(
                name.clone(),
                self.drain_rx,
                self.deadline,
                move |drain, _force_shutdown| async move {
                    loop {
                        let (socket, peer) = match listener.accept().await {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!("{name}: failed to accept connection: {e}");
                                continue;
                            }
                        };
                        let _ = socket.set_nodelay(true);
                        let state = state.clone();
                        let f = f.clone();
                        let drain = drain.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            let svc = hyper::service::service_fn(move |req| {
                                let state = state.clone();
                                let f = f.clone();
                                async move {
                                    Ok::<_, Infallible>(match f(state, req).await {
                                        Ok(resp) => resp,
                                        Err(e) => plaintext_response(
                                            StatusCode::INTERNAL_SERVER_ERROR,
                                            format!("{e}\n"),
                                        ),
                                    })
                                }
                            });
                            let conn = http1_server().serve_connection(TokioIo::new(socket), svc);
                            tokio::pin!(conn);
                            let res = tokio::select! {
                                res = conn.as_mut() => res,
                                blocker = drain.wait_for_drain() => {
                                    conn.as_mut().graceful_shutdown();
                                    let res = conn.await;
                                    drop(blocker);
                                    res
                                }
                            };
                            if let Err(e) = res {
                                debug!(%peer, "{name}: connection ended with error: {e}");
                            }
                        });
                    }
                },
            )
            .in_current_span(),
        );
    }
}
