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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::time;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{Instrument, error, info, warn};

use crate::auth::{
    Authenticator, KubeTokenReviewer, NoopAuthenticator, PlatformTokenAuthenticator,
    SignedTokenAuthenticator, SigningKey,
};
use crate::ca::builtin::{self, BuiltinCaManager};
use crate::ca::provided::{self, ProvidedCaManager};
use crate::ca::CaManagers;
use crate::config::{self, AuthMode};
use crate::drain::{self, DrainMode};
use crate::metrics::Metrics;
use crate::sds::{
    AuthCallbacks, CallbackChain, DiscoveryHandler, Reconciler, SdsServer, SnapshotCache,
    StreamRegistry, Watchdogs,
};
use crate::secrets::Providers;
use crate::secrets::remote::RemoteClient;
use crate::store::{MemoryStore, ResourceManager};
use crate::tokens::TokenIssuer;
use crate::{admin, readiness, signal};

/// The collaborators the secret discovery server is assembled from.
pub struct Components {
    pub resources: Arc<dyn ResourceManager>,
    pub providers: Providers,
    pub authenticator: Arc<dyn Authenticator>,
    /// Set when the admin server should issue dataplane tokens.
    pub issuer: Option<TokenIssuer>,
}

impl Components {
    pub async fn from_config(config: &config::Config) -> anyhow::Result<Self> {
        let resources: Arc<dyn ResourceManager> = match &config.local_resources {
            Some(source) => Arc::new(
                MemoryStore::load(source)
                    .await
                    .with_context(|| format!("load local resources from {source:?}"))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };

        let providers = match &config.remote_secret {
            Some(remote) => {
                info!(address = %remote.address, "issuing secrets from remote backend");
                let client = RemoteClient::new(remote.clone(), resources.clone())
                    .await
                    .context("remote secret backend client")?;
                Providers::remote(client)
            }
            None => Providers::local(resources.clone(), ca_managers(config)),
        };

        let mut issuer = None;
        let authenticator: Arc<dyn Authenticator> = match config.auth_mode {
            AuthMode::Token => {
                let source = config
                    .token_signing_key
                    .as_ref()
                    .ok_or(config::Error::MissingSigningKey)?;
                let key = SigningKey::new(source.read().await.context("read token signing key")?);
                issuer = Some(TokenIssuer::new(key.clone()));
                Arc::new(SignedTokenAuthenticator::new(key, resources.clone()))
            }
            AuthMode::Kubernetes => {
                let client = kube::Client::try_default()
                    .await
                    .context("kubernetes client")?;
                let reviewer = Arc::new(KubeTokenReviewer::new(client, None));
                Arc::new(PlatformTokenAuthenticator::new(reviewer, resources.clone()))
            }
            AuthMode::None => {
                warn!("proxy authentication is disabled");
                Arc::new(NoopAuthenticator::new(resources.clone()))
            }
        };

        Ok(Components {
            resources,
            providers,
            authenticator,
            issuer,
        })
    }
}

fn ca_managers(config: &config::Config) -> CaManagers {
    CaManagers::new()
        .with(builtin::TYPE, BuiltinCaManager::new(config.cert_validity))
        .with(provided::TYPE, ProvidedCaManager::new(config.cert_validity))
}

pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    let components = Components::from_config(&config).await?;
    build_with(config, components).await
}

pub async fn build_with(
    config: Arc<config::Config>,
    components: Components,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));

    let shutdown = signal::Shutdown::new();
    // Draining completes once every watcher is dropped. Components that need time to finish
    // hold a watcher; the grace period bounds how long they get.
    let (drain_tx, drain_rx) = drain::new();

    let ready = readiness::Ready::new();
    let sds_task = ready.register_task("sds listener");

    let Components {
        resources,
        providers,
        authenticator,
        issuer,
    } = components;

    let cache = Arc::new(SnapshotCache::new());
    let streams = Arc::new(StreamRegistry::new());
    let reconciler = Reconciler::new(resources, providers.clone(), cache.clone(), metrics.clone());
    let callbacks = CallbackChain::new()
        .with(AuthCallbacks::new(authenticator, streams.clone()))
        .with(Watchdogs::new(
            reconciler,
            cache.clone(),
            config.reconcile_interval,
        ));
    let handler = DiscoveryHandler::new(providers, cache.clone());

    let admin_server = admin::Service::new(
        config.admin_addr,
        drain_rx.clone(),
        config.termination_grace_period,
        admin::State {
            issuer,
            registry: Arc::new(Mutex::new(registry)),
            ready: ready.clone(),
            shutdown_trigger: shutdown.trigger(),
        },
    )
    .await
    .context("admin server starts")?;
    let admin_address = admin_server.address();

    let sds_listener =
        std::net::TcpListener::bind(config.sds_addr).context("sds listener binds")?;
    sds_listener.set_nonblocking(true)?;
    let sds_address = sds_listener.local_addr()?;

    admin_server.spawn();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_worker_threads)
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("mesh-sds-{id}")
        })
        .enable_all()
        .build()
        .context("sds runtime")?;
    let shutdown_trigger = shutdown.trigger();
    let queue_size = config.stream_queue_size;
    let deadline = config.termination_grace_period;
    let span = tracing::Span::current();
    thread::spawn(move || {
        let _span = span.enter();
        runtime.block_on(
            drain::run_with_drain(
                "sds".to_string(),
                drain_rx,
                deadline,
                move |drain, _force_shutdown| async move {
                    let listener = match tokio::net::TcpListener::from_std(sds_listener) {
                        Ok(l) => l,
                        Err(e) => {
                            error!("sds listener failed: {e}");
                            shutdown_trigger.shutdown_now().await;
                            return;
                        }
                    };
                    let server = SdsServer::new(
                        handler,
                        callbacks,
                        streams,
                        cache,
                        metrics,
                        queue_size,
                        drain,
                    );
                    info!(address = %sds_address, component = "sds", "listener established");
                    drop(sds_task);
                    let res = tonic::transport::Server::builder()
                        .add_service(server.into_service())
                        .serve_with_incoming(TcpListenerStream::new(listener))
                        .await;
                    if let Err(e) = res {
                        error!("sds server failed: {e}");
                        shutdown_trigger.shutdown_now().await;
                    }
                },
            )
            .in_current_span(),
        );
    });

    Ok(Bound {
        sds_address,
        admin_address,
        shutdown,
        config,
        drain_tx,
    })
}

pub struct Bound {
    pub sds_address: SocketAddr,
    pub admin_address: SocketAddr,

    pub shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    drain_tx: drain::DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        let Bound {
            shutdown,
            config,
            drain_tx,
            ..
        } = self;
        // Wait for a signal to shutdown from explicit admin shutdown or signal
        shutdown.wait().await;
        drain(drain_tx, config.termination_grace_period).await;
        Ok(())
    }

    /// Drains every server without waiting for a shutdown request.
    pub async fn drain(self) {
        drain(self.drain_tx, self.config.termination_grace_period).await
    }
}

// Starts a drain; in-flight streams get the grace period to finish before being dropped.
async fn drain(drain_tx: drain::DrainTrigger, grace: Duration) {
    match time::timeout(grace, drain_tx.start_drain_and_wait(DrainMode::Graceful)).await {
        Ok(()) => info!("Shutdown completed gracefully"),
        Err(_) => warn!("Graceful shutdown did not complete in {grace:?}, terminating now"),
    }
}
