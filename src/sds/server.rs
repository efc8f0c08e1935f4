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

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{Instrument, debug, info, info_span, warn};

use super::metrics::{ResponseSent, StreamClosed, StreamOpened};
use super::{
    CallbackChain, Callbacks, DiscoveryHandler, Error, SnapshotCache, StreamContext,
    StreamId, StreamRegistry,
};
use crate::auth::Credential;
use crate::drain::DrainWatcher;
use crate::mesh::{Identity, ProxyId};
use crate::metrics::{IncrementRecorder, Metrics};
use crate::xds::discovery::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use crate::xds::sds::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use crate::xds::{self, DisplayErrorDetail};

const AUTHORIZATION: &str = "authorization";

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
type Responses = mpsc::Sender<Result<DiscoveryResponse, Status>>;

/// SdsServer serves secrets over `StreamSecrets`. Each stream is processed by its own
/// task, fed by a reader task through a bounded queue.
#[derive(Clone)]
pub struct SdsServer {
    inner: Arc<Inner>,
}

struct Inner {
    handler: DiscoveryHandler,
    callbacks: CallbackChain,
    registry: Arc<StreamRegistry>,
    cache: Arc<SnapshotCache>,
    metrics: Arc<Metrics>,
    queue_size: usize,
    next_stream_id: AtomicI64,
    drain: DrainWatcher,
}

impl SdsServer {
    pub fn new(
        handler: DiscoveryHandler,
        callbacks: CallbackChain,
        registry: Arc<StreamRegistry>,
        cache: Arc<SnapshotCache>,
        metrics: Arc<Metrics>,
        queue_size: usize,
        drain: DrainWatcher,
    ) -> Self {
        SdsServer {
            inner: Arc::new(Inner {
                handler,
                callbacks,
                registry,
                cache,
                metrics,
                queue_size,
                next_stream_id: AtomicI64::new(1),
                drain,
            }),
        }
    }

    pub fn into_service(self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self)
    }

    async fn open(
        &self,
        credential: Option<Credential>,
    ) -> Result<StreamId, Error> {
        let inner = &self.inner;
        let stream_id = inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
        inner.registry.register(
            stream_id,
            StreamContext {
                credential,
                identity: None,
            },
        );
        if let Err(e) = inner.callbacks.on_stream_open(stream_id).await {
            inner.registry.remove(stream_id);
            return Err(e);
        }
        Ok(stream_id)
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for SdsServer {
    type DeltaSecretsStream = ResponseStream<DeltaDiscoveryResponse>;

    async fn delta_secrets(
        &self,
        _: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Status::unimplemented("DeltaSecrets is not implemented"))
    }

    type StreamSecretsStream = ResponseStream<DiscoveryResponse>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let credential = request
            .metadata()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Credential::from_authorization);
        let stream_id = self.open(credential).await.map_err(|e| {
            warn!("rejected stream: {e}");
            Status::from(e)
        })?;

        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let stream = StreamProcessor {
            server: self.inner.clone(),
            state: StreamState::new(stream_id),
        };
        tokio::spawn(
            stream
                .run(request.into_inner(), tx)
                .instrument(info_span!("sds", stream_id)),
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn fetch_secrets(
        &self,
        _: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented("FetchSecrets is not implemented"))
    }
}

/// Per stream protocol state. Owned by the stream's processing task only.
#[derive(Debug)]
struct StreamState {
    stream_id: StreamId,
    /// The only resource this stream serves, set by its first request.
    pinned: Option<String>,
    last_nonce: u64,
    proxy: Option<ProxyId>,
    identity: Option<Identity>,
    /// Version of the last response, used to push snapshot changes.
    last_version: Option<String>,
}

impl StreamState {
    fn new(stream_id: StreamId) -> Self {
        StreamState {
            stream_id,
            pinned: None,
            last_nonce: 0,
            proxy: None,
            identity: None,
            last_version: None,
        }
    }

    /// Checks the resource names of a request that names at least one resource, pinning
    /// the first one served.
    fn validate(&mut self, names: &[String]) -> Result<String, Error> {
        let [name] = names else {
            return Err(Error::ResourceNameCount(names.len()));
        };
        if name.is_empty() {
            return Err(Error::EmptyResourceName);
        }
        match &self.pinned {
            Some(pinned) if pinned != name => Err(Error::PinnedResource {
                pinned: pinned.clone(),
                requested: name.clone(),
            }),
            Some(_) => Ok(name.clone()),
            None => {
                self.pinned = Some(name.clone());
                Ok(name.clone())
            }
        }
    }

    fn check_proxy(&mut self, req: &DiscoveryRequest) -> Result<ProxyId, Error> {
        let proxy = ProxyId::from_node_id(xds::node_id(req)).map_err(Error::Node)?;
        match &self.proxy {
            Some(first) if first != &proxy => Err(Error::NodeChanged {
                first: first.clone(),
                now: proxy,
            }),
            Some(_) => Ok(proxy),
            None => {
                self.proxy = Some(proxy.clone());
                Ok(proxy)
            }
        }
    }

    fn is_ack(&self, req: &DiscoveryRequest) -> bool {
        self.last_nonce > 0 && xds::acked_nonce(req) == Some(self.last_nonce.to_string().as_str())
    }
}

struct StreamProcessor {
    server: Arc<Inner>,
    state: StreamState,
}

/// Pulls requests off the wire until the stream ends or the processor stops.
async fn read_requests(
    mut requests: Streaming<DiscoveryRequest>,
    queue: mpsc::Sender<Result<DiscoveryRequest, Status>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let msg = tokio::select! {
            _ = &mut stop => return,
            msg = requests.message() => msg,
        };
        let item = match msg {
            Ok(Some(req)) => Ok(req),
            Ok(None) => return,
            Err(status) => Err(status),
        };
        let last = item.is_err();
        tokio::select! {
            _ = &mut stop => return,
            res = queue.send(item) => if res.is_err() { return },
        }
        if last {
            return;
        }
    }
}

impl StreamProcessor {
    async fn run(mut self, requests: Streaming<DiscoveryRequest>, responses: Responses) {
        let server = self.server.clone();
        let stream_id = self.state.stream_id;
        let _stream_metric = server.metrics.increment_defer::<_, StreamClosed>(&StreamOpened);
        debug!("stream opened");

        let (queue_tx, queue_rx) = mpsc::channel(server.queue_size);
        let (stop_tx, stop_rx) = oneshot::channel();
        let reader = tokio::spawn(read_requests(requests, queue_tx, stop_rx).in_current_span());

        let res = self.process(queue_rx, &responses).await;
        // stop the reader
        drop(stop_tx);
        let _ = reader.await;

        match res {
            Ok(()) => debug!("stream closed"),
            Err(e) => {
                server.metrics.increment(&e.class());
                warn!(proxy = ?self.state.proxy, "stream terminated: {e}");
                let _ = responses.send(Err(e.into())).await;
            }
        }
        server.callbacks.on_stream_closed(stream_id).await;
        server.registry.remove(stream_id);
    }

    async fn process(
        &mut self,
        mut queue: mpsc::Receiver<Result<DiscoveryRequest, Status>>,
        responses: &Responses,
    ) -> Result<(), Error> {
        let server = self.server.clone();
        let mut changes = server.cache.subscribe();
        let drain = server.drain.clone().wait_for_drain();
        tokio::pin!(drain);
        loop {
            tokio::select! {
                _ = responses.closed() => {
                    debug!("client went away");
                    return Ok(());
                }
                release = &mut drain => {
                    info!("draining stream");
                    drop(release);
                    return Ok(());
                }
                req = queue.recv() => match req {
                    None => return Ok(()),
                    Some(Err(status)) => {
                        debug!("stream read failed: {status}");
                        return Ok(());
                    }
                    Some(Ok(req)) => self.handle_request(req, responses).await?,
                },
                Ok(()) = changes.changed(), if self.state.identity.is_some() => {
                    self.push_snapshot(responses).await?;
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        req: DiscoveryRequest,
        responses: &Responses,
    ) -> Result<(), Error> {
        if !req.type_url.is_empty() && req.type_url != xds::SECRET_TYPE.as_str() {
            return Err(Error::UnsupportedType(req.type_url));
        }
        if req.resource_names.is_empty() {
            // Sent by proxies tearing down listeners that referenced the secret.
            debug!("ignoring request without resource names");
            return Ok(());
        }
        let name = self.state.validate(&req.resource_names)?;
        if self.state.is_ack(&req) {
            match &req.error_detail {
                Some(detail) => warn!(
                    nonce = %req.response_nonce,
                    resource = %name,
                    "proxy rejected secret: {}",
                    DisplayErrorDetail(detail)
                ),
                None => debug!(nonce = %req.response_nonce, "ack"),
            }
            return Ok(());
        }

        let proxy = self.state.check_proxy(&req)?;
        let stream_id = self.state.stream_id;
        self.server
            .callbacks
            .on_stream_request(stream_id, &proxy, &req)
            .await?;
        let identity = self
            .server
            .registry
            .get(stream_id)
            .and_then(|ctx| ctx.identity)
            .ok_or(Error::Unauthenticated(stream_id))?;
        self.state.identity = Some(identity);
        self.respond(responses).await
    }

    /// Sends the current snapshot when it changed since the last response.
    async fn push_snapshot(&mut self, responses: &Responses) -> Result<(), Error> {
        let (Some(proxy), Some(name)) = (&self.state.proxy, &self.state.pinned) else {
            return Ok(());
        };
        let Some(snapshot) = self.server.cache.get(proxy) else {
            return Ok(());
        };
        if !snapshot.resources.contains_key(name.as_str())
            || self.state.last_version.as_deref() == Some(snapshot.version.as_str())
        {
            return Ok(());
        }
        debug!(version = %snapshot.version, "pushing updated snapshot");
        self.respond(responses).await
    }

    async fn respond(&mut self, responses: &Responses) -> Result<(), Error> {
        let stream_id = self.state.stream_id;
        let (Some(proxy), Some(identity), Some(name)) =
            (&self.state.proxy, &self.state.identity, &self.state.pinned)
        else {
            return Err(Error::Unauthenticated(stream_id));
        };
        let credential = self
            .server
            .registry
            .get(stream_id)
            .and_then(|ctx| ctx.credential);
        let (version, secret) = self
            .server
            .handler
            .resolve(proxy, identity, name, credential.as_ref())
            .await?;

        let nonce = self.state.last_nonce + 1;
        let response = DiscoveryResponse {
            version_info: version.clone(),
            resources: vec![secret.to_any(name)],
            type_url: xds::SECRET_TYPE.to_string(),
            nonce: nonce.to_string(),
            ..Default::default()
        };
        if response.resources.len() != 1 {
            return Err(Error::ResponseResourceCount(response.resources.len()));
        }
        if responses.send(Ok(response.clone())).await.is_err() {
            // the client is gone; the processing loop notices on its next iteration
            return Ok(());
        }
        debug!(resource = %name, %version, nonce, "sent response");
        self.server
            .metrics
            .increment(&ResponseSent(name.as_str()));
        self.state.last_nonce = nonce;
        self.state.last_version = Some(version);
        self.server
            .callbacks
            .on_stream_response(stream_id, &response)
            .await;
        Ok(())
    }
}
