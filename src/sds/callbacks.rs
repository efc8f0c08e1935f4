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
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{Error, StreamId};
use crate::auth::{Authenticator, Credential};
use crate::mesh::{Identity, ProxyId};
use crate::xds::discovery::{DiscoveryRequest, DiscoveryResponse};

/// Callbacks observe the lifecycle of every stream. An error from `on_stream_open` or
/// `on_stream_request` terminates the stream with that error.
#[async_trait]
pub trait Callbacks: Send + Sync {
    async fn on_stream_open(&self, _stream_id: StreamId) -> Result<(), Error> {
        Ok(())
    }

    /// Called for every request that needs a response, before the secret is resolved.
    async fn on_stream_request(
        &self,
        _stream_id: StreamId,
        _proxy: &ProxyId,
        _request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_stream_response(&self, _stream_id: StreamId, _response: &DiscoveryResponse) {}

    async fn on_stream_closed(&self, _stream_id: StreamId) {}
}

/// CallbackChain invokes callbacks in order. The first error stops the chain.
#[derive(Default, Clone)]
pub struct CallbackChain(Vec<Arc<dyn Callbacks>>);

impl CallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, callbacks: impl Callbacks + 'static) -> Self {
        self.0.push(Arc::new(callbacks));
        self
    }

    pub fn push(&mut self, callbacks: Arc<dyn Callbacks>) {
        self.0.push(callbacks);
    }
}

#[async_trait]
impl Callbacks for CallbackChain {
    async fn on_stream_open(&self, stream_id: StreamId) -> Result<(), Error> {
        for cb in &self.0 {
            cb.on_stream_open(stream_id).await?;
        }
        Ok(())
    }

    async fn on_stream_request(
        &self,
        stream_id: StreamId,
        proxy: &ProxyId,
        request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        for cb in &self.0 {
            cb.on_stream_request(stream_id, proxy, request).await?;
        }
        Ok(())
    }

    async fn on_stream_response(&self, stream_id: StreamId, response: &DiscoveryResponse) {
        for cb in &self.0 {
            cb.on_stream_response(stream_id, response).await;
        }
    }

    async fn on_stream_closed(&self, stream_id: StreamId) {
        for cb in &self.0 {
            cb.on_stream_closed(stream_id).await;
        }
    }
}

/// What is known about a stream beyond its protocol state.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    /// Bearer credential from the stream's `authorization` metadata.
    pub credential: Option<Credential>,
    /// Set once the stream's proxy has been authenticated.
    pub identity: Option<Identity>,
}

/// StreamRegistry maps open streams to their context. Streams are registered when they are
/// accepted and removed once closed.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamId, StreamContext>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: StreamId, ctx: StreamContext) {
        self.streams.write().unwrap().insert(stream_id, ctx);
    }

    pub fn remove(&self, stream_id: StreamId) -> Option<StreamContext> {
        self.streams.write().unwrap().remove(&stream_id)
    }

    pub fn get(&self, stream_id: StreamId) -> Option<StreamContext> {
        self.streams.read().unwrap().get(&stream_id).cloned()
    }

    fn set_identity(&self, stream_id: StreamId, identity: Identity) -> Result<(), Error> {
        let mut streams = self.streams.write().unwrap();
        let ctx = streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        ctx.identity = Some(identity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// AuthCallbacks authenticates the proxy of a stream on every request, using the
/// credential captured when the stream was accepted.
pub struct AuthCallbacks {
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<StreamRegistry>,
}

impl AuthCallbacks {
    pub fn new(authenticator: Arc<dyn Authenticator>, registry: Arc<StreamRegistry>) -> Self {
        AuthCallbacks {
            authenticator,
            registry,
        }
    }
}

#[async_trait]
impl Callbacks for AuthCallbacks {
    async fn on_stream_open(&self, stream_id: StreamId) -> Result<(), Error> {
        if self.registry.get(stream_id).is_none() {
            return Err(Error::UnknownStream(stream_id));
        }
        Ok(())
    }

    async fn on_stream_request(
        &self,
        stream_id: StreamId,
        proxy: &ProxyId,
        _: &DiscoveryRequest,
    ) -> Result<(), Error> {
        let ctx = self
            .registry
            .get(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let identity = self
            .authenticator
            .authenticate(proxy, ctx.credential.as_ref())
            .await?;
        debug!(stream_id, %proxy, %identity, "authenticated");
        self.registry.set_identity(stream_id, identity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::auth;

    /// Records calls, failing requests when told to.
    struct Probe {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Callbacks for Probe {
        async fn on_stream_request(
            &self,
            stream_id: StreamId,
            _: &ProxyId,
            _: &DiscoveryRequest,
        ) -> Result<(), Error> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{stream_id}", self.name));
            if self.fail {
                return Err(Error::Unauthenticated(stream_id));
            }
            Ok(())
        }

        async fn on_stream_closed(&self, stream_id: StreamId) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:closed:{stream_id}", self.name));
        }
    }

    #[tokio::test]
    async fn first_error_wins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let probe = |name, fail| Probe {
            name,
            fail,
            calls: calls.clone(),
        };
        let chain = CallbackChain::new()
            .with(probe("a", false))
            .with(probe("b", true))
            .with(probe("c", false));
        let proxy = ProxyId::new("m1", "dp-1");
        let err = chain
            .on_stream_request(7, &proxy, &DiscoveryRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(7)));
        chain.on_stream_closed(7).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["a:7", "b:7", "a:closed:7", "b:closed:7", "c:closed:7"]
        );
    }

    /// Accepts exactly one token value.
    struct Fixed;

    #[async_trait]
    impl Authenticator for Fixed {
        async fn authenticate(
            &self,
            proxy: &ProxyId,
            credential: Option<&Credential>,
        ) -> Result<Identity, auth::Error> {
            match credential {
                Some(c) if c.as_str() == "good" => Ok(Identity {
                    mesh: proxy.mesh.clone(),
                    services: vec![proxy.name.clone()],
                }),
                Some(_) => Err(auth::Error::NotAuthenticated("bad token".to_string())),
                None => Err(auth::Error::MissingCredential),
            }
        }
    }

    #[tokio::test]
    async fn auth_records_identity() {
        let registry = Arc::new(StreamRegistry::new());
        let cb = AuthCallbacks::new(Arc::new(Fixed), registry.clone());
        let proxy = ProxyId::new("m1", "dp-1");
        let req = DiscoveryRequest::default();

        assert!(matches!(
            cb.on_stream_open(1).await,
            Err(Error::UnknownStream(1))
        ));

        registry.register(
            1,
            StreamContext {
                credential: Some(Credential::new("good")),
                identity: None,
            },
        );
        registry.register(2, StreamContext::default());
        cb.on_stream_open(1).await.unwrap();
        cb.on_stream_request(1, &proxy, &req).await.unwrap();
        assert_eq!(
            registry.get(1).unwrap().identity.unwrap().to_string(),
            "m1/dp-1"
        );

        let err = cb.on_stream_request(2, &proxy, &req).await.unwrap_err();
        assert!(matches!(err, Error::Auth(auth::Error::MissingCredential)));
        assert!(registry.get(2).unwrap().identity.is_none());
    }
}
