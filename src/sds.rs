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

//! The secret discovery service: the stream protocol served to proxies, and the
//! per-proxy snapshots it serves from.

use crate::mesh::ProxyId;
use crate::{auth, mesh, secrets, store, tls};

mod cache;
mod callbacks;
mod handler;
pub mod metrics;
mod reconciler;
mod server;
mod watchdog;

pub use cache::{Snapshot, SnapshotCache, SnapshotInfo, format_version, parse_version};
pub use callbacks::{AuthCallbacks, CallbackChain, Callbacks, StreamContext, StreamRegistry};
pub use handler::DiscoveryHandler;
pub use metrics::{ErrorClass, Outcome};
pub use reconciler::Reconciler;
pub use server::SdsServer;
pub use watchdog::Watchdogs;

/// Identifies a stream for its lifetime. Assigned in increasing order.
pub type StreamId = i64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request must name exactly one resource, got {0}")]
    ResourceNameCount(usize),
    #[error("resource name must not be empty")]
    EmptyResourceName,
    #[error("stream serves {pinned}, refusing request for {requested}")]
    PinnedResource { pinned: String, requested: String },
    #[error("unsupported type url {0:?}")]
    UnsupportedType(String),
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("node id changed on stream from {first} to {now}")]
    NodeChanged { first: ProxyId, now: ProxyId },
    #[error("response must carry exactly one resource, got {0}")]
    ResponseResourceCount(usize),
    #[error("invalid node: {0}")]
    Node(#[source] mesh::Error),
    #[error("stream {0} is not registered")]
    UnknownStream(StreamId),
    #[error("stream {0} has not been authenticated")]
    Unauthenticated(StreamId),
    #[error("authentication failed: {0}")]
    Auth(#[from] auth::Error),
    #[error(transparent)]
    Secrets(#[from] secrets::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("expected exactly one mesh named {mesh}, found {count}")]
    MeshCount { mesh: String, count: usize },
    #[error("failed to derive identity of {0}: {1}")]
    Identity(ProxyId, #[source] mesh::Error),
    #[error("malformed snapshot version {0:?}")]
    MalformedVersion(String),
    #[error("CA bundle issued by {mesh_ca} but identity certificate by {identity_cert}")]
    BackendMismatch {
        mesh_ca: String,
        identity_cert: String,
    },
    #[error("failed to read identity certificate: {0}")]
    Certificate(#[from] tls::Error),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ResourceNameCount(_)
            | Error::EmptyResourceName
            | Error::PinnedResource { .. }
            | Error::UnsupportedType(_)
            | Error::UnknownResource(_)
            | Error::NodeChanged { .. }
            | Error::ResponseResourceCount(_)
            | Error::Node(_) => ErrorClass::Protocol,
            Error::Auth(_) | Error::Unauthenticated(_) => ErrorClass::Authentication,
            Error::Secrets(secrets::Error::PermissionDenied) => ErrorClass::PermissionDenied,
            Error::Secrets(e) if e.is_not_found() => ErrorClass::NotFound,
            Error::Store(e) if e.is_not_found() => ErrorClass::NotFound,
            _ => ErrorClass::Internal,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        let msg = e.to_string();
        match e.class() {
            ErrorClass::Protocol => tonic::Status::invalid_argument(msg),
            ErrorClass::Authentication => tonic::Status::unauthenticated(msg),
            ErrorClass::NotFound => tonic::Status::not_found(msg),
            ErrorClass::PermissionDenied => tonic::Status::permission_denied(msg),
            ErrorClass::Internal => tonic::Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;
    use tonic::Code;

    use super::*;
    use crate::strng;

    #[test_case(Error::ResourceNameCount(2), Code::InvalidArgument; "name count")]
    #[test_case(Error::PinnedResource{pinned: "mesh_ca".into(), requested: "identity_cert".into()}, Code::InvalidArgument; "pinned")]
    #[test_case(Error::Auth(auth::Error::MissingCredential), Code::Unauthenticated; "auth")]
    #[test_case(Error::Secrets(secrets::Error::NoEnabledBackend(strng::new("m1"))), Code::NotFound; "no backend")]
    #[test_case(Error::Secrets(secrets::Error::PermissionDenied), Code::PermissionDenied; "denied")]
    #[test_case(Error::Secrets(secrets::Error::NoPki(strng::new("m1"))), Code::Internal; "remote")]
    #[test_case(Error::MalformedVersion("abc".into()), Code::Internal; "corrupt version")]
    fn status_code(err: Error, code: Code) {
        let msg = err.to_string();
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), code);
        assert_eq!(status.message(), msg);
    }
}
