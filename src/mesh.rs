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

//! Mesh resource model: the proxy naming scheme, the Mesh and Dataplane
//! resources the control plane stores, and how a Dataplane turns into the
//! Identity it is allowed to request secrets for.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::strng;
use crate::strng::Strng;

/// Tag on an inbound or gateway that names the service it belongs to.
pub const SERVICE_TAG: &str = "kuma.io/service";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid node id {0:?}, expected <mesh>.<name>")]
    InvalidNodeId(String),
    #[error("dataplane {0} does not declare any service")]
    NoServices(ProxyId),
}

/// Uniquely names a connected proxy. Parsed from the node id of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProxyId {
    pub mesh: Strng,
    pub name: Strng,
}

impl ProxyId {
    pub fn new(mesh: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        ProxyId {
            mesh: strng::new(mesh),
            name: strng::new(name),
        }
    }

    /// Parses a node id of the form `<mesh>.<name>`. The name may itself contain dots
    /// (`<mesh>.<name>.<namespace>` on Kubernetes), so only the first one separates.
    pub fn from_node_id(id: &str) -> Result<Self, Error> {
        match id.split_once('.') {
            Some((mesh, name)) if !mesh.is_empty() && !name.is_empty() => {
                Ok(ProxyId::new(mesh, name))
            }
            _ => Err(Error::InvalidNodeId(id.to_string())),
        }
    }

    /// The namespace encoded in the proxy name, i.e. the part after its last dot.
    pub fn namespace(&self) -> Option<&str> {
        self.name
            .rsplit_once('.')
            .map(|(_, ns)| ns)
            .filter(|ns| !ns.is_empty())
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.mesh, self.name)
    }
}

/// The outcome of authentication: which services of which mesh a proxy may get secrets for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub mesh: Strng,
    pub services: Vec<Strng>,
}

impl Identity {
    /// SPIFFE ids for every service, in order.
    pub fn spiffe_ids(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|svc| format!("spiffe://{}/{}", self.mesh, svc))
            .collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mesh, self.services.iter().join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mesh {
    pub name: Strng,
    #[serde(default)]
    pub mtls: Option<Mtls>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mtls {
    /// Name of the active backend. Empty means mTLS is disabled.
    #[serde(default)]
    pub enabled_backend: Strng,
    #[serde(default)]
    pub backends: Vec<CaBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaBackend {
    pub name: Strng,
    #[serde(rename = "type")]
    pub type_: Strng,
    /// Backend specific settings, interpreted by the CA manager registered for `type_`.
    #[serde(default)]
    pub conf: BTreeMap<String, String>,
}

impl Mesh {
    pub fn mtls_enabled(&self) -> bool {
        self.mtls
            .as_ref()
            .is_some_and(|m| !m.enabled_backend.is_empty())
    }

    /// Name of the active CA backend, if mTLS is enabled.
    pub fn enabled_backend_name(&self) -> Option<&Strng> {
        self.mtls
            .as_ref()
            .map(|m| &m.enabled_backend)
            .filter(|n| !n.is_empty())
    }

    /// The active CA backend definition. `None` when mTLS is disabled or when
    /// the enabled backend name does not match any configured backend.
    pub fn enabled_backend(&self) -> Option<&CaBackend> {
        let name = self.enabled_backend_name()?;
        self.mtls
            .as_ref()?
            .backends
            .iter()
            .find(|b| &b.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataplane {
    pub mesh: Strng,
    pub name: Strng,
    #[serde(default)]
    pub networking: Networking,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    #[serde(default)]
    pub inbound: Vec<Inbound>,
    #[serde(default)]
    pub gateway: Option<Gateway>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Dataplane {
    pub fn proxy_id(&self) -> ProxyId {
        ProxyId {
            mesh: self.mesh.clone(),
            name: self.name.clone(),
        }
    }

    /// Service names this dataplane serves: one per distinct inbound service tag, in
    /// declaration order, or the gateway's service tag for a gateway.
    pub fn services(&self) -> Vec<Strng> {
        let inbound: Vec<Strng> = self
            .networking
            .inbound
            .iter()
            .filter_map(|i| i.tags.get(SERVICE_TAG))
            .filter(|s| !s.is_empty())
            .unique()
            .map(strng::new)
            .collect();
        if !inbound.is_empty() {
            return inbound;
        }
        self.networking
            .gateway
            .as_ref()
            .and_then(|g| g.tags.get(SERVICE_TAG))
            .filter(|s| !s.is_empty())
            .map(|s| vec![strng::new(s)])
            .unwrap_or_default()
    }

    pub fn identity(&self) -> Result<Identity, Error> {
        let services = self.services();
        if services.is_empty() {
            return Err(Error::NoServices(self.proxy_id()));
        }
        Ok(Identity {
            mesh: self.mesh.clone(),
            services,
        })
    }
}
