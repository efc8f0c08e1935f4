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

use std::collections::BTreeMap;
use std::time::Duration;

use crate::ca::CaManagers;
use crate::ca::builtin::{self, BuiltinCaManager};
use crate::mesh::{CaBackend, Dataplane, Gateway, Inbound, Mesh, Mtls, Networking, SERVICE_TAG};
use crate::strng;

pub mod remote;
pub mod sds;

/// A mesh with builtin CA backends. An empty `enabled` disables mTLS.
pub fn mesh(name: &str, enabled: &str, backends: &[&str]) -> Mesh {
    Mesh {
        name: strng::new(name),
        mtls: Some(Mtls {
            enabled_backend: strng::new(enabled),
            backends: backends
                .iter()
                .map(|b| CaBackend {
                    name: strng::new(b),
                    type_: strng::new(builtin::TYPE),
                    conf: BTreeMap::new(),
                })
                .collect(),
        }),
    }
}

/// A dataplane with one inbound per service.
pub fn dataplane(mesh: &str, name: &str, services: &[&str]) -> Dataplane {
    Dataplane {
        mesh: strng::new(mesh),
        name: strng::new(name),
        networking: Networking {
            inbound: services
                .iter()
                .enumerate()
                .map(|(i, s)| Inbound {
                    port: 8080 + i as u16,
                    tags: BTreeMap::from([(SERVICE_TAG.to_string(), s.to_string())]),
                })
                .collect(),
            gateway: None,
        },
    }
}

pub fn gateway_dataplane(mesh: &str, name: &str, service: &str) -> Dataplane {
    Dataplane {
        mesh: strng::new(mesh),
        name: strng::new(name),
        networking: Networking {
            inbound: Vec::new(),
            gateway: Some(Gateway {
                tags: BTreeMap::from([(SERVICE_TAG.to_string(), service.to_string())]),
            }),
        },
    }
}

/// CA managers with the builtin CA registered.
pub fn ca_managers() -> CaManagers {
    CaManagers::new().with(
        builtin::TYPE,
        BuiltinCaManager::new(Duration::from_secs(60 * 60)),
    )
}

pub fn initialize_telemetry() {
    crate::telemetry::testing::setup_test_logging();
}
