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

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tokio::sync::watch;

use super::Error;
use crate::mesh::ProxyId;
use crate::secrets::Secret;
use crate::strng::Strng;
use crate::tls::Expiration;

/// Renders a snapshot version: the generation time in nanoseconds and the name of the CA
/// backend that issued the snapshot.
pub fn format_version(generated_nanos: u128, backend: &str) -> String {
    format!("{generated_nanos}-{backend}")
}

/// Splits a version produced by [`format_version`]. Backend names may contain `-`, the
/// timestamp may not.
pub fn parse_version(version: &str) -> Result<(u128, &str), Error> {
    let malformed = || Error::MalformedVersion(version.to_string());
    let (ts, backend) = version.split_once('-').ok_or_else(malformed)?;
    if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) || backend.is_empty() {
        return Err(malformed());
    }
    let ts = ts.parse().map_err(|_| malformed())?;
    Ok((ts, backend))
}

/// Facts about how a snapshot was generated, used to decide when it is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub generated: SystemTime,
    /// Validity of the identity certificate.
    pub expiration: Expiration,
    /// Services the identity certificate was issued for.
    pub services: Vec<Strng>,
}

/// The secrets last generated for a proxy, keyed by resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: String,
    pub resources: BTreeMap<Strng, Secret>,
    pub info: SnapshotInfo,
}

/// SnapshotCache holds one snapshot per proxy. Every write bumps a change counter that
/// streams watch to push updated secrets.
#[derive(Debug)]
pub struct SnapshotCache {
    snapshots: RwLock<HashMap<ProxyId, Arc<Snapshot>>>,
    writes: watch::Sender<u64>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        SnapshotCache {
            snapshots: RwLock::new(HashMap::new()),
            writes: watch::Sender::new(0),
        }
    }

    pub fn get(&self, proxy: &ProxyId) -> Option<Arc<Snapshot>> {
        self.snapshots.read().unwrap().get(proxy).cloned()
    }

    pub fn set(&self, proxy: ProxyId, snapshot: Snapshot) {
        self.snapshots
            .write()
            .unwrap()
            .insert(proxy, Arc::new(snapshot));
        self.writes.send_modify(|w| *w += 1);
    }

    /// Removes the snapshot of `proxy`. Returns true if there was one.
    pub fn clear(&self, proxy: &ProxyId) -> bool {
        let removed = self.snapshots.write().unwrap().remove(proxy).is_some();
        if removed {
            self.writes.send_modify(|w| *w += 1);
        }
        removed
    }

    /// Number of writes so far. A receiver is notified on every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.writes.subscribe()
    }

    pub fn writes(&self) -> u64 {
        *self.writes.borrow()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
