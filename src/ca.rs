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
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::mesh::CaBackend;
use crate::strng;
use crate::strng::Strng;

pub mod builtin;
pub mod provided;

pub use builtin::BuiltinCaManager;
pub use provided::ProvidedCaManager;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration of CA backend {backend}: {reason}")]
    InvalidConfig { backend: Strng, reason: String },
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A signed workload certificate along with its private key, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub cert_pem: Bytes,
    pub key_pem: Bytes,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .finish_non_exhaustive()
    }
}

/// CaManager implements one type of CA backend.
#[async_trait]
pub trait CaManager: Send + Sync {
    /// Returns the trusted root certificates of the backend, one PEM block per entry.
    async fn root_certs(&self, mesh: &str, backend: &CaBackend) -> Result<Vec<Bytes>, Error>;

    /// Signs a workload certificate carrying a SPIFFE id per service.
    async fn generate_workload_cert(
        &self,
        mesh: &str,
        backend: &CaBackend,
        services: &[Strng],
    ) -> Result<KeyPair, Error>;
}

/// CaManagers resolves the CaManager registered for a backend type.
#[derive(Clone, Default)]
pub struct CaManagers {
    managers: HashMap<Strng, Arc<dyn CaManager>>,
}

impl CaManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, type_: &str, manager: impl CaManager + 'static) -> Self {
        self.register(type_, Arc::new(manager));
        self
    }

    pub fn register(&mut self, type_: &str, manager: Arc<dyn CaManager>) {
        self.managers.insert(strng::new(type_), manager);
    }

    pub fn get(&self, type_: &str) -> Option<Arc<dyn CaManager>> {
        self.managers.get(type_).cloned()
    }
}

impl fmt::Debug for CaManagers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.managers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn registry_lookup_by_type() {
        let managers =
            CaManagers::new().with(builtin::TYPE, BuiltinCaManager::new(Duration::from_secs(60)));
        assert!(managers.get("builtin").is_some());
        assert!(managers.get("vault").is_none());
        assert_eq!(format!("{managers:?}"), "{\"builtin\"}");
    }
}
