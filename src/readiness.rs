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

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Ready tracks the startup tasks the process still waits for.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<BTreeSet<String>>>);

impl Ready {
    pub fn new() -> Ready {
        Ready::default()
    }

    /// Adds a task that must complete before the process is ready.
    pub fn register_task(&self, name: &str) -> BlockReady {
        self.0.lock().unwrap().insert(name.to_string());
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    /// Pending tasks, sorted.
    pub fn pending(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().cloned().collect()
    }
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let left = {
            let mut pending = self.parent.0.lock().unwrap();
            pending.remove(&self.name);
            pending.len()
        };
        let dur = telemetry::APPLICATION_START_TIME.elapsed();
        if left == 0 {
            info!("task '{}' complete ({dur:?}), marking server ready", self.name);
        } else {
            info!("task '{}' complete ({dur:?}), still awaiting {left} tasks", self.name);
        }
    }
}
