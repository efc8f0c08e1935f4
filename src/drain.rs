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

//! Graceful shutdown. A [`DrainTrigger`] starts a drain and waits until every
//! [`DrainWatcher`] handed out for it is gone.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Stop immediately.
    Immediate,
    /// Stop accepting work and let in-flight work finish.
    Graceful,
}

enum Never {}

/// Creates a drain channel.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (mode_tx, mode_rx) = watch::channel(None);
    let (done_tx, done_rx) = mpsc::channel(1);
    (
        DrainTrigger { mode_tx, done_rx },
        DrainWatcher { mode_rx, done_tx },
    )
}

/// Starts a drain.
pub struct DrainTrigger {
    mode_tx: watch::Sender<Option<DrainMode>>,
    done_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
    /// Signals every watcher and waits until all of them, and all blockers they returned,
    /// are dropped.
    pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
        let _ = self.mode_tx.send(Some(mode));
        match self.done_rx.recv().await {
            None => {}
            Some(never) => match never {},
        }
    }
}

/// Held by anything that takes part in a drain. The drain completes once every clone is
/// dropped.
#[derive(Clone)]
pub struct DrainWatcher {
    mode_rx: watch::Receiver<Option<DrainMode>>,
    done_tx: mpsc::Sender<Never>,
}

impl DrainWatcher {
    /// Waits for a drain to start. The returned blocker keeps the drain from completing
    /// until it is dropped. A dropped trigger counts as an immediate drain.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        let mode = match self.mode_rx.wait_for(Option::is_some).await {
            Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
            Err(_) => DrainMode::Immediate,
        };
        DrainBlocker {
            _done_tx: self.done_tx,
            mode,
        }
    }
}

#[must_use = "DrainBlocker should be dropped explicitly once shutdown work is done"]
pub struct DrainBlocker {
    _done_tx: mpsc::Sender<Never>,
    mode: DrainMode,
}

impl DrainBlocker {
    pub fn mode(&self) -> DrainMode {
        self.mode
    }
}

impl fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}

impl fmt::Debug for DrainBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainBlocker")
            .field("mode", &self.mode)
            .finish()
    }
}

/// Runs a server future until `drain` starts. The future gets its own watcher, which it
/// hands to the work it spawns, and a receiver that fires once the grace period is over
/// and remaining work must stop. After a graceful drain the work gets `deadline` to
/// finish; then the future is dropped.
pub async fn run_with_drain<F, Fut, O>(
    component: String,
    drain: DrainWatcher,
    deadline: Duration,
    make_future: F,
) where
    F: FnOnce(DrainWatcher, watch::Receiver<()>) -> Fut,
    Fut: Future<Output = O>,
    O: Send + 'static,
{
    let (sub_trigger, sub_watcher) = new();
    let (force_tx, force_rx) = watch::channel(());
    let fut = make_future(sub_watcher, force_rx);
    tokio::select! {
        _ = fut => {}
        blocker = drain.wait_for_drain() => {
            if blocker.mode() == DrainMode::Graceful {
                debug!(component, "drain started, waiting {:?} for in-flight work", deadline);
                if tokio::time::timeout(deadline, sub_trigger.start_drain_and_wait(DrainMode::Graceful)).await.is_err() {
                    warn!(component, "drain deadline passed with work still in flight, forcing shutdown");
                }
            } else {
                debug!(component, "terminating");
            }
            let _ = force_tx.send(());
            info!(component, "shutdown complete");
            drop(blocker);
        }
    };
}
