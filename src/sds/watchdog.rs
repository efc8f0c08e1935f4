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
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info_span, warn};

use super::metrics::{WatchdogStarted, WatchdogStopped};
use super::{Callbacks, Error, Reconciler, SnapshotCache, StreamId};
use crate::mesh::ProxyId;
use crate::metrics::IncrementRecorder;
use crate::xds::discovery::DiscoveryRequest;

struct Watchdog {
    streams: usize,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    proxies: HashMap<ProxyId, Watchdog>,
    streams: HashMap<StreamId, ProxyId>,
}

/// Watchdogs reconcile the snapshot of every connected proxy on a fixed interval. A
/// proxy's watchdog starts with its first stream and stops, clearing the snapshot, when
/// its last stream closes.
pub struct Watchdogs {
    reconciler: Reconciler,
    cache: Arc<SnapshotCache>,
    interval: Duration,
    state: Arc<Mutex<State>>,
}

/// Drops the snapshot of `proxy` unless a watchdog owns it. A reconcile that finishes
/// after the proxy's last stream closed would otherwise leave an orphaned entry behind.
fn clear_unwatched(state: &Mutex<State>, cache: &SnapshotCache, proxy: &ProxyId) {
    let state = state.lock().unwrap();
    if !state.proxies.contains_key(proxy) && cache.clear(proxy) {
        debug!(%proxy, "dropped snapshot of a disconnected proxy");
    }
}

impl Watchdogs {
    pub fn new(reconciler: Reconciler, cache: Arc<SnapshotCache>, interval: Duration) -> Self {
        Watchdogs {
            reconciler,
            cache,
            interval,
            state: Default::default(),
        }
    }

    /// Proxies currently watched.
    pub fn watched(&self) -> Vec<ProxyId> {
        self.state.lock().unwrap().proxies.keys().cloned().collect()
    }

    fn spawn(&self, proxy: ProxyId) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let state = self.state.clone();
        let cache = self.cache.clone();
        let interval = self.interval;
        let span = info_span!("watchdog", proxy = %proxy);
        tokio::spawn(
            async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the first tick completes immediately; that reconcile already ran inline
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = reconciler.reconcile(&proxy).await {
                        warn!("reconcile failed, retrying next tick: {e}");
                    }
                    clear_unwatched(&state, &cache, &proxy);
                }
            }
            .instrument(span),
        )
    }
}

#[async_trait]
impl Callbacks for Watchdogs {
    async fn on_stream_request(
        &self,
        stream_id: StreamId,
        proxy: &ProxyId,
        _: &DiscoveryRequest,
    ) -> Result<(), Error> {
        let first = {
            let mut state = self.state.lock().unwrap();
            if state.streams.contains_key(&stream_id) {
                return Ok(());
            }
            state.streams.insert(stream_id, proxy.clone());
            match state.proxies.get_mut(proxy) {
                Some(w) => {
                    w.streams += 1;
                    false
                }
                None => {
                    let task = self.spawn(proxy.clone());
                    state
                        .proxies
                        .insert(proxy.clone(), Watchdog { streams: 1, task });
                    self.reconciler.metrics().increment(&WatchdogStarted);
                    true
                }
            }
        };
        if first {
            debug!(%proxy, "starting watchdog");
            // Failures surface again when the stream resolves its secret.
            if let Err(e) = self.reconciler.reconcile(proxy).await {
                warn!(%proxy, "initial reconcile failed: {e}");
            }
            clear_unwatched(&self.state, &self.cache, proxy);
        }
        Ok(())
    }

    async fn on_stream_closed(&self, stream_id: StreamId) {
        let stopped = {
            let mut state = self.state.lock().unwrap();
            let Some(proxy) = state.streams.remove(&stream_id) else {
                return;
            };
            let Some(w) = state.proxies.get_mut(&proxy) else {
                return;
            };
            w.streams -= 1;
            if w.streams > 0 {
                return;
            }
            let w = state.proxies.remove(&proxy);
            // cleared under the lock so a reconnecting stream's first snapshot survives
            self.cache.clear(&proxy);
            w.map(|w| (proxy, w))
        };
        if let Some((proxy, w)) = stopped {
            w.task.abort();
            self.reconciler.metrics().increment(&WatchdogStopped);
            debug!(%proxy, "stopped watchdog");
        }
    }
}
