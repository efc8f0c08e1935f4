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

use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::metrics::Recorder;

pub struct Metrics {
    streams: Counter,
    active_streams: Gauge,
    responses: Family<ResponseLabels, Counter>,
    stream_errors: Family<ErrorLabels, Counter>,
    cert_generation: Family<MeshLabels, Counter>,
    reconciliations: Family<OutcomeLabels, Counter>,
    generation: Histogram,
    pub(super) watchdogs: Gauge,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct ResponseLabels {
    resource: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    class: ErrorClass,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct MeshLabels {
    mesh: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

#[derive(Clone, Copy, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum ErrorClass {
    Protocol,
    Authentication,
    NotFound,
    PermissionDenied,
    Internal,
}

#[derive(Clone, Copy, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Generated,
    Skipped,
    Cleared,
    Error,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamOpened;

#[derive(Clone, Copy, Debug)]
pub struct StreamClosed;

impl From<&StreamOpened> for StreamClosed {
    fn from(_: &StreamOpened) -> Self {
        StreamClosed
    }
}

pub struct ResponseSent<'a>(pub &'a str);

pub struct CertGenerated<'a>(pub &'a str);

#[derive(Clone, Copy, Debug)]
pub struct SnapshotGenerated;

#[derive(Clone, Copy, Debug)]
pub struct WatchdogStarted;

#[derive(Clone, Copy, Debug)]
pub struct WatchdogStopped;

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let streams = Counter::default();
        registry.register(
            "sds_streams",
            "The total number of secret discovery streams opened",
            streams.clone(),
        );
        let active_streams = Gauge::default();
        registry.register(
            "sds_active_streams",
            "The number of secret discovery streams currently open",
            active_streams.clone(),
        );
        let responses = Family::default();
        registry.register(
            "sds_responses",
            "The total number of secret discovery responses sent",
            responses.clone(),
        );
        let stream_errors = Family::default();
        registry.register(
            "sds_stream_errors",
            "The total number of secret discovery streams terminated by an error",
            stream_errors.clone(),
        );
        let cert_generation = Family::default();
        registry.register(
            "cert_generation",
            "The total number of secret snapshots generated",
            cert_generation.clone(),
        );
        let reconciliations = Family::default();
        registry.register(
            "reconciliations",
            "The total number of snapshot reconciliations",
            reconciliations.clone(),
        );
        let generation = Histogram::new(
            vec![0.001f64, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter(),
        );
        registry.register(
            "sds_generation",
            "Time spent generating a secret snapshot, in seconds",
            generation.clone(),
        );
        let watchdogs = Gauge::default();
        registry.register(
            "sds_watchdogs",
            "The number of proxies with a running snapshot watchdog",
            watchdogs.clone(),
        );

        Self {
            streams,
            active_streams,
            responses,
            stream_errors,
            cert_generation,
            reconciliations,
            generation,
            watchdogs,
        }
    }
}

impl Recorder<StreamOpened, u64> for crate::metrics::Metrics {
    fn record(&self, _: &StreamOpened, count: u64) {
        self.sds.streams.inc_by(count);
        self.sds.active_streams.inc();
    }
}

impl Recorder<StreamClosed, u64> for crate::metrics::Metrics {
    fn record(&self, _: &StreamClosed, _: u64) {
        self.sds.active_streams.dec();
    }
}

impl Recorder<ResponseSent<'_>, u64> for crate::metrics::Metrics {
    fn record(&self, event: &ResponseSent<'_>, count: u64) {
        self.sds
            .responses
            .get_or_create(&ResponseLabels {
                resource: event.0.to_string(),
            })
            .inc_by(count);
    }
}

impl Recorder<ErrorClass, u64> for crate::metrics::Metrics {
    fn record(&self, class: &ErrorClass, count: u64) {
        self.sds
            .stream_errors
            .get_or_create(&ErrorLabels { class: *class })
            .inc_by(count);
    }
}

impl Recorder<CertGenerated<'_>, u64> for crate::metrics::Metrics {
    fn record(&self, event: &CertGenerated<'_>, count: u64) {
        self.sds
            .cert_generation
            .get_or_create(&MeshLabels {
                mesh: event.0.to_string(),
            })
            .inc_by(count);
    }
}

impl Recorder<Outcome, u64> for crate::metrics::Metrics {
    fn record(&self, outcome: &Outcome, count: u64) {
        self.sds
            .reconciliations
            .get_or_create(&OutcomeLabels { outcome: *outcome })
            .inc_by(count);
    }
}

impl Recorder<SnapshotGenerated, Duration> for crate::metrics::Metrics {
    fn record(&self, _: &SnapshotGenerated, elapsed: Duration) {
        self.sds.generation.observe(elapsed.as_secs_f64());
    }
}

impl Recorder<WatchdogStarted, u64> for crate::metrics::Metrics {
    fn record(&self, _: &WatchdogStarted, _: u64) {
        self.sds.watchdogs.inc();
    }
}

impl Recorder<WatchdogStopped, u64> for crate::metrics::Metrics {
    fn record(&self, _: &WatchdogStopped, _: u64) {
        self.sds.watchdogs.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prometheus_client::encoding::text::encode;

    use super::*;
    use crate::metrics::IncrementRecorder;

    #[test]
    fn stream_gauge_follows_guard() {
        let mut registry = Registry::default();
        let metrics = Arc::new(crate::metrics::Metrics::from(&mut registry));
        let guard = metrics.increment_defer::<_, StreamClosed>(&StreamOpened);
        metrics.increment(&ResponseSent("mesh_ca"));
        metrics.increment(&Outcome::Skipped);
        assert_eq!(metrics.sds.active_streams.get(), 1);
        drop(guard);
        assert_eq!(metrics.sds.active_streams.get(), 0);
        assert_eq!(metrics.sds.streams.get(), 1);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("mesh_sds_sds_responses_total{resource=\"mesh_ca\"} 1"), "{out}");
        assert!(out.contains("mesh_sds_reconciliations_total{outcome=\"Skipped\"} 1"), "{out}");
    }

    #[test]
    fn generation_and_watchdogs() {
        let mut registry = Registry::default();
        let metrics = crate::metrics::Metrics::from(&mut registry);
        metrics.record(&SnapshotGenerated, Duration::from_millis(3));
        metrics.increment(&WatchdogStarted);
        metrics.increment(&WatchdogStarted);
        metrics.increment(&WatchdogStopped);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("mesh_sds_sds_generation_count 1"), "{out}");
        assert!(out.contains("mesh_sds_sds_watchdogs 1"), "{out}");
    }
}
