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

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use prometheus_client::registry::Registry;
use tracing::error;

use crate::sds;

/// Metrics of the secret discovery server and the reconciler.
pub struct Metrics {
    pub(crate) sds: sds::metrics::Metrics,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        Self {
            sds: sds::metrics::Metrics::new(registry),
        }
    }
}

/// Creates the registry every metric of this crate is registered under.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix("mesh_sds")
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(sub_registry(registry))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

impl Metrics {
    #[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
    pub fn defer<'a, F>(self: &Arc<Metrics>, record: F) -> Deferred<'a, F>
    where
        F: FnOnce(Arc<Metrics>),
    {
        Deferred::new(self.clone(), record)
    }

    #[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
    /// increment_defer is used to increment a metric now and another metric later once the MetricGuard is dropped
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let opened = StreamOpened;
    /// // Record the stream opening now
    /// let closed = self.metrics.increment_defer::<_, StreamClosed>(&opened);
    /// // Eventually, report the stream closed
    /// drop(closed);
    /// ```
    pub fn increment_defer<'a, M1, M2>(
        self: &Arc<Metrics>,
        event: &'a M1,
    ) -> Deferred<'a, impl FnOnce(Arc<Metrics>)>
    where
        M1: Clone + 'a,
        M2: From<&'a M1> + 'a,
        Metrics: IncrementRecorder<M1> + IncrementRecorder<M2>,
    {
        self.increment(event);
        let m2: M2 = event.into();
        self.defer(move |metrics| {
            metrics.increment(&m2);
        })
    }
}

pub struct Deferred<'a, F>
where
    F: FnOnce(Arc<Metrics>),
{
    metrics: Arc<Metrics>,
    record_fn: Option<F>,
    _lifetime: PhantomData<&'a F>,
}

impl<F> Deferred<'_, F>
where
    F: FnOnce(Arc<Metrics>),
{
    pub fn new(metrics: Arc<Metrics>, record_fn: F) -> Self {
        Self {
            metrics,
            record_fn: Some(record_fn),
            _lifetime: PhantomData,
        }
    }
}

impl<F> Drop for Deferred<'_, F>
where
    F: FnOnce(Arc<Metrics>),
{
    fn drop(&mut self) {
        if let Some(record_fn) = mem::take(&mut self.record_fn) {
            (record_fn)(self.metrics.clone());
        } else {
            error!("defer record failed, event is gone");
        }
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}
