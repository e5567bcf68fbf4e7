use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Counter/timer sink injected into the coordinator.
pub trait Metrics: Send + Sync {
    fn incr(&self, name: &'static str, delta: u64);

    fn timing(&self, name: &'static str, elapsed: Duration);
}

/// Keeps running totals and emits every update as a structured log event.
#[derive(Debug, Default)]
pub struct TracingMetrics {
    totals: Mutex<BTreeMap<&'static str, u64>>,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, name: &str) -> u64 {
        self.snapshot().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Metrics for TracingMetrics {
    fn incr(&self, name: &'static str, delta: u64) {
        let total = {
            let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = totals.entry(name).or_default();
            *entry += delta;
            *entry
        };
        info!(metric = name, delta, total, "metric");
    }

    fn timing(&self, name: &'static str, elapsed: Duration) {
        self.incr(name, elapsed.as_millis() as u64);
    }
}

/// Records elapsed milliseconds under `name` when dropped.
pub struct MetricsTimer<'a> {
    metrics: &'a dyn Metrics,
    name: &'static str,
    started: Instant,
}

impl<'a> MetricsTimer<'a> {
    pub fn start(metrics: &'a dyn Metrics, name: &'static str) -> Self {
        Self {
            metrics,
            name,
            started: Instant::now(),
        }
    }
}

impl Drop for MetricsTimer<'_> {
    fn drop(&mut self) {
        self.metrics.timing(self.name, self.started.elapsed());
    }
}
