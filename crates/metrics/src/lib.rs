//! Thin wrapper around prometheus shared by every crate in the workspace.
//!
//! Metrics are declared next to the code that emits them with the
//! `register_backfill_*` macros and reported through the `log_*` helpers, so
//! call sites never touch prometheus types directly.

use std::{
    sync::LazyLock,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    IntCounter,
    IntCounterVec,
    IntGauge,
    Registry,
};

mod macros;

/// The registry every `register_backfill_*` macro registers into. Exposed so
/// a server can gather and export it.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

#[doc(hidden)]
pub use paste::paste;
#[doc(hidden)]
pub use prometheus;

pub fn log_counter(counter: &IntCounter, increment: u64) {
    counter.inc_by(increment);
}

pub fn log_counter_with_labels(counter: &IntCounterVec, increment: u64, labels: &[&str]) {
    match counter.get_metric_with_label_values(labels) {
        Ok(metric) => metric.inc_by(increment),
        Err(e) => tracing::error!("Invalid labels {labels:?} for counter: {e}"),
    }
}

pub fn log_gauge(gauge: &IntGauge, value: i64) {
    gauge.set(value);
}

pub fn log_distribution(histogram: &Histogram, value: f64) {
    histogram.observe(value);
}

/// Observes the wall-clock time between its creation and drop into the given
/// histogram, in seconds.
pub struct Timer {
    histogram: Histogram,
    start: Instant,
}

impl Timer {
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
