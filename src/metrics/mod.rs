//! Metrics hooks.
//!
//! The protocol engine reports counters, timers and gauges at operation
//! boundaries through the [`Metrics`] trait. How the numbers leave the
//! process is up to the implementation:
//! - [`NullMetrics`]: discards everything (the default)
//! - [`StatsdMetrics`]: aggregates per epoch and ships to a statsd daemon

mod statsd;

pub use statsd::StatsdMetrics;

use std::sync::Arc;

/// Callback run once per metrics epoch, before aggregated values are flushed.
pub type EpochCallback = Box<dyn Fn() + Send + Sync>;

/// A sink for operational metrics.
pub trait Metrics: Send + Sync {
    /// Add `value` to the named counter.
    fn counter(&self, name: &str, value: i64);

    /// Record a duration in milliseconds.
    fn timer(&self, name: &str, millis: u64);

    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, value: u64);

    /// Register a callback for values that are expensive to compute and
    /// only need sampling once per epoch.
    fn on_epoch(&self, _callback: EpochCallback) {}
}

/// Metrics sink that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl NullMetrics {
    pub fn shared() -> Arc<dyn Metrics> {
        Arc::new(NullMetrics)
    }
}

impl Metrics for NullMetrics {
    fn counter(&self, _name: &str, _value: i64) {}
    fn timer(&self, _name: &str, _millis: u64) {}
    fn gauge(&self, _name: &str, _value: u64) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records counters in memory so tests can assert on them.
    #[derive(Default)]
    pub struct RecordingMetrics {
        counters: Mutex<HashMap<String, i64>>,
        gauges: Mutex<HashMap<String, u64>>,
        timers: Mutex<HashMap<String, usize>>,
    }

    impl RecordingMetrics {
        pub fn counter_value(&self, name: &str) -> i64 {
            self.counters
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .unwrap_or(0)
        }

        pub fn gauge_value(&self, name: &str) -> Option<u64> {
            self.gauges.lock().unwrap().get(name).copied()
        }

        /// Number of samples recorded for the named timer.
        pub fn timer_count(&self, name: &str) -> usize {
            self.timers.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    impl Metrics for RecordingMetrics {
        fn counter(&self, name: &str, value: i64) {
            *self
                .counters
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_insert(0) += value;
        }

        fn timer(&self, name: &str, _millis: u64) {
            *self
                .timers
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_insert(0) += 1;
        }

        fn gauge(&self, name: &str, value: u64) {
            self.gauges.lock().unwrap().insert(name.to_string(), value);
        }
    }
}
