//! Named counters and gauges shared across components
//!
//! The registry is append-only: a counter handle, once interned, stays
//! valid for the lifetime of the pipeline and is updated with plain
//! atomic operations. Components hold the cheap [Telemetry] clone and
//! intern the names they need at start.
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Counter names used by the core. Plugins add their own, typically
/// prefixed with their label.
pub mod names {
    /// messages accepted by a router and handed to a policy
    pub const ROUTED: &str = "messages.routed";
    /// messages enqueued into a producer channel
    pub const ENQUEUED: &str = "messages.enqueued";
    /// messages redirected to a fallback stream
    pub const FALLBACK: &str = "messages.fallback";
    /// messages dropped with no fallback configured
    pub const DISCARDED: &str = "messages.discarded";
    /// messages rejected by a modulator chain
    pub const FILTERED: &str = "messages.filtered";
    /// messages that could not be parsed or modulated
    pub const MALFORMED: &str = "messages.malformed";
}

/// Handle to a single named counter.
pub type Counter = Arc<AtomicI64>;

/// Registry of named counters and gauges.
#[derive(Clone, Default)]
pub struct Telemetry {
    registry: Arc<RwLock<FxHashMap<String, Counter>>>,
}

impl Telemetry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Telemetry::default()
    }

    /// Returns the counter registered under `name`, creating it at zero on
    /// first use.
    pub fn counter(&self, name: &str) -> Counter {
        if let Ok(registry) = self.registry.read() {
            if let Some(counter) = registry.get(name) {
                return Arc::clone(counter);
            }
        }
        let counter: Counter = Arc::new(AtomicI64::new(0));
        if let Ok(mut registry) = self.registry.write() {
            return Arc::clone(
                registry
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::clone(&counter)),
            );
        }
        counter
    }

    /// Adds `delta` to the named counter.
    pub fn add(&self, name: &str, delta: i64) {
        let _ = self.counter(name).fetch_add(delta, Ordering::Relaxed);
    }

    /// Increments the named counter by one.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Sets the named gauge to an absolute value.
    pub fn set(&self, name: &str, value: i64) {
        self.counter(name).store(value, Ordering::Relaxed);
    }

    /// Reads the current value of a counter, zero when never touched.
    pub fn value(&self, name: &str) -> i64 {
        self.registry
            .read()
            .ok()
            .and_then(|registry| {
                registry
                    .get(name)
                    .map(|counter| counter.load(Ordering::Relaxed))
            })
            .unwrap_or(0)
    }

    /// Point-in-time copy of every counter, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .registry
            .read()
            .map(|registry| {
                registry
                    .iter()
                    .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_intern_once() {
        let telemetry = Telemetry::new();
        let a = telemetry.counter("messages.routed");
        let b = telemetry.counter("messages.routed");
        a.fetch_add(2, Ordering::Relaxed);
        assert_eq!(b.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn untouched_counters_read_zero() {
        let telemetry = Telemetry::new();
        assert_eq!(telemetry.value("never"), 0);
    }

    #[test]
    fn add_and_set() {
        let telemetry = Telemetry::new();
        telemetry.incr(names::DISCARDED);
        telemetry.add(names::DISCARDED, 4);
        assert_eq!(telemetry.value(names::DISCARDED), 5);
        telemetry.set("queue.depth", 17);
        assert_eq!(telemetry.value("queue.depth"), 17);
    }

    #[test]
    fn snapshot_is_sorted() {
        let telemetry = Telemetry::new();
        telemetry.incr("b");
        telemetry.incr("a");
        let snap = telemetry.snapshot();
        assert_eq!(snap[0].0, "a");
        assert_eq!(snap[1].0, "b");
    }

    #[test]
    fn clones_share_the_registry() {
        let telemetry = Telemetry::new();
        let clone = telemetry.clone();
        clone.incr("shared");
        assert_eq!(telemetry.value("shared"), 1);
    }
}
