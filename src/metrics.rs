//! Lightweight per-query and runtime metrics: named counters and
//! nanosecond timers, serializable into status and decision-log
//! payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metrics {
    #[serde(default)]
    counters: BTreeMap<String, u64>,
    /// Elapsed nanoseconds per named timer.
    #[serde(default)]
    timers_ns: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn incr(&mut self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &str, delta: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Time a closure, recording its duration under `name`.
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record_ns(name, start.elapsed().as_nanos() as u64);
        out
    }

    pub fn record_ns(&mut self, name: &str, ns: u64) {
        *self.timers_ns.entry(name.to_string()).or_insert(0) += ns;
    }

    pub fn timer_ns(&self, name: &str) -> u64 {
        self.timers_ns.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.timers_ns.is_empty()
    }

    /// Fold another metrics set into this one.
    pub fn merge(&mut self, other: &Metrics) {
        for (name, v) in &other.counters {
            self.add(name, *v);
        }
        for (name, ns) in &other.timers_ns {
            self.record_ns(name, *ns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut m = Metrics::new();
        m.incr("queries");
        m.add("queries", 2);
        assert_eq!(m.counter("queries"), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn test_timer_records() {
        let mut m = Metrics::new();
        let out = m.time("work", || 42);
        assert_eq!(out, 42);
        // A timer entry exists even for near-zero durations.
        assert!(m.timer_ns("work") > 0 || m.timers_ns.contains_key("work"));
    }

    #[test]
    fn test_merge() {
        let mut a = Metrics::new();
        a.incr("x");
        let mut b = Metrics::new();
        b.add("x", 4);
        a.merge(&b);
        assert_eq!(a.counter("x"), 5);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut m = Metrics::new();
        m.incr("hits");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("hits"));
    }
}
