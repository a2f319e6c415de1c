//! Minimal wall-clock accumulator for the benchmark harness: callers mark
//! named sections with [`Timer::measure`]; [`Timer::report`] prints total
//! and per-call-average duration for each.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct Timer {
    totals: BTreeMap<&'static str, Duration>,
    counts: BTreeMap<&'static str, u64>,
}

impl Timer {
    pub fn new() -> Self {
        Timer::default()
    }

    /// Run `f`, attributing its wall-clock time to `label`.
    pub fn measure<R>(&mut self, label: &'static str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        *self.totals.entry(label).or_insert(Duration::ZERO) += elapsed;
        *self.counts.entry(label).or_insert(0) += 1;
        result
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        for (label, total) in &self.totals {
            let count = self.counts.get(label).copied().unwrap_or(1).max(1);
            let avg = *total / count as u32;
            out.push_str(&format!(
                "{label}: {count} calls, total {total:?}, avg {avg:?}\n"
            ));
        }
        out
    }
}
