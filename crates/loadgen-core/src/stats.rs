use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::routes::normalize_path;

/// Derived latency statistics of one route, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteResults {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub inter_quartile_range: f64,
    pub error_rate: f64,
}

/// Per-route aggregate of timing samples.
///
/// Only successful calls contribute durations; every call counts as a hit
/// and failed calls additionally count as errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteStats {
    pub hits: u64,
    pub errors: u64,
    pub durations: Vec<f64>,
    #[serde(default)]
    pub results: RouteResults,
}

impl RouteStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call. Non-2xx statuses (including 0 for transport
    /// failures) are errors and their duration is discarded.
    pub fn record(&mut self, duration_ms: f64, status: u16) {
        self.hits += 1;
        if is_success(status) {
            self.durations.push(duration_ms);
        } else {
            self.errors += 1;
        }
    }

    /// Combine two aggregates without touching either input.
    pub fn merge(&self, other: &RouteStats) -> RouteStats {
        let mut durations = Vec::with_capacity(self.durations.len() + other.durations.len());
        durations.extend_from_slice(&self.durations);
        durations.extend_from_slice(&other.durations);
        let mut merged = RouteStats {
            hits: self.hits + other.hits,
            errors: self.errors + other.errors,
            durations,
            results: RouteResults::default(),
        };
        merged.calc_results();
        merged
    }

    /// Recompute derived fields from the raw samples.
    pub fn calc_results(&mut self) {
        let error_rate = if self.hits == 0 {
            0.0
        } else {
            self.errors as f64 / self.hits as f64
        };

        if self.durations.is_empty() {
            self.results = RouteResults {
                error_rate,
                ..RouteResults::default()
            };
            return;
        }

        let mut sorted = self.durations.clone();
        sorted.sort_by(f64::total_cmp);

        let sum: f64 = sorted.iter().sum();
        self.results = RouteResults {
            max: sorted[sorted.len() - 1],
            min: sorted[0],
            mean: sum / sorted.len() as f64,
            median: median(&sorted),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            inter_quartile_range: inter_quartile_range(&sorted),
            error_rate,
        };
    }

    /// The route's contribution to the run score.
    pub fn score(&self) -> f64 {
        self.results.p95 + self.results.median + self.results.inter_quartile_range
    }
}

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Median of an ascending slice; the mean of the two middle values for even
/// lengths and 0 for an empty slice.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Nearest-rank percentile, averaging the straddling ranks when the rank is
/// fractional. Samples too few to reach the first rank return the minimum.
fn percentile(sorted: &[f64], percent: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let index = percent / 100.0 * n as f64;
    let whole = index.trunc() as usize;
    if index == index.trunc() {
        sorted[whole.clamp(1, n) - 1]
    } else if whole >= 1 {
        (sorted[whole - 1] + sorted[whole.min(n - 1)]) / 2.0
    } else {
        sorted[0]
    }
}

/// Q3 - Q1, where the quartiles are the medians of the lower and upper
/// halves excluding the middle sample for odd lengths.
fn inter_quartile_range(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    let (lower_end, upper_start) = if n % 2 == 0 { (n / 2, n / 2) } else { (n / 2, n / 2 + 1) };
    median(&sorted[upper_start..]) - median(&sorted[..lower_end])
}

/// Route-keyed collection of [`RouteStats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingAggregator {
    pub routes: BTreeMap<String, RouteStats>,
}

impl TimingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample under the normalised form of `route`.
    pub fn add_sample(&mut self, route: &str, duration_ms: f64, status: u16) {
        self.routes
            .entry(normalize_path(route))
            .or_default()
            .record(duration_ms, status);
    }

    pub fn calc_results(&mut self) {
        for stats in self.routes.values_mut() {
            stats.calc_results();
        }
    }

    /// Route-wise merge; neither input is modified.
    pub fn merge(&self, other: &TimingAggregator) -> TimingAggregator {
        let mut routes = self.routes.clone();
        for (route, theirs) in &other.routes {
            let merged = match routes.get(route) {
                Some(ours) => ours.merge(theirs),
                None => {
                    let mut copy = theirs.clone();
                    copy.calc_results();
                    copy
                }
            };
            routes.insert(route.clone(), merged);
        }
        for stats in routes.values_mut() {
            stats.calc_results();
        }
        TimingAggregator { routes }
    }

    pub fn total_hits(&self) -> u64 {
        self.routes.values().map(|r| r.hits).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.routes.values().map(|r| r.errors).sum()
    }

    /// Mean over routes of `p95 + median + IQR`; lower is better. Reads the
    /// derived fields, so call [`calc_results`](Self::calc_results) first.
    pub fn score(&self) -> f64 {
        if self.routes.is_empty() {
            return 0.0;
        }
        let total: f64 = self.routes.values().map(RouteStats::score).sum();
        total / self.routes.len() as f64
    }
}
