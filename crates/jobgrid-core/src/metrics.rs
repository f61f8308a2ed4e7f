//! Metrics sink.
//!
//! Components receive a [`SharedMetrics`] handle in their constructors
//! instead of reaching for process-wide counters. [`InMemoryMetrics`]
//! keeps counters and gauges in memory and renders the Prometheus text
//! exposition format for scraping.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::sync::MutexExt;

pub const BIDS_TOTAL: &str = "jobgrid_bids_total";
pub const BUFFER_ENQUEUED_TOTAL: &str = "jobgrid_buffer_enqueued_total";
pub const BUFFER_DEQUEUED_TOTAL: &str = "jobgrid_buffer_dequeued_total";
pub const BUFFER_REJECTED_TOTAL: &str = "jobgrid_buffer_rejected_total";
pub const BUFFER_RUNNING: &str = "jobgrid_buffer_running";
pub const BUFFER_QUEUED: &str = "jobgrid_buffer_queued";
pub const EXECUTIONS_TIMED_OUT_TOTAL: &str = "jobgrid_executions_timed_out_total";
pub const JOBS_COMPLETED_TOTAL: &str = "jobgrid_jobs_completed_total";
pub const JOBS_FAILED_TOTAL: &str = "jobgrid_jobs_failed_total";
pub const JOB_RETRIES_TOTAL: &str = "jobgrid_job_retries_total";

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, labels: &[(&'static str, &str)]);
    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl NoopMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(NoopMetrics)
    }
}

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn set_gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}

type SeriesKey = (&'static str, Vec<(&'static str, String)>);

fn series_key(name: &'static str, labels: &[(&'static str, &str)]) -> SeriesKey {
    let mut labels: Vec<(&'static str, String)> =
        labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
    labels.sort();
    (name, labels)
}

/// In-memory counters and gauges.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    gauges: Mutex<BTreeMap<SeriesKey, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series (zero if never incremented).
    pub fn counter(&self, name: &'static str, labels: &[(&'static str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.counters.lock_unpoisoned().get(&key).copied().unwrap_or(0)
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &'static str) -> u64 {
        self.counters
            .lock_unpoisoned()
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)]) -> Option<f64> {
        let key = series_key(name, labels);
        self.gauges.lock_unpoisoned().get(&key).copied()
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.lock_unpoisoned();
        render_family(&mut out, "counter", counters.iter().map(|(k, v)| (k, v.to_string())));
        drop(counters);

        let gauges = self.gauges.lock_unpoisoned();
        render_family(&mut out, "gauge", gauges.iter().map(|(k, v)| (k, format!("{v:.2}"))));

        out
    }
}

fn render_family<'a>(
    out: &mut String,
    kind: &str,
    series: impl Iterator<Item = (&'a SeriesKey, String)>,
) {
    let mut last_name = "";
    for ((name, labels), value) in series {
        if *name != last_name {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            last_name = *name;
        }
        if labels.is_empty() {
            out.push_str(&format!("{name} {value}\n"));
        } else {
            let rendered: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            out.push_str(&format!("{name}{{{}}} {value}\n", rendered.join(",")));
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        *self
            .counters
            .lock_unpoisoned()
            .entry(series_key(name, labels))
            .or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        self.gauges
            .lock_unpoisoned()
            .insert(series_key(name, labels), value);
    }
}
