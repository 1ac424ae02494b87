//! Prometheus-style counters for the connection layer (RED: Rate, Errors, Duration).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the duration histogram buckets, in seconds. `+Inf` is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Per-operation histogram. Buckets are stored non-cumulatively and summed on render.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OpStats {
    requests: AtomicU64,
    duration: DurationHistogram,
}

/// Thread-safe counters shared by every connection that was handed the same
/// `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Native links opened (initial connects and reconnects).
    connects_total: AtomicU64,
    /// Links re-established after a transport failure during bind.
    reconnects_total: AtomicU64,
    pages_total: AtomicU64,
    entries_total: AtomicU64,
    ops: DashMap<&'static str, OpStats>,
    /// (operation, error kind) -> count.
    errors: DashMap<(&'static str, &'static str), AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connects(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reconnects(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished operation and record how long it took, successful or not.
    pub fn observe(&self, op: &'static str, duration: Duration) {
        let stats = self.ops.entry(op).or_default();
        stats.requests.fetch_add(1, Ordering::Relaxed);
        stats.duration.observe(duration);
    }

    pub fn inc_error(&self, op: &'static str, kind: &'static str) {
        self.errors
            .entry((op, kind))
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_search_volume(&self, pages: usize, entries: usize) {
        self.pages_total.fetch_add(pages as u64, Ordering::Relaxed);
        self.entries_total.fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.ops
            .get(op)
            .map(|s| s.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors(&self, op: &'static str, kind: &'static str) -> u64 {
        self.errors
            .get(&(op, kind))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn connects(&self) -> u64 {
        self.connects_total.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects_total.load(Ordering::Relaxed)
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_link_connects_total Native LDAP links opened.\n");
        out.push_str("# TYPE ldap_link_connects_total counter\n");
        out.push_str(&format!("ldap_link_connects_total {}\n", self.connects()));

        out.push_str("# HELP ldap_link_reconnects_total Links re-established after a transport failure during bind.\n");
        out.push_str("# TYPE ldap_link_reconnects_total counter\n");
        out.push_str(&format!("ldap_link_reconnects_total {}\n", self.reconnects()));

        out.push_str("# HELP ldap_link_search_pages_total Result pages fetched.\n");
        out.push_str("# TYPE ldap_link_search_pages_total counter\n");
        out.push_str(&format!(
            "ldap_link_search_pages_total {}\n",
            self.pages_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_link_search_entries_total Entries returned by searches.\n");
        out.push_str("# TYPE ldap_link_search_entries_total counter\n");
        out.push_str(&format!(
            "ldap_link_search_entries_total {}\n",
            self.entries_total.load(Ordering::Relaxed)
        ));

        let mut ops: Vec<&'static str> = self.ops.iter().map(|e| *e.key()).collect();
        ops.sort_unstable();

        out.push_str("# HELP ldap_link_requests_total Directory operations by name.\n");
        out.push_str("# TYPE ldap_link_requests_total counter\n");
        for op in &ops {
            out.push_str(&format!("ldap_link_requests_total{{op=\"{}\"}} {}\n", op, self.requests(op)));
        }

        let mut errors: Vec<((&'static str, &'static str), u64)> = self
            .errors
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort_unstable();
        out.push_str("# HELP ldap_link_errors_total Failed operations by name and error kind.\n");
        out.push_str("# TYPE ldap_link_errors_total counter\n");
        for ((op, kind), count) in errors {
            out.push_str(&format!(
                "ldap_link_errors_total{{op=\"{}\",kind=\"{}\"}} {}\n",
                op, kind, count
            ));
        }

        out.push_str("# HELP ldap_link_request_duration_seconds Operation duration in seconds.\n");
        out.push_str("# TYPE ldap_link_request_duration_seconds histogram\n");
        for op in &ops {
            let Some(stats) = self.ops.get(op) else {
                continue;
            };
            let hist = &stats.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_link_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_link_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_link_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_link_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}
