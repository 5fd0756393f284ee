use metrics::{register_counter, Counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const JOBS_TOTAL: &str = "render_jobs_total";
pub const JOB_DURATION_SECONDS: &str = "render_job_duration_seconds";
pub const CONTEXTS_ACQUIRED_TOTAL: &str = "render_contexts_acquired_total";
pub const CONTEXTS_RELEASED_TOTAL: &str = "render_contexts_released_total";
pub const READINESS_DEGRADED_TOTAL: &str = "render_readiness_degraded_total";
pub const REQUESTS_BLOCKED_TOTAL: &str = "render_requests_blocked_total";

/// Render pipeline metrics
///
/// Everything goes to the `metrics` facade, so it lands in whatever recorder
/// is installed (none by default). A local copy of the counts backs
/// [`Metrics::snapshot`].
pub struct Metrics {
    contexts_acquired: Counter,
    contexts_released: Counter,
    requests_blocked: Counter,
    local: LocalCounts,
}

#[derive(Default)]
struct LocalCounts {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    contexts_acquired: AtomicU64,
    contexts_released: AtomicU64,
    readiness_degraded: AtomicU64,
    requests_blocked: AtomicU64,
}

impl Metrics {
    /// Register handles with the current recorder. Install the recorder first.
    pub fn new() -> Self {
        Self {
            contexts_acquired: register_counter!(CONTEXTS_ACQUIRED_TOTAL),
            contexts_released: register_counter!(CONTEXTS_RELEASED_TOTAL),
            requests_blocked: register_counter!(REQUESTS_BLOCKED_TOTAL),
            local: LocalCounts::default(),
        }
    }

    /// `outcome` is `succeeded` or the failure kind
    pub fn record_job(&self, outcome: &str, duration: Duration) {
        if outcome == "succeeded" {
            self.local.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.local.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }

        metrics::counter!(JOBS_TOTAL, 1, "outcome" => outcome.to_string());
        metrics::histogram!(JOB_DURATION_SECONDS, duration.as_secs_f64());
    }

    pub fn record_context_acquired(&self) {
        self.contexts_acquired.increment(1);
        self.local.contexts_acquired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_context_released(&self) {
        self.contexts_released.increment(1);
        self.local.contexts_released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_readiness_degraded(&self, signal: &str) {
        metrics::counter!(READINESS_DEGRADED_TOTAL, 1, "signal" => signal.to_string());
        self.local.readiness_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked_requests(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.requests_blocked.increment(count as u64);
        self.local
            .requests_blocked
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_succeeded: self.local.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.local.jobs_failed.load(Ordering::Relaxed),
            contexts_acquired: self.local.contexts_acquired.load(Ordering::SeqCst),
            contexts_released: self.local.contexts_released.load(Ordering::SeqCst),
            readiness_degraded: self.local.readiness_degraded.load(Ordering::Relaxed),
            requests_blocked: self.local.requests_blocked.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub contexts_acquired: u64,
    pub contexts_released: u64,
    pub readiness_degraded: u64,
    pub requests_blocked: u64,
}

impl MetricsSnapshot {
    pub fn contexts_live(&self) -> u64 {
        self.contexts_acquired.saturating_sub(self.contexts_released)
    }
}

/// Install the Prometheus recorder process-wide
///
/// The returned handle renders the exposition text on demand.
pub fn install_prometheus() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_context_balance() {
        let metrics = Metrics::new();
        metrics.record_context_acquired();
        metrics.record_context_acquired();
        metrics.record_context_released();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.contexts_acquired, 2);
        assert_eq!(snapshot.contexts_live(), 1);
    }

    #[test]
    fn job_outcomes_are_split() {
        let metrics = Metrics::new();
        metrics.record_job("succeeded", Duration::from_millis(10));
        metrics.record_job("NavigationTimeout", Duration::from_millis(10));
        metrics.record_blocked_requests(0);
        metrics.record_blocked_requests(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.requests_blocked, 3);
    }
}
