//! Provisioning SLA monitor
//!
//! Observes the span from request to `Available` for every provisioning path.
//! The monitor never returns errors and shields callers from sink panics, so
//! it cannot fail the provisioning it observes.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::MonitorConfig;
use crate::control_plane::CircuitState;

/// Raised when time-to-available exceeds the SLA threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaAlert {
    pub request_id: String,
    pub workspace_id: Option<String>,
    pub path: String,
    pub duration: Duration,
    pub threshold: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub completed: u64,
    pub succeeded: u64,
    pub success_rate: f64,
    pub p50: Option<Duration>,
    pub p95: Option<Duration>,
    pub p99: Option<Duration>,
    pub sla_violations: u64,
    pub in_progress: usize,
}

/// Receiver for engine metrics and alerts
pub trait MetricsSink: Send + Sync {
    fn provisioning_duration(&self, path: &str, duration: Duration, success: bool);

    fn sla_violation(&self, alert: &SlaAlert);

    fn circuit_transition(&self, endpoint: &str, from: CircuitState, to: CircuitState);

    fn provisioning_summary(&self, snapshot: &MonitorSnapshot);
}

/// Sink that writes structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn provisioning_duration(&self, path: &str, duration: Duration, success: bool) {
        tracing::info!(path, duration_ms = duration.as_millis() as u64, success, "Provisioning finished");
    }

    fn sla_violation(&self, alert: &SlaAlert) {
        tracing::warn!(
            request = %alert.request_id,
            workspace = ?alert.workspace_id,
            path = %alert.path,
            duration_secs = alert.duration.as_secs(),
            threshold_secs = alert.threshold.as_secs(),
            "Provisioning SLA exceeded"
        );
    }

    fn circuit_transition(&self, endpoint: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(endpoint, %from, %to, "Circuit transition");
    }

    fn provisioning_summary(&self, s: &MonitorSnapshot) {
        tracing::info!(
            completed = s.completed,
            success_rate = s.success_rate,
            p50_ms = s.p50.map(|d| d.as_millis() as u64),
            p95_ms = s.p95.map(|d| d.as_millis() as u64),
            p99_ms = s.p99.map(|d| d.as_millis() as u64),
            sla_violations = s.sla_violations,
            "Provisioning summary"
        );
    }
}

/// Handle for one observed provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSpan {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration: Duration,
    success: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    samples: VecDeque<Sample>,
    open: HashMap<String, DateTime<Utc>>,
    completed: u64,
    succeeded: u64,
    sla_violations: u64,
}

pub struct ProvisioningMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    sink: Arc<dyn MetricsSink>,
    state: Mutex<MonitorState>,
}

impl ProvisioningMonitor {
    pub fn new(config: MonitorConfig, clock: SharedClock, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            clock,
            sink,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn sla_threshold(&self) -> Duration {
        Duration::from_secs(self.config.sla_threshold_secs)
    }

    /// Mark the start of a provisioning request
    pub fn begin(&self) -> ProvisioningSpan {
        let span = ProvisioningSpan {
            request_id: uuid::Uuid::new_v4().to_string(),
            started_at: self.clock.now(),
        };
        self.state.lock().open.insert(span.request_id.clone(), span.started_at);
        span
    }

    /// Record the outcome of `span` served through `path`
    pub fn complete(&self, span: &ProvisioningSpan, path: &str, workspace_id: Option<&str>, success: bool) -> Duration {
        let duration = (self.clock.now() - span.started_at).to_std().unwrap_or(Duration::ZERO);
        let threshold = self.sla_threshold();
        let violated = success && duration > threshold;

        {
            let mut state = self.state.lock();
            state.open.remove(&span.request_id);
            state.completed += 1;
            if success {
                state.succeeded += 1;
            }
            if violated {
                state.sla_violations += 1;
            }
            state.samples.push_back(Sample { duration, success });
            while state.samples.len() > self.config.sample_window.max(1) {
                state.samples.pop_front();
            }
        }

        self.guarded(|sink| sink.provisioning_duration(path, duration, success));
        if violated {
            let alert = SlaAlert {
                request_id: span.request_id.clone(),
                workspace_id: workspace_id.map(str::to_string),
                path: path.to_string(),
                duration,
                threshold,
            };
            self.guarded(|sink| sink.sla_violation(&alert));
        }
        duration
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state.lock();
        let mut durations: Vec<Duration> = state
            .samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration)
            .collect();
        durations.sort();

        let window_total = state.samples.len();
        let window_ok = state.samples.iter().filter(|s| s.success).count();
        MonitorSnapshot {
            completed: state.completed,
            succeeded: state.succeeded,
            success_rate: if window_total == 0 {
                1.0
            } else {
                window_ok as f64 / window_total as f64
            },
            p50: percentile(&durations, 50.0),
            p95: percentile(&durations, 95.0),
            p99: percentile(&durations, 99.0),
            sla_violations: state.sla_violations,
            in_progress: state.open.len(),
        }
    }

    /// Push the current aggregates to the sink
    pub fn emit(&self) {
        let snapshot = self.snapshot();
        self.guarded(|sink| sink.provisioning_summary(&snapshot));
    }

    fn guarded(&self, f: impl FnOnce(&dyn MetricsSink)) {
        let sink = self.sink.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(sink))).is_err() {
            tracing::warn!("Metrics sink panicked; provisioning unaffected");
        }
    }
}

/// Nearest-rank percentile over sorted values
fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<SlaAlert>>,
        durations: Mutex<Vec<(String, Duration, bool)>>,
    }

    impl MetricsSink for RecordingSink {
        fn provisioning_duration(&self, path: &str, duration: Duration, success: bool) {
            self.durations.lock().push((path.to_string(), duration, success));
        }
        fn sla_violation(&self, alert: &SlaAlert) {
            self.alerts.lock().push(alert.clone());
        }
        fn circuit_transition(&self, _: &str, _: CircuitState, _: CircuitState) {}
        fn provisioning_summary(&self, _: &MonitorSnapshot) {}
    }

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn provisioning_duration(&self, _: &str, _: Duration, _: bool) {
            panic!("sink down");
        }
        fn sla_violation(&self, _: &SlaAlert) {
            panic!("sink down");
        }
        fn circuit_transition(&self, _: &str, _: CircuitState, _: CircuitState) {}
        fn provisioning_summary(&self, _: &MonitorSnapshot) {
            panic!("sink down");
        }
    }

    fn monitor(sink: Arc<dyn MetricsSink>) -> (ProvisioningMonitor, ManualClock) {
        let clock = ManualClock::starting_now();
        let monitor = ProvisioningMonitor::new(MonitorConfig::default(), Arc::new(clock.clone()), sink);
        (monitor, clock)
    }

    #[test]
    fn test_sla_alert_when_threshold_exceeded() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, clock) = monitor(sink.clone());

        let fast = monitor.begin();
        clock.advance(chrono::Duration::seconds(20));
        monitor.complete(&fast, "pooled", Some("ws-1"), true);

        let slow = monitor.begin();
        clock.advance(chrono::Duration::minutes(6));
        let took = monitor.complete(&slow, "on_demand", Some("ws-2"), true);

        assert_eq!(took, Duration::from_secs(360));
        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].workspace_id.as_deref(), Some("ws-2"));
        assert_eq!(alerts[0].path, "on_demand");
        assert_eq!(monitor.snapshot().sla_violations, 1);
        assert_eq!(sink.durations.lock().len(), 2);
    }

    #[test]
    fn test_percentiles_and_success_rate() {
        let (monitor, clock) = monitor(Arc::new(TracingMetricsSink));

        for secs in 1..=100 {
            let span = monitor.begin();
            clock.advance(chrono::Duration::seconds(secs));
            monitor.complete(&span, "on_demand", None, true);
        }
        let failed = monitor.begin();
        monitor.complete(&failed, "on_demand", None, false);

        let snap = monitor.snapshot();
        assert_eq!(snap.completed, 101);
        assert_eq!(snap.succeeded, 100);
        assert_eq!(snap.p50, Some(Duration::from_secs(50)));
        assert_eq!(snap.p95, Some(Duration::from_secs(95)));
        assert_eq!(snap.p99, Some(Duration::from_secs(99)));
        assert!((snap.success_rate - 100.0 / 101.0).abs() < 1e-9);
        assert_eq!(snap.in_progress, 0);
    }

    #[test]
    fn test_sink_panic_is_contained() {
        let (monitor, clock) = monitor(Arc::new(PanickingSink));
        let span = monitor.begin();
        clock.advance(chrono::Duration::minutes(10));
        monitor.complete(&span, "on_demand", None, true);
        monitor.emit();
        assert_eq!(monitor.snapshot().completed, 1);
    }

    #[test]
    fn test_in_progress_tracking() {
        let (monitor, _) = monitor(Arc::new(TracingMetricsSink));
        let a = monitor.begin();
        let _b = monitor.begin();
        assert_eq!(monitor.snapshot().in_progress, 2);
        monitor.complete(&a, "pooled", None, true);
        assert_eq!(monitor.snapshot().in_progress, 1);
        assert_eq!(monitor.snapshot().p50, Some(Duration::ZERO));
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(&[], 50.0), None);
    }
}
