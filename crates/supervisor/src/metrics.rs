//! Prometheus metrics for the supervisor

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Supervisor runs by terminal status
    pub static ref SUPERVISOR_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_runs_total",
        "Total number of supervisor runs by terminal status",
        &["status"]
    )
    .unwrap();

    /// Agent steps by agent and outcome
    pub static ref SUPERVISOR_STEPS_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_steps_total",
        "Total number of agent steps by agent and outcome",
        &["agent", "outcome"]
    )
    .unwrap();

    /// Step retries by agent
    pub static ref SUPERVISOR_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_retries_total",
        "Total number of agent step retries",
        &["agent"]
    )
    .unwrap();

    /// Events emitted by type
    pub static ref SUPERVISOR_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_events_total",
        "Total number of supervisor events emitted by type",
        &["event_type"]
    )
    .unwrap();

    /// Outbound sends by status
    pub static ref SUPERVISOR_SENDS_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_sends_total",
        "Total number of outbound connection sends by status",
        &["status"]
    )
    .unwrap();

    /// Guarded operation outcomes
    pub static ref SUPERVISOR_RELIABILITY_TOTAL: CounterVec = register_counter_vec!(
        "supervisor_reliability_outcomes_total",
        "Outcomes of timeout-guarded operations",
        &["outcome"]
    )
    .unwrap();

    /// Runs currently executing
    pub static ref SUPERVISOR_ACTIVE_RUNS: Gauge = register_gauge!(
        "supervisor_active_runs",
        "Number of supervisor runs currently executing"
    )
    .unwrap();

    /// Registered client connections
    pub static ref SUPERVISOR_ACTIVE_CONNECTIONS: Gauge = register_gauge!(
        "supervisor_active_connections",
        "Number of registered client connections"
    )
    .unwrap();

    /// Step duration in seconds
    pub static ref SUPERVISOR_STEP_DURATION: HistogramVec = register_histogram_vec!(
        "supervisor_step_duration_seconds",
        "Duration of agent steps in seconds, retries included",
        &["agent"],
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_run(status: &str) {
    SUPERVISOR_RUNS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_step(agent: &str, outcome: &str, duration_secs: f64) {
    SUPERVISOR_STEPS_TOTAL
        .with_label_values(&[agent, outcome])
        .inc();
    SUPERVISOR_STEP_DURATION
        .with_label_values(&[agent])
        .observe(duration_secs);
}

pub fn record_retry(agent: &str) {
    SUPERVISOR_RETRIES_TOTAL.with_label_values(&[agent]).inc();
}

pub fn record_event(event_type: &str) {
    SUPERVISOR_EVENTS_TOTAL
        .with_label_values(&[event_type])
        .inc();
}

pub fn record_send(status: &str) {
    SUPERVISOR_SENDS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_reliability_outcome(outcome: &str) {
    SUPERVISOR_RELIABILITY_TOTAL
        .with_label_values(&[outcome])
        .inc();
}

pub fn set_active_runs(count: usize) {
    SUPERVISOR_ACTIVE_RUNS.set(count as f64);
}

pub fn set_active_connections(count: usize) {
    SUPERVISOR_ACTIVE_CONNECTIONS.set(count as f64);
}

pub fn active_connections() -> f64 {
    SUPERVISOR_ACTIVE_CONNECTIONS.get()
}

/// Share of outbound sends that did not succeed, 0.0 when nothing was sent
pub fn send_failure_rate() -> f64 {
    let ok = SUPERVISOR_SENDS_TOTAL.with_label_values(&["success"]).get();
    let failed = SUPERVISOR_SENDS_TOTAL.with_label_values(&["failure"]).get()
        + SUPERVISOR_SENDS_TOTAL.with_label_values(&["timeout"]).get();
    ratio(failed, ok + failed)
}

/// Share of runs that ended in error, 0.0 before any run finished
pub fn run_failure_rate() -> f64 {
    let ok = SUPERVISOR_RUNS_TOTAL.with_label_values(&["success"]).get();
    let failed = SUPERVISOR_RUNS_TOTAL.with_label_values(&["error"]).get();
    ratio(failed, ok + failed)
}

fn ratio(part: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        part / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        record_run("success");
        record_send("success");
        let text = export_metrics().unwrap();
        assert!(text.contains("supervisor_runs_total"));
        assert!(text.contains("supervisor_sends_total"));
    }

    #[test]
    fn test_rates_are_bounded() {
        record_send("failure");
        record_run("error");
        let send = send_failure_rate();
        let run = run_failure_rate();
        assert!((0.0..=1.0).contains(&send));
        assert!((0.0..=1.0).contains(&run));
    }
}
