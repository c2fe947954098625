//! Prometheus metrics
//!
//! All metrics live in the default registry and are exposed by the
//! dashboard at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Agent turns by outcome (success, error, timeout)
    pub static ref TURNS: CounterVec = register_counter_vec!(
        "sparkvisor_turns_total",
        "Agent turns by outcome",
        &["outcome"]
    )
    .expect("failed to register TURNS metric");

    pub static ref TURN_DURATION: Histogram = register_histogram!(
        "sparkvisor_turn_duration_seconds",
        "Wall time of one chat turn, lock acquisition to chat_update",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    )
    .expect("failed to register TURN_DURATION metric");

    /// Model call duration by phase (plan, execute, merge, commit_message, follow_ups)
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "sparkvisor_model_call_duration_seconds",
        "Model call duration by phase",
        &["phase"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("failed to register MODEL_CALL_DURATION metric");

    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "sparkvisor_tool_calls_total",
        "Tool invocations by tool name",
        &["tool"]
    )
    .expect("failed to register TOOL_CALLS metric");

    /// Sandbox bring-up attempts by service kind and outcome (ready, not_ready, failed)
    pub static ref SANDBOX_START_ATTEMPTS: CounterVec = register_counter_vec!(
        "sparkvisor_sandbox_start_attempts_total",
        "Sandbox bring-up attempts by service kind and outcome",
        &["kind", "outcome"]
    )
    .expect("failed to register SANDBOX_START_ATTEMPTS metric");

    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "sparkvisor_status_transitions_total",
        "Sandbox status assignments by target status",
        &["status"]
    )
    .expect("failed to register STATUS_TRANSITIONS metric");

    /// File patches written, by result (written, merged, failed)
    pub static ref PATCHES_APPLIED: CounterVec = register_counter_vec!(
        "sparkvisor_patches_applied_total",
        "File patches applied to sandboxes by result",
        &["result"]
    )
    .expect("failed to register PATCHES_APPLIED metric");

    pub static ref LIVE_LISTENERS: Gauge = register_gauge!(
        "sparkvisor_live_listeners",
        "Listeners currently attached across all projects"
    )
    .expect("failed to register LIVE_LISTENERS metric");

    pub static ref LIVE_PROJECT_MANAGERS: Gauge = register_gauge!(
        "sparkvisor_live_project_managers",
        "Project managers currently held by the session registry"
    )
    .expect("failed to register LIVE_PROJECT_MANAGERS metric");
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_families() {
        TOOL_CALLS.with_label_values(&["navigate_to"]).inc();
        let text = render();
        assert!(text.contains("sparkvisor_tool_calls_total"));
    }
}
