// Process-wide Prometheus metrics for evaluations, builds and sandboxes
use gavel_common::types::{OverallStatus, TestStatus};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("gavel".to_string()), None)
        .expect("valid registry prefix");

    pub static ref EVALUATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "evaluations_total",
        "Completed evaluations by overall status",
        &["status"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref TEST_OUTCOMES: IntCounterVec = register_int_counter_vec_with_registry!(
        "test_outcomes_total",
        "Per-test verdicts",
        &["status"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref BUILD_CACHE: IntCounterVec = register_int_counter_vec_with_registry!(
        "build_cache_total",
        "Build cache lookups by result",
        &["result"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref COMPILER_INVOCATIONS: IntCounter = register_int_counter_with_registry!(
        "compiler_invocations_total",
        "Toolchain processes started by the build manager",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref INTERNAL_RETRIES: IntCounter = register_int_counter_with_registry!(
        "internal_retries_total",
        "Retries after infrastructure failures",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref SANDBOX_RUN_SECONDS: Histogram = register_histogram_with_registry!(
        "sandbox_run_seconds",
        "Wall time of sandboxed runs",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref ACTIVE_SANDBOXES: IntGauge = register_int_gauge_with_registry!(
        "active_sandboxes",
        "Sandboxed runs currently in flight",
        REGISTRY
    )
    .expect("metric can be registered");
}

pub fn record_evaluation(status: OverallStatus) {
    EVALUATIONS.with_label_values(&[status.as_str()]).inc();
}

pub fn record_test_outcome(status: TestStatus) {
    TEST_OUTCOMES.with_label_values(&[status.as_str()]).inc();
}

pub fn record_build_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    BUILD_CACHE.with_label_values(&[result]).inc();
}

/// Text exposition of every metric above.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_prefixed_names() {
        record_build_cache(true);
        record_test_outcome(TestStatus::Passed);
        COMPILER_INVOCATIONS.inc();

        let text = render();
        assert!(text.contains("gavel_build_cache_total{result=\"hit\"}"));
        assert!(text.contains("gavel_test_outcomes_total{status=\"passed\"}"));
        assert!(text.contains("gavel_compiler_invocations_total"));
    }
}
