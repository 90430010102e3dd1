/// Evaluator - orchestration of build, sandboxed runs and scoring
///
/// **Core Responsibility:**
/// `evaluate(submission, test_cases)` always returns a fully populated
/// `EvaluationResult`: one outcome per test case, in ordinal order.
///
/// **Phases:**
/// `Pending -> Building -> (CompileFailed | Running) -> Aggregating -> Done`
///
/// **Rules:**
/// - A failed build is broadcast to every ordinal; the sandbox never runs
/// - Every test case runs, on a bounded pool, whatever its siblings did
/// - Infrastructure failures are retried; user-code verdicts never are
/// - Cancellation kills in-flight runs and marks the rest `Skipped`
/// - Results land in slots indexed by position, so completion order never
///   leaks into the report
use crate::build::{BuildArtifact, BuildManager};
use crate::comparator;
use crate::limits::{excerpt, ResourceLimits};
use crate::metrics;
use crate::sandbox::{RawExecutionResult, Sandbox};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use gavel_common::config::EvaluatorConfig;
use gavel_common::types::{
    overall_status, EvaluationRequest, EvaluationResult, ExecutionOutcome, Submission, TestCase,
    TestStatus,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Largest test input handed to a sandbox.
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Building,
    CompileFailed,
    Running,
    Aggregating,
    Done,
}

enum BuildPhase {
    Ready(Arc<BuildArtifact>),
    Failed { status: TestStatus, message: String },
    Cancelled,
}

pub struct Evaluator {
    builds: Arc<BuildManager>,
    sandbox: Arc<dyn Sandbox>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(
        builds: Arc<BuildManager>,
        sandbox: Arc<dyn Sandbox>,
        config: EvaluatorConfig,
    ) -> Self {
        Self { builds, sandbox, config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn build_manager(&self) -> &BuildManager {
        &self.builds
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub async fn evaluate_request(
        &self,
        request: &EvaluationRequest,
        cancel: &CancellationToken,
    ) -> EvaluationResult {
        self.evaluate(&request.submission, &request.test_cases, cancel).await
    }

    #[instrument(
        skip_all,
        fields(
            evaluation_id = tracing::field::Empty,
            language = %submission.language,
            test_count = test_cases.len()
        )
    )]
    pub async fn evaluate(
        &self,
        submission: &Submission,
        test_cases: &[TestCase],
        cancel: &CancellationToken,
    ) -> EvaluationResult {
        let evaluation_id = Uuid::new_v4();
        tracing::Span::current().record("evaluation_id", tracing::field::display(evaluation_id));
        let started_at = Utc::now();
        let start = Instant::now();
        let submission_id = submission.id();

        let mut cases: Vec<&TestCase> = test_cases.iter().collect();
        cases.sort_by_key(|tc| tc.ordinal);

        transition(Phase::Pending, Phase::Building);
        let per_test = match self.build(submission, cancel).await {
            BuildPhase::Ready(artifact) => {
                transition(Phase::Building, Phase::Running);
                let per_test = self.run_all(&artifact, &cases, cancel).await;
                transition(Phase::Running, Phase::Aggregating);
                per_test
            }
            BuildPhase::Failed { status, message } => {
                transition(Phase::Building, Phase::CompileFailed);
                info!(
                    status = %status,
                    error_preview = message.lines().next().unwrap_or(""),
                    "Build failed, skipping execution"
                );
                cases
                    .iter()
                    .map(|tc| ExecutionOutcome::not_run(tc.ordinal, status, Some(message.clone())))
                    .collect()
            }
            BuildPhase::Cancelled => {
                transition(Phase::Building, Phase::Aggregating);
                cases
                    .iter()
                    .map(|tc| {
                        let message = Some("cancelled".to_string());
                        ExecutionOutcome::not_run(tc.ordinal, TestStatus::Skipped, message)
                    })
                    .collect()
            }
        };

        let cancelled = per_test.iter().any(|o| o.status == TestStatus::Skipped);
        let (status, first_failing_ordinal) = overall_status(&per_test, cancelled);
        let passed = per_test.iter().filter(|o| o.status.is_pass()).count();
        let total_duration_ms = start.elapsed().as_millis() as u64;

        for outcome in &per_test {
            metrics::record_test_outcome(outcome.status);
        }
        metrics::record_evaluation(status);
        transition(Phase::Aggregating, Phase::Done);

        info!(
            submission_id = %submission_id.short(),
            status = %status,
            passed,
            total = per_test.len(),
            total_duration_ms,
            "Evaluation complete"
        );

        EvaluationResult {
            evaluation_id,
            submission_id,
            overall_status: status,
            first_failing_ordinal,
            passed,
            total: per_test.len(),
            per_test,
            total_duration_ms,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn build(&self, submission: &Submission, cancel: &CancellationToken) -> BuildPhase {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return BuildPhase::Cancelled,
                result = self.builds.build(submission) => result,
            };

            match result {
                Ok(artifact) => return BuildPhase::Ready(artifact),
                Err(e) if e.is_user_fault() => {
                    return BuildPhase::Failed {
                        status: TestStatus::CompileError,
                        message: e.to_string(),
                    }
                }
                Err(e) if attempt < self.config.internal_error_retries => {
                    attempt += 1;
                    metrics::INTERNAL_RETRIES.inc();
                    warn!(error = %e, attempt, "Build infrastructure failure, retrying");
                }
                Err(e) => {
                    return BuildPhase::Failed {
                        status: TestStatus::InternalError,
                        message: e.to_string(),
                    }
                }
            }
        }
    }

    async fn run_all(
        &self,
        artifact: &BuildArtifact,
        cases: &[&TestCase],
        cancel: &CancellationToken,
    ) -> Vec<ExecutionOutcome> {
        let mut slots: Vec<Option<ExecutionOutcome>> = vec![None; cases.len()];
        let pool_size = self.config.worker_pool_size.max(1);

        let mut completed = stream::iter(cases.iter().enumerate())
            .map(|(slot, tc)| async move { (slot, self.run_one(artifact, tc, cancel).await) })
            .buffer_unordered(pool_size);

        while let Some((slot, outcome)) = completed.next().await {
            debug!(
                ordinal = outcome.test_ordinal,
                status = %outcome.status,
                duration_ms = outcome.duration_ms,
                "Test finished"
            );
            slots[slot] = Some(outcome);
        }

        slots
            .into_iter()
            .zip(cases)
            .map(|(outcome, tc)| {
                outcome.unwrap_or_else(|| {
                    ExecutionOutcome::not_run(tc.ordinal, TestStatus::Skipped, None)
                })
            })
            .collect()
    }

    async fn run_one(
        &self,
        artifact: &BuildArtifact,
        test_case: &TestCase,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if test_case.input.len() > MAX_TEST_INPUT_BYTES {
            return ExecutionOutcome::not_run(
                test_case.ordinal,
                TestStatus::InternalError,
                Some(format!("test input exceeds maximum size of {} bytes", MAX_TEST_INPUT_BYTES)),
            );
        }

        let limits = ResourceLimits::for_test(test_case, &self.config);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return ExecutionOutcome::not_run(
                    test_case.ordinal,
                    TestStatus::Skipped,
                    Some("cancelled".to_string()),
                );
            }

            match self.sandbox.run(artifact, &test_case.input, &limits, cancel).await {
                Ok(raw) => return classify(test_case, &raw, self.config.stderr_excerpt_bytes),
                Err(e) if attempt < self.config.internal_error_retries => {
                    attempt += 1;
                    metrics::INTERNAL_RETRIES.inc();
                    warn!(
                        ordinal = test_case.ordinal,
                        error = %e,
                        attempt,
                        "Sandbox failure, retrying"
                    );
                }
                Err(e) => {
                    warn!(ordinal = test_case.ordinal, error = %e, "Sandbox failure, giving up");
                    return ExecutionOutcome::not_run(
                        test_case.ordinal,
                        TestStatus::InternalError,
                        Some(e.to_string()),
                    );
                }
            }
        }
    }
}

fn transition(from: Phase, to: Phase) {
    debug!(from = ?from, to = ?to, "Evaluation phase");
}

/// Turn a raw run into a verdict.
///
/// Priority: cancelled, timeout, memory, abnormal exit, then output.
pub fn classify(
    test_case: &TestCase,
    raw: &RawExecutionResult,
    stderr_cap: usize,
) -> ExecutionOutcome {
    let (status, message) = if raw.cancelled {
        (TestStatus::Skipped, Some("cancelled".to_string()))
    } else if raw.timed_out {
        (
            TestStatus::TimeLimitExceeded,
            Some(format!("exceeded time limit of {}ms", test_case.time_limit_ms)),
        )
    } else if raw.oom {
        (
            TestStatus::MemoryLimitExceeded,
            Some(format!("exceeded memory limit of {} bytes", test_case.memory_limit_bytes)),
        )
    } else if !raw.exited_cleanly() {
        let message = match (raw.signal, raw.exit_code) {
            (Some(signal), _) => format!("terminated by signal {}", signal),
            (None, Some(code)) => format!("exited with code {}", code),
            (None, None) => "exited abnormally".to_string(),
        };
        (TestStatus::RuntimeError, Some(message))
    } else if raw.stdout_truncated {
        (
            TestStatus::WrongAnswer,
            Some(format!("output exceeded {} bytes", raw.stdout.len())),
        )
    } else if comparator::compare(&raw.stdout, &test_case.expected_output, test_case.comparison) {
        (TestStatus::Passed, None)
    } else {
        (TestStatus::WrongAnswer, None)
    };

    ExecutionOutcome {
        test_ordinal: test_case.ordinal,
        status,
        actual_output: String::from_utf8_lossy(&raw.stdout).into_owned(),
        stderr_excerpt: excerpt(&raw.stderr, stderr_cap),
        output_truncated: raw.stdout_truncated,
        duration_ms: raw.duration_ms,
        memory_peak_bytes: raw.memory_peak_bytes,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::ComparisonMode;

    fn raw(stdout: &str, exit_code: i32) -> RawExecutionResult {
        RawExecutionResult {
            exit_code: Some(exit_code),
            stdout: stdout.as_bytes().to_vec(),
            stdout_total_bytes: stdout.len() as u64,
            duration_ms: 12,
            ..Default::default()
        }
    }

    fn case(expected: &str) -> TestCase {
        TestCase::new(1, "", expected)
    }

    #[test]
    fn test_classify_exact_match() {
        let outcome = classify(&case("42"), &raw("42\n", 0), 64);
        assert_eq!(outcome.status, TestStatus::Passed);
        assert_eq!(outcome.actual_output, "42\n");
        assert_eq!(outcome.duration_ms, 12);
        assert!(outcome.message.is_none());
    }

    #[test]
    fn test_classify_mismatch() {
        let outcome = classify(&case("42"), &raw("43", 0), 64);
        assert_eq!(outcome.status, TestStatus::WrongAnswer);
    }

    #[test]
    fn test_classify_respects_mode() {
        let tc = case("42").with_comparison(ComparisonMode::Exact);
        assert_eq!(classify(&tc, &raw("42\n", 0), 64).status, TestStatus::WrongAnswer);
    }

    #[test]
    fn test_classify_runtime_error() {
        let mut result = raw("42", 1);
        result.stderr = b"Traceback (most recent call last)".to_vec();
        let outcome = classify(&case("42"), &result, 9);
        assert_eq!(outcome.status, TestStatus::RuntimeError);
        assert_eq!(outcome.stderr_excerpt, "Traceback");
        assert_eq!(outcome.message.as_deref(), Some("exited with code 1"));
    }

    #[test]
    fn test_classify_signal() {
        let result = RawExecutionResult {
            signal: Some(11),
            ..Default::default()
        };
        let outcome = classify(&case(""), &result, 64);
        assert_eq!(outcome.status, TestStatus::RuntimeError);
        assert_eq!(outcome.message.as_deref(), Some("terminated by signal 11"));
    }

    #[test]
    fn test_timeout_wins_over_exit_status() {
        let mut result = raw("", 137);
        result.timed_out = true;
        result.oom = true;
        assert_eq!(classify(&case(""), &result, 64).status, TestStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_classify_oom() {
        let mut result = raw("", 137);
        result.oom = true;
        assert_eq!(classify(&case(""), &result, 64).status, TestStatus::MemoryLimitExceeded);
    }

    #[test]
    fn test_classify_truncated_output() {
        let mut result = raw("yyyy", 0);
        result.stdout_truncated = true;
        result.stdout_total_bytes = 1 << 30;
        let outcome = classify(&case("yyyy"), &result, 64);
        assert_eq!(outcome.status, TestStatus::WrongAnswer);
        assert!(outcome.output_truncated);
    }

    #[test]
    fn test_classify_cancelled() {
        let mut result = raw("", 137);
        result.cancelled = true;
        assert_eq!(classify(&case(""), &result, 64).status, TestStatus::Skipped);
    }
}
