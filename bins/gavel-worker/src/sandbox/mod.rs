/// Sandbox Runner - capability interface over isolation backends
///
/// **Core Responsibility:**
/// Run one artifact against one input under a `ResourceLimits` ceiling and
/// report what happened, without judging it.
///
/// **Critical Architectural Boundary:**
/// - A sandbox knows HOW to isolate (process groups, containers)
/// - A sandbox does NOT compare output or assign verdicts
/// - Infrastructure failures surface as `SandboxError`; anything the user
///   program did (crash, timeout, memory blow-up) is a normal `Ok` result
///
/// Backends: `ProcessSandbox` for local processes, `DockerSandbox` for
/// containers. The evaluator only holds `Arc<dyn Sandbox>`.
pub mod docker;
pub mod process;
mod procfs;

pub use docker::DockerSandbox;
pub use process::{ProcessSandbox, ProcessSandboxOptions};

use crate::build::BuildArtifact;
use crate::limits::ResourceLimits;
use crate::metrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
}

/// What one run did. Streams are already capped at the configured ceilings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExecutionResult {
    pub exit_code: Option<i32>,
    /// Terminating signal, when the platform reports one.
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_total_bytes: u64,
    pub duration_ms: u64,
    /// `None` when the backend cannot observe memory use.
    pub memory_peak_bytes: Option<u64>,
    pub timed_out: bool,
    pub oom: bool,
    /// Killed because the caller cancelled the evaluation.
    pub cancelled: bool,
}

impl RawExecutionResult {
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

/// Point-in-time counters for one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxUsage {
    pub active: usize,
    pub launched: u64,
    pub killed: u64,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `artifact` with `input` on stdin. Returns once the program and
    /// everything it spawned are gone.
    async fn run(
        &self,
        artifact: &BuildArtifact,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, SandboxError>;

    /// Kill every run currently in flight on this backend.
    async fn terminate(&self);

    fn resource_usage(&self) -> SandboxUsage;
}

#[async_trait]
impl<S: Sandbox + ?Sized> Sandbox for Arc<S> {
    async fn run(
        &self,
        artifact: &BuildArtifact,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, SandboxError> {
        (**self).run(artifact, input, limits, cancel).await
    }

    async fn terminate(&self) {
        (**self).terminate().await
    }

    fn resource_usage(&self) -> SandboxUsage {
        (**self).resource_usage()
    }
}

/// Shared bookkeeping behind `Sandbox::resource_usage`.
#[derive(Debug, Default)]
pub(crate) struct UsageCounters {
    active: AtomicUsize,
    launched: AtomicU64,
    killed: AtomicU64,
}

impl UsageCounters {
    /// Count a launch; the returned guard marks the run finished on drop.
    pub(crate) fn launch(&self) -> ActiveRun<'_> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIVE_SANDBOXES.inc();
        ActiveRun { counters: self }
    }

    pub(crate) fn record_kill(&self) {
        self.killed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> SandboxUsage {
        SandboxUsage {
            active: self.active.load(Ordering::SeqCst),
            launched: self.launched.load(Ordering::SeqCst),
            killed: self.killed.load(Ordering::SeqCst),
        }
    }
}

pub(crate) struct ActiveRun<'a> {
    counters: &'a UsageCounters,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_SANDBOXES.dec();
    }
}

/// How a run was stopped early, if it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Timeout,
    MemoryLimit,
    Cancelled,
}

impl Termination {
    pub(crate) fn apply(self, result: &mut RawExecutionResult) {
        match self {
            Termination::Timeout => result.timed_out = true,
            Termination::MemoryLimit => result.oom = true,
            Termination::Cancelled => result.cancelled = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_guard_tracks_active_runs() {
        let counters = UsageCounters::default();
        {
            let _a = counters.launch();
            let _b = counters.launch();
            assert_eq!(counters.snapshot().active, 2);
        }
        counters.record_kill();

        let usage = counters.snapshot();
        assert_eq!(usage, SandboxUsage { active: 0, launched: 2, killed: 1 });
    }

    #[test]
    fn test_clean_exit() {
        let mut raw = RawExecutionResult {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(raw.exited_cleanly());

        raw.signal = Some(9);
        assert!(!raw.exited_cleanly());
    }

    #[test]
    fn test_termination_sets_flag() {
        let mut raw = RawExecutionResult::default();
        Termination::MemoryLimit.apply(&mut raw);
        assert!(raw.oom && !raw.timed_out && !raw.cancelled);
    }
}
