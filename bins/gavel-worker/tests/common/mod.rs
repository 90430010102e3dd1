#![allow(dead_code)]

use async_trait::async_trait;
use gavel_common::config::EvaluatorConfig;
use gavel_common::types::{Language, Submission, TestCase};
use gavel_worker::build::BuildArtifact;
use gavel_worker::limits::ResourceLimits;
use gavel_worker::sandbox::{RawExecutionResult, SandboxError, SandboxUsage};
use gavel_worker::{
    BuildManager, Evaluator, LanguageConfigManager, LanguageRegistry, ProcessSandbox,
    ProcessSandboxOptions, Sandbox,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Toolchains built from POSIX sh so the suite runs on any Linux host.
/// "C" compiles by syntax-checking the script and copying it into place.
pub const SH_LANGUAGES: &str = r#"{"languages": [
    {"name": "bash", "file_name": "main.sh",
     "syntax_check": {"command": "sh", "args": ["-n", "{source}"]},
     "run": {"command": "sh", "args": ["{source}"]}},
    {"name": "c", "file_name": "main.c",
     "compile": {"command": "sh", "args": ["-c",
         "sleep 0.3 && sh -n \"$0\" && cp \"$0\" \"$1\" && chmod +x \"$1\"",
         "{source}", "{artifact}"]},
     "run": {"command": "sh", "args": ["{artifact}"]}}
]}"#;

pub fn registry() -> Arc<dyn LanguageRegistry> {
    Arc::new(LanguageConfigManager::from_json(SH_LANGUAGES).unwrap())
}

pub fn config() -> EvaluatorConfig {
    EvaluatorConfig {
        worker_pool_size: 4,
        ..EvaluatorConfig::default()
    }
}

pub fn process_sandbox() -> Arc<ProcessSandbox> {
    Arc::new(ProcessSandbox::new(ProcessSandboxOptions::from_config(&config())))
}

pub fn evaluator_with(sandbox: Arc<dyn Sandbox>, config: EvaluatorConfig) -> Evaluator {
    let builds = Arc::new(BuildManager::new(registry(), &config));
    Evaluator::new(builds, sandbox, config)
}

pub fn evaluator() -> Evaluator {
    evaluator_with(process_sandbox(), config())
}

pub fn script(source: &str) -> Submission {
    Submission::new(Language::Bash, source)
}

pub fn compiled(source: &str) -> Submission {
    Submission::new(Language::C, source)
}

pub fn case(ordinal: u32, input: &str, expected: &str) -> TestCase {
    TestCase::new(ordinal, input, expected)
}

/// Wraps a real sandbox and counts calls. The first `failures` calls fail
/// with an infrastructure error before reaching the inner sandbox.
pub struct CountingSandbox {
    inner: Arc<ProcessSandbox>,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl CountingSandbox {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            inner: process_sandbox(),
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for CountingSandbox {
    async fn run(
        &self,
        artifact: &BuildArtifact,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated host failure",
            )));
        }
        self.inner.run(artifact, input, limits, cancel).await
    }

    async fn terminate(&self) {
        self.inner.terminate().await
    }

    fn resource_usage(&self) -> SandboxUsage {
        self.inner.resource_usage()
    }
}
