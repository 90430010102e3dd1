/// Build Manager
///
/// **Core Responsibility:**
/// Turn a submission into something the sandbox can run, exactly once per
/// (source hash, language, entry point).
///
/// - Compiled languages: the registry's compile command runs in a scoped
///   workspace under the build time limit. Non-zero exit or timeout is a
///   compile error carrying the truncated compiler output.
/// - Interpreted languages: an optional syntax check, then the source file
///   itself is the artifact.
/// - Identical concurrent builds share one compiler invocation. Failed
///   builds are never cached.
///
/// The workspace directory lives as long as the artifact does, so a cache
/// eviction never pulls files out from under a running evaluation.
use crate::limits::{excerpt, ResourceLimits};
use crate::metrics;
use crate::registry::{CommandTemplate, LanguageRegistry, LanguageSpec, TemplateVars};
use crate::sandbox::process::{drain, join_drain, kill_group, ProcessGroupGuard};
use gavel_common::config::EvaluatorConfig;
use gavel_common::types::{Language, Submission, SubmissionId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Largest accepted source file.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

const ARTIFACT_NAME: &str = "solution";

#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// The submission does not build. Carries the truncated toolchain output.
    #[error("{0}")]
    Compile(String),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),
    /// The toolchain could not be started at all.
    #[error("toolchain failure: {0}")]
    Toolchain(String),
    #[error("build workspace error: {0}")]
    Workspace(#[source] Arc<std::io::Error>),
}

impl BuildError {
    /// Whether the submission is at fault, as opposed to the host.
    pub fn is_user_fault(&self) -> bool {
        matches!(self, BuildError::Compile(_) | BuildError::UnsupportedLanguage(_))
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Workspace(Arc::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Compiler output: a binary, or the class directory for JVM languages.
    Compiled { binary: PathBuf },
    Interpreted { source: PathBuf },
}

/// Output of a successful build. Read-only once built.
#[derive(Debug)]
pub struct BuildArtifact {
    pub kind: ArtifactKind,
    pub language: Language,
    pub source_hash: SubmissionId,
    /// Fully rendered command line (program first).
    pub run_command: Vec<String>,
    /// Container image for the Docker sandbox.
    pub image: String,
    pub cpu_limit: f32,
    workspace: TempDir,
}

impl BuildArtifact {
    pub fn new(
        kind: ArtifactKind,
        language: Language,
        source_hash: SubmissionId,
        run_command: Vec<String>,
        workspace: TempDir,
    ) -> Self {
        Self {
            kind,
            language,
            source_hash,
            run_command,
            image: String::new(),
            cpu_limit: 1.0,
            workspace,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>, cpu_limit: f32) -> Self {
        self.image = image.into();
        self.cpu_limit = cpu_limit;
        self
    }

    pub fn workspace_dir(&self) -> &Path {
        self.workspace.path()
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, ArtifactKind::Compiled { .. })
    }
}

pub type BuildResult = Result<Arc<BuildArtifact>, BuildError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source_hash: SubmissionId,
    language: Language,
    entry: String,
}

struct CacheSlot {
    cell: Arc<OnceCell<BuildResult>>,
    last_used: u64,
}

/// LRU map of build slots. A slot is created before its build starts, so
/// concurrent callers for the same key all wait on one `OnceCell`.
struct BuildCache {
    slots: HashMap<CacheKey, CacheSlot>,
    capacity: usize,
    tick: u64,
}

impl BuildCache {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    /// Returns the slot for `key` and whether it already existed.
    fn slot(&mut self, key: &CacheKey) -> (Arc<OnceCell<BuildResult>>, bool) {
        self.tick += 1;
        let tick = self.tick;

        if let Some(slot) = self.slots.get_mut(key) {
            slot.last_used = tick;
            return (slot.cell.clone(), true);
        }

        while self.slots.len() >= self.capacity {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!(source_hash = %k.source_hash.short(), "Evicting build artifact");
                    self.slots.remove(&k);
                }
                None => break,
            }
        }

        let cell = Arc::new(OnceCell::new());
        self.slots.insert(
            key.clone(),
            CacheSlot {
                cell: cell.clone(),
                last_used: tick,
            },
        );
        (cell, false)
    }

    /// Drop a slot, but only if it is still the one the caller built into.
    fn forget(&mut self, key: &CacheKey, cell: &Arc<OnceCell<BuildResult>>) {
        if let Some(slot) = self.slots.get(key) {
            if Arc::ptr_eq(&slot.cell, cell) {
                self.slots.remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

pub struct BuildManager {
    registry: Arc<dyn LanguageRegistry>,
    cache: Mutex<BuildCache>,
    limits: ResourceLimits,
    kill_grace: Duration,
    work_root: PathBuf,
    compiler_invocations: AtomicU64,
}

impl BuildManager {
    pub fn new(registry: Arc<dyn LanguageRegistry>, config: &EvaluatorConfig) -> Self {
        Self {
            registry,
            cache: Mutex::new(BuildCache::new(config.build_cache_capacity)),
            limits: ResourceLimits::for_build(config),
            kill_grace: config.kill_grace(),
            work_root: config.work_root.clone(),
            compiler_invocations: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &dyn LanguageRegistry {
        self.registry.as_ref()
    }

    /// Number of toolchain processes (compilers and syntax checks) started so far.
    pub fn compiler_invocations(&self) -> u64 {
        self.compiler_invocations.load(Ordering::SeqCst)
    }

    pub fn cached_artifacts(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Build a submission, or join an identical build already in progress.
    #[instrument(skip(self, submission), fields(language = %submission.language))]
    pub async fn build(&self, submission: &Submission) -> BuildResult {
        if submission.source_code.len() > MAX_SOURCE_BYTES {
            return Err(BuildError::Compile(format!(
                "source exceeds maximum size of {} bytes",
                MAX_SOURCE_BYTES
            )));
        }

        let spec = self
            .registry
            .resolve(submission.language)
            .map_err(|_| BuildError::UnsupportedLanguage(submission.language))?;
        let entry = entry_point(submission, spec)?;

        let key = CacheKey {
            source_hash: submission.id(),
            language: submission.language,
            entry: entry.clone(),
        };

        let (cell, existed) = match self.cache.lock() {
            Ok(mut cache) => cache.slot(&key),
            // poisoned cache: build without sharing
            Err(_) => (Arc::new(OnceCell::new()), false),
        };
        metrics::record_build_cache(existed);

        let result = cell
            .get_or_init(|| self.build_uncached(submission, spec, &entry))
            .await
            .clone();

        if result.is_err() {
            if let Ok(mut cache) = self.cache.lock() {
                cache.forget(&key, &cell);
            }
        }
        result
    }

    async fn build_uncached(
        &self,
        submission: &Submission,
        spec: &LanguageSpec,
        entry: &str,
    ) -> BuildResult {
        let start = Instant::now();
        let source_hash = submission.id();

        let workspace = tempfile::Builder::new()
            .prefix(&format!("gavel-build-{}-", source_hash.short()))
            .tempdir_in(&self.work_root)?;

        let source_path = workspace.path().join(spec.source_file_name(entry));
        tokio::fs::write(&source_path, submission.source_code.as_bytes()).await?;

        let artifact_path = workspace.path().join(ARTIFACT_NAME);
        let vars = TemplateVars {
            source: source_path.display().to_string(),
            artifact: artifact_path.display().to_string(),
            dir: workspace.path().display().to_string(),
            entry: entry.to_string(),
        };

        let kind = match (&spec.compile, &spec.syntax_check) {
            (Some(compile), _) => {
                self.run_toolchain(compile, &vars, workspace.path()).await?;
                let binary = if artifact_path.exists() {
                    artifact_path
                } else {
                    workspace.path().to_path_buf()
                };
                ArtifactKind::Compiled { binary }
            }
            (None, Some(check)) => {
                self.run_toolchain(check, &vars, workspace.path()).await?;
                ArtifactKind::Interpreted { source: source_path }
            }
            (None, None) => ArtifactKind::Interpreted { source: source_path },
        };

        info!(
            build_time_ms = start.elapsed().as_millis() as u64,
            compiled = matches!(kind, ArtifactKind::Compiled { .. }),
            "Build succeeded"
        );

        let run_command = spec.run.render(&vars);
        let artifact =
            BuildArtifact::new(kind, submission.language, source_hash, run_command, workspace)
                .with_image(spec.image.clone(), spec.cpu_limit);
        Ok(Arc::new(artifact))
    }

    async fn run_toolchain(
        &self,
        template: &CommandTemplate,
        vars: &TemplateVars,
        dir: &Path,
    ) -> Result<(), BuildError> {
        let argv = template.render(vars);
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildError::Toolchain("empty toolchain command".to_string()));
        };

        self.compiler_invocations.fetch_add(1, Ordering::SeqCst);
        metrics::COMPILER_INVOCATIONS.inc();
        debug!(program = %program, "Invoking toolchain");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| BuildError::Toolchain(format!("failed to start {}: {}", program, e)))?;
        let pgid = child.id().map(|pid| pid as i32);
        let mut group = pgid.map(ProcessGroupGuard::new);

        // diagnostics are capped as they arrive, never buffered whole
        let cap = self.limits.stderr_bytes;
        let stdout_reader = child.stdout.take().map(|out| tokio::spawn(drain(out, cap)));
        let stderr_reader = child.stderr.take().map(|err| tokio::spawn(drain(err, cap)));

        let status = match tokio::time::timeout(self.limits.wall_time, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(BuildError::Toolchain(format!("{} failed: {}", program, e))),
            Err(_) => {
                let limit_ms = self.limits.wall_time.as_millis() as u64;
                warn!(limit_ms, "Build timed out");
                return Err(BuildError::Compile(format!(
                    "compilation timed out after {}ms",
                    limit_ms
                )));
            }
        };

        // compiler helpers left running would hold the pipes open
        if let Some(pgid) = pgid {
            kill_group(pgid);
        }
        if let Some(group) = group.as_mut() {
            group.disarm();
        }
        let stdout = join_drain(stdout_reader, self.kill_grace, cap).await;
        let stderr = join_drain(stderr_reader, self.kill_grace, cap).await;

        if status.success() {
            return Ok(());
        }

        let diagnostics = if stderr.total_bytes() == 0 {
            stdout.as_bytes()
        } else {
            stderr.as_bytes()
        };
        let mut message = excerpt(diagnostics, cap);
        if message.trim().is_empty() {
            message = match status.code() {
                Some(code) => format!("{} exited with code {}", program, code),
                None => format!("{} was terminated by a signal", program),
            };
        }
        warn!(error_preview = message.lines().next().unwrap_or(""), "Build failed");
        Err(BuildError::Compile(message))
    }
}

/// Entry point from the hint, restricted to identifier characters so it
/// can be spliced into file names.
fn entry_point(submission: &Submission, spec: &LanguageSpec) -> Result<String, BuildError> {
    match submission.entry_point_hint.as_deref() {
        None => Ok(spec.default_entry.clone()),
        Some(hint) => {
            let valid = !hint.is_empty()
                && hint.len() <= 128
                && hint.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if valid {
                Ok(hint.to_string())
            } else {
                Err(BuildError::Compile(format!("invalid entry point: {:?}", hint)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LanguageConfigManager;

    fn sh_registry() -> Arc<dyn LanguageRegistry> {
        let json = r#"{"languages": [
            {"name": "bash", "file_name": "main.sh",
             "syntax_check": {"command": "sh", "args": ["-n", "{source}"]},
             "run": {"command": "sh", "args": ["{source}"]}},
            {"name": "c", "file_name": "main.c",
             "compile": {"command": "sh", "args": ["-c",
                 "sh -n \"$0\" && cp \"$0\" \"$1\" && chmod +x \"$1\"", "{source}", "{artifact}"]},
             "run": {"command": "sh", "args": ["{artifact}"]}},
            {"name": "java", "file_name": "{entry}.java",
             "run": {"command": "cat", "args": ["{source}"]}},
            {"name": "rust", "file_name": "main.rs",
             "compile": {"command": "sh", "args": ["-c",
                 "head -c 20000000 /dev/zero | tr '\\0' e >&2; exit 1"]},
             "run": {"command": "{artifact}"}}
        ]}"#;
        Arc::new(LanguageConfigManager::from_json(json).unwrap())
    }

    fn manager() -> BuildManager {
        BuildManager::new(sh_registry(), &EvaluatorConfig::default())
    }

    #[tokio::test]
    async fn test_compiled_build_produces_binary() {
        let manager = manager();
        let artifact = manager
            .build(&Submission::new(Language::C, "echo hi\n"))
            .await
            .unwrap();

        match &artifact.kind {
            ArtifactKind::Compiled { binary } => assert!(binary.exists()),
            other => panic!("expected compiled artifact, got {:?}", other),
        }
        assert_eq!(artifact.run_command[0], "sh");
        assert_eq!(manager.compiler_invocations(), 1);
    }

    #[tokio::test]
    async fn test_compile_error_carries_message() {
        let manager = manager();
        let err = manager
            .build(&Submission::new(Language::C, "if then fi (\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Compile(ref msg) if !msg.is_empty()));
        assert!(err.is_user_fault());
        assert_eq!(manager.cached_artifacts(), 0);
    }

    #[tokio::test]
    async fn test_compiler_flood_is_capped() {
        let config = EvaluatorConfig::default();
        let manager = manager();
        let err = manager
            .build(&Submission::new(Language::Rust, "fn main() {}\n"))
            .await
            .unwrap_err();

        match err {
            BuildError::Compile(message) => {
                assert_eq!(message.len(), config.stderr_excerpt_bytes);
                assert!(message.bytes().all(|b| b == b'e'));
            }
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identical_source_builds_once() {
        let manager = manager();
        let submission = Submission::new(Language::C, "echo cached\n");
        let a = manager.build(&submission).await.unwrap();
        let b = manager.build(&submission).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.compiler_invocations(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried_not_cached() {
        let manager = manager();
        let submission = Submission::new(Language::Bash, "case in\n");
        assert!(manager.build(&submission).await.is_err());
        assert!(manager.build(&submission).await.is_err());
        assert_eq!(manager.compiler_invocations(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let err = manager()
            .build(&Submission::new(Language::Go, "package main"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedLanguage(Language::Go)));
        assert!(err.is_user_fault());
    }

    #[tokio::test]
    async fn test_oversized_source_rejected() {
        let source = "#".repeat(MAX_SOURCE_BYTES + 1);
        let manager = manager();
        let err = manager.build(&Submission::new(Language::Bash, source)).await.unwrap_err();
        assert!(err.to_string().contains("maximum size"));
        assert_eq!(manager.compiler_invocations(), 0);
    }

    #[tokio::test]
    async fn test_entry_point_names_source_file() {
        let manager = manager();
        let artifact = manager
            .build(
                &Submission::new(Language::Java, "class Solution {}").with_entry_point("Solution"),
            )
            .await
            .unwrap();
        assert!(artifact.run_command[1].ends_with("Solution.java"));

        let err = manager
            .build(
                &Submission::new(Language::Java, "class A {}").with_entry_point("../../etc/passwd"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Compile(_)));
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_host_fault() {
        let json = r#"{"languages": [{"name": "rust", "file_name": "main.rs",
            "compile": {"command": "/nonexistent/rustc", "args": ["{source}"]},
            "run": {"command": "{artifact}"}}]}"#;
        let registry: Arc<dyn LanguageRegistry> =
            Arc::new(LanguageConfigManager::from_json(json).unwrap());
        let manager = BuildManager::new(registry, &EvaluatorConfig::default());

        let err = manager
            .build(&Submission::new(Language::Rust, "fn main() {}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Toolchain(_)));
        assert!(!err.is_user_fault());
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = BuildCache::new(2);
        let key = |n: &str| CacheKey {
            source_hash: Submission::new(Language::Bash, n).id(),
            language: Language::Bash,
            entry: "Main".to_string(),
        };

        cache.slot(&key("a"));
        cache.slot(&key("b"));
        // touch a so b becomes the oldest
        assert!(cache.slot(&key("a")).1);
        cache.slot(&key("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.slot(&key("a")).1);
        assert!(!cache.slot(&key("b")).1);
    }
}
