use anyhow::{bail, Context, Result};
use gavel_common::config::EvaluatorConfig;
use gavel_common::types::{EvaluationResult, Language, Submission, TestCase, TestStatus};
use gavel_worker::registry::DEFAULT_LANGUAGES_PATH;
use gavel_worker::{
    metrics, BuildManager, DockerSandbox, Evaluator, LanguageConfigManager, LanguageRegistry,
    ProcessSandbox, ProcessSandboxOptions, Sandbox,
};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RunOptions {
    pub languages: Option<PathBuf>,
    pub lang: String,
    pub source: PathBuf,
    pub tests: PathBuf,
    pub entry: Option<String>,
    pub sandbox: String,
    pub json: bool,
    pub metrics: bool,
}

fn load_registry(path: Option<&Path>) -> Result<LanguageConfigManager> {
    match path {
        Some(path) => LanguageConfigManager::load(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None if Path::new(DEFAULT_LANGUAGES_PATH).exists() => {
            LanguageConfigManager::load_default().context("Failed to load config/languages.json")
        }
        None => Ok(LanguageConfigManager::builtin()),
    }
}

/// Accepts either a bare array of test cases or `{"test_cases": [...]}`.
fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum TestFile {
        Bare(Vec<TestCase>),
        Wrapped { test_cases: Vec<TestCase> },
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: TestFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test cases in {}", path.display()))?;
    Ok(match file {
        TestFile::Bare(cases) | TestFile::Wrapped { test_cases: cases } => cases,
    })
}

fn sandbox_backend(name: &str, config: &EvaluatorConfig) -> Result<Arc<dyn Sandbox>> {
    match name {
        "process" => Ok(Arc::new(ProcessSandbox::new(ProcessSandboxOptions::from_config(
            config,
        )))),
        "docker" => Ok(Arc::new(
            DockerSandbox::connect(config.work_root.clone())
                .context("Failed to connect to Docker daemon")?,
        )),
        other => bail!("Unknown sandbox '{}' (valid options: process, docker)", other),
    }
}

/// Evaluate a source file and print the report. Returns whether every test passed.
pub async fn run(options: RunOptions) -> Result<bool> {
    let language: Language = options.lang.parse()?;
    let source = fs::read_to_string(&options.source)
        .with_context(|| format!("Failed to read {}", options.source.display()))?;
    let tests = load_test_cases(&options.tests)?;

    let mut submission = Submission::new(language, source);
    if let Some(entry) = options.entry {
        submission = submission.with_entry_point(entry);
    }

    let config = EvaluatorConfig::from_env()?;
    let registry = load_registry(options.languages.as_deref())?;
    let sandbox = sandbox_backend(&options.sandbox, &config)?;
    let builds = Arc::new(BuildManager::new(Arc::new(registry), &config));
    let evaluator = Evaluator::new(builds, sandbox.clone(), config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠ Interrupted, cancelling evaluation...");
            trigger.cancel();
        }
    });

    let result = evaluator.evaluate(&submission, &tests, &cancel).await;
    ctrl_c.abort();
    sandbox.terminate().await;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", format_report(&result, &tests));
    }
    if options.metrics {
        println!();
        print!("{}", metrics::render());
    }

    Ok(result.passed == result.total)
}

/// Per-test report: number, input, expected, actual and a pass mark,
/// followed by a summary line.
pub fn format_report(result: &EvaluationResult, tests: &[TestCase]) -> String {
    let mut out = String::new();

    for outcome in &result.per_test {
        let test = tests.iter().find(|tc| tc.ordinal == outcome.test_ordinal);
        let mark = if outcome.status.is_pass() { "✅" } else { "❌" };

        let _ = writeln!(
            out,
            "Test Case {} {} {}",
            outcome.test_ordinal,
            mark,
            status_label(outcome.status)
        );
        if let Some(test) = test {
            let _ = writeln!(
                out,
                "  Input:           {}",
                inline(&String::from_utf8_lossy(&test.input))
            );
            let _ = writeln!(
                out,
                "  Expected Output: {}",
                inline(&String::from_utf8_lossy(&test.expected_output))
            );
        }
        let _ = writeln!(out, "  Your Output:     {}", inline(&outcome.actual_output));
        if let Some(message) = &outcome.message {
            let _ = writeln!(out, "  Note:            {}", inline(message));
        }
        if !outcome.stderr_excerpt.is_empty() && !outcome.status.is_pass() {
            let _ = writeln!(out, "  Stderr:          {}", inline(&outcome.stderr_excerpt));
        }
        let _ = writeln!(out, "  Time:            {}ms", outcome.duration_ms);
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "{}: {}/{} passed in {}ms",
        result.overall_status, result.passed, result.total, result.total_duration_ms
    );
    out
}

fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "Passed",
        TestStatus::WrongAnswer => "Wrong Answer",
        TestStatus::RuntimeError => "Runtime Error",
        TestStatus::TimeLimitExceeded => "Time Limit Exceeded",
        TestStatus::MemoryLimitExceeded => "Memory Limit Exceeded",
        TestStatus::CompileError => "Compile Error",
        TestStatus::InternalError => "Internal Error",
        TestStatus::Skipped => "Skipped",
    }
}

/// One-line rendering of multi-line text, shortened for the terminal.
fn inline(text: &str) -> String {
    const MAX: usize = 120;
    let flat = text.trim_end().replace('\n', "⏎ ");
    if flat.chars().count() > MAX {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{}…", cut)
    } else {
        flat
    }
}

/// List all configured languages
pub fn list_languages(path: Option<&Path>) -> Result<()> {
    let registry = load_registry(path)?;
    let languages = registry.languages();

    if languages.is_empty() {
        println!("No languages configured.");
        println!("\n💡 Write the defaults with: gavel-cli init");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<10} {:<10} {:<24} {:<10}", "Name", "Kind", "Source", "Image", "CPU");
    println!("{}", "─".repeat(72));

    for language in &languages {
        let spec = registry.resolve(*language)?;
        let kind = if spec.is_compiled() { "compiled" } else { "interpreted" };
        println!(
            "{:<12} {:<10} {:<10} {:<24} {:.1}",
            spec.name,
            kind,
            spec.source_file_name(&spec.default_entry),
            spec.image,
            spec.cpu_limit
        );
    }

    println!("\n✅ Total: {} language(s)", languages.len());
    Ok(())
}

/// Write the built-in toolchain set to <path>/config/languages.json
pub fn init_project(path: &Path, force: bool) -> Result<()> {
    println!("🚀 Initializing Gavel project at: {}", path.display());

    let config_dir = path.join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let languages_path = config_dir.join("languages.json");
    if languages_path.exists() && !force {
        println!("  ⏭  Kept existing: {}", languages_path.display());
        return Ok(());
    }

    let json = LanguageConfigManager::builtin().to_json_pretty()?;
    fs::write(&languages_path, json)
        .with_context(|| format!("Failed to write {}", languages_path.display()))?;
    println!("  ✅ Created: {}", languages_path.display());

    println!("\n📋 Next steps:");
    println!("  1. Adjust compiler flags and images in config/languages.json");
    println!(
        "  2. Evaluate a solution: gavel-cli run --lang python --source main.py --tests tests.json"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::{ExecutionOutcome, OverallStatus, Submission};

    fn result(per_test: Vec<ExecutionOutcome>) -> EvaluationResult {
        let passed = per_test.iter().filter(|o| o.status.is_pass()).count();
        let now = chrono::Utc::now();
        EvaluationResult {
            evaluation_id: uuid::Uuid::new_v4(),
            submission_id: Submission::new(Language::Python, "print(1)").id(),
            overall_status: OverallStatus::WrongAnswer,
            first_failing_ordinal: Some(2),
            passed,
            total: per_test.len(),
            per_test,
            total_duration_ms: 30,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_report_lists_every_case() {
        let tests = vec![TestCase::new(1, "1 2\n", "3"), TestCase::new(2, "2 2\n", "4")];
        let mut first = ExecutionOutcome::not_run(1, TestStatus::Passed, None);
        first.actual_output = "3\n".to_string();
        let mut second = ExecutionOutcome::not_run(2, TestStatus::WrongAnswer, None);
        second.actual_output = "5\n".to_string();

        let report = format_report(&result(vec![first, second]), &tests);

        assert!(report.contains("Test Case 1 ✅ Passed"));
        assert!(report.contains("Test Case 2 ❌ Wrong Answer"));
        assert!(report.contains("Expected Output: 4"));
        assert!(report.contains("Your Output:     5"));
        assert!(report.trim_end().ends_with("wrong_answer: 1/2 passed in 30ms"));
    }

    #[test]
    fn test_inline_flattens_and_shortens() {
        assert_eq!(inline("a\nb\n"), "a⏎ b");
        let long = "x".repeat(500);
        assert_eq!(inline(&long).chars().count(), 121);
    }

    #[test]
    fn test_load_test_cases_accepts_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        fs::write(&bare, r#"[{"ordinal": 1, "input": "", "expected_output": "x"}]"#).unwrap();
        let wrapped = dir.path().join("wrapped.json");
        fs::write(
            &wrapped,
            r#"{"test_cases": [{"ordinal": 1, "input": "", "expected_output": "x"},
                              {"ordinal": 2, "input": "", "expected_output": "y"}]}"#,
        )
        .unwrap();

        assert_eq!(load_test_cases(&bare).unwrap().len(), 1);
        assert_eq!(load_test_cases(&wrapped).unwrap().len(), 2);
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        init_project(dir.path(), false).unwrap();

        let path = dir.path().join("config/languages.json");
        let registry = LanguageConfigManager::load(&path).unwrap();
        assert_eq!(registry.languages().len(), Language::ALL.len());

        fs::write(&path, r#"{"languages": []}"#).unwrap();
        init_project(dir.path(), false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"languages": []}"#);
    }
}
