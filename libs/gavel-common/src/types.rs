use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Languages a submission can be written in.
///
/// The toolchain behind each variant is resolved through the language
/// registry, never hard-coded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Rust,
    Cpp,
    C,
    JavaScript,
    Go,
    Bash,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Java,
        Language::Rust,
        Language::Cpp,
        Language::C,
        Language::JavaScript,
        Language::Go,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Rust => "rust",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::JavaScript => "javascript",
            Language::Go => "go",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lang = match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Language::Python,
            "java" => Language::Java,
            "rust" | "rs" => Language::Rust,
            "cpp" | "c++" => Language::Cpp,
            "c" => Language::C,
            "javascript" | "js" => Language::JavaScript,
            "go" => Language::Go,
            "bash" | "sh" => Language::Bash,
            _ => return Err(UnknownLanguage(s.to_string())),
        };
        Ok(lang)
    }
}

/// Content identity of a submission: hex SHA-256 over language and source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines and scratch directory names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub source_code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point_hint: Option<String>,
}

impl Submission {
    pub fn new(language: Language, source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language,
            entry_point_hint: None,
        }
    }

    pub fn with_entry_point(mut self, entry: impl Into<String>) -> Self {
        self.entry_point_hint = Some(entry.into());
        self
    }

    pub fn id(&self) -> SubmissionId {
        let mut hasher = Sha256::new();
        hasher.update(self.language.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.source_code.as_bytes());
        SubmissionId(format!("{:x}", hasher.finalize()))
    }
}

/// How actual output is matched against the expected output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComparisonMode {
    Exact,
    #[default]
    TrimmedWhitespace,
    NumericTolerance { epsilon: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub ordinal: u32,
    #[serde(with = "text_bytes")]
    pub input: Vec<u8>,
    #[serde(with = "text_bytes")]
    pub expected_output: Vec<u8>,
    #[serde(default)]
    pub comparison: ComparisonMode,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
}

fn default_time_limit_ms() -> u64 {
    2000
}

fn default_memory_limit_bytes() -> u64 {
    256 * 1024 * 1024
}

impl TestCase {
    pub fn new(
        ordinal: u32,
        input: impl Into<Vec<u8>>,
        expected_output: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ordinal,
            input: input.into(),
            expected_output: expected_output.into(),
            comparison: ComparisonMode::default(),
            time_limit_ms: default_time_limit_ms(),
            memory_limit_bytes: default_memory_limit_bytes(),
        }
    }

    pub fn with_comparison(mut self, comparison: ComparisonMode) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = limit.as_millis() as u64;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }
}

/// Everything a caller hands over for one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub submission: Submission,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompileError,
    InternalError,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::WrongAnswer => "wrong_answer",
            TestStatus::RuntimeError => "runtime_error",
            TestStatus::TimeLimitExceeded => "time_limit_exceeded",
            TestStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            TestStatus::CompileError => "compile_error",
            TestStatus::InternalError => "internal_error",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompileError,
    InternalError,
    Cancelled,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Accepted => "accepted",
            OverallStatus::WrongAnswer => "wrong_answer",
            OverallStatus::RuntimeError => "runtime_error",
            OverallStatus::TimeLimitExceeded => "time_limit_exceeded",
            OverallStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            OverallStatus::CompileError => "compile_error",
            OverallStatus::InternalError => "internal_error",
            OverallStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TestStatus> for OverallStatus {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Passed => OverallStatus::Accepted,
            TestStatus::WrongAnswer => OverallStatus::WrongAnswer,
            TestStatus::RuntimeError => OverallStatus::RuntimeError,
            TestStatus::TimeLimitExceeded => OverallStatus::TimeLimitExceeded,
            TestStatus::MemoryLimitExceeded => OverallStatus::MemoryLimitExceeded,
            TestStatus::CompileError => OverallStatus::CompileError,
            TestStatus::InternalError => OverallStatus::InternalError,
            TestStatus::Skipped => OverallStatus::Cancelled,
        }
    }
}

/// Verdict for one test case. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub test_ordinal: u32,
    pub status: TestStatus,
    pub actual_output: String,
    pub stderr_excerpt: String,
    #[serde(default)]
    pub output_truncated: bool,
    pub duration_ms: u64,
    pub memory_peak_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionOutcome {
    /// An outcome for a test case that never reached the sandbox.
    pub fn not_run(test_ordinal: u32, status: TestStatus, message: Option<String>) -> Self {
        Self {
            test_ordinal,
            status,
            actual_output: String::new(),
            stderr_excerpt: String::new(),
            output_truncated: false,
            duration_ms: 0,
            memory_peak_bytes: None,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluation_id: Uuid,
    pub submission_id: SubmissionId,
    pub overall_status: OverallStatus,
    pub first_failing_ordinal: Option<u32>,
    pub passed: usize,
    pub total: usize,
    pub per_test: Vec<ExecutionOutcome>,
    pub total_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Derive the overall verdict from outcomes already sorted by ordinal.
///
/// Accepted iff every outcome passed; otherwise the lowest-ordinal
/// non-passing outcome decides. A cancelled evaluation is always Cancelled.
pub fn overall_status(
    per_test: &[ExecutionOutcome],
    cancelled: bool,
) -> (OverallStatus, Option<u32>) {
    let first_failing = per_test.iter().find(|o| !o.status.is_pass());
    let first_ordinal = first_failing.map(|o| o.test_ordinal);
    if cancelled {
        return (OverallStatus::Cancelled, first_ordinal);
    }
    match first_failing {
        None => (OverallStatus::Accepted, None),
        Some(outcome) => (outcome.status.into(), first_ordinal),
    }
}

/// Serde adapter: byte payloads travel as UTF-8 text.
mod text_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_bytes())
    }
}
