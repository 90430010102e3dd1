// Evaluator configuration shared by the worker and the CLI
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Number of test cases run concurrently for one submission.
    pub worker_pool_size: usize,
    pub build_time_limit_ms: u64,
    /// Ceiling on captured stdout per run; excess is counted and dropped.
    pub output_byte_cap: usize,
    pub stderr_excerpt_bytes: usize,
    /// Extra attempts for infrastructure failures. User-code verdicts are final.
    pub internal_error_retries: u32,
    pub build_cache_capacity: usize,
    pub memory_poll_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub scratch_file_bytes: u64,
    pub work_root: PathBuf,
    /// Run local sandboxes in fresh user and network namespaces.
    pub sandbox_namespaces: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_pool_size: cpus.min(4),
            build_time_limit_ms: 10_000,
            output_byte_cap: 1024 * 1024,
            stderr_excerpt_bytes: 4 * 1024,
            internal_error_retries: 1,
            build_cache_capacity: 64,
            memory_poll_interval_ms: 10,
            kill_grace_ms: 500,
            scratch_file_bytes: 16 * 1024 * 1024,
            work_root: std::env::temp_dir(),
            sandbox_namespaces: false,
        }
    }
}

impl EvaluatorConfig {
    /// Defaults overlaid with `GAVEL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any key/value source (the environment in production).
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "GAVEL_WORKER_POOL_SIZE")? {
            if v == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "GAVEL_WORKER_POOL_SIZE",
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            self.worker_pool_size = v;
        }
        if let Some(v) = parse_var(&lookup, "GAVEL_BUILD_TIME_LIMIT_MS")? {
            self.build_time_limit_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "GAVEL_OUTPUT_BYTE_CAP")? {
            self.output_byte_cap = v;
        }
        if let Some(v) = parse_var(&lookup, "GAVEL_BUILD_CACHE_CAPACITY")? {
            self.build_cache_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "GAVEL_INTERNAL_ERROR_RETRIES")? {
            self.internal_error_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "GAVEL_KILL_GRACE_MS")? {
            self.kill_grace_ms = v;
        }
        if let Some(v) = lookup("GAVEL_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("GAVEL_SANDBOX_NAMESPACES") {
            self.sandbox_namespaces = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "GAVEL_SANDBOX_NAMESPACES",
                        value: v,
                        reason: "expected a boolean".to_string(),
                    })
                }
            };
        }
        Ok(self)
    }

    pub fn build_time_limit(&self) -> Duration {
        Duration::from_millis(self.build_time_limit_ms)
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map(Some).map_err(|e| ConfigError::InvalidEnv {
                var,
                reason: e.to_string(),
                value,
            })
        }
    }
}
