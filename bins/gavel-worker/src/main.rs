use anyhow::{bail, Context, Result};
use gavel_common::config::EvaluatorConfig;
use gavel_common::types::EvaluationRequest;
use gavel_worker::registry::DEFAULT_LANGUAGES_PATH;
use gavel_worker::{
    BuildManager, DockerSandbox, Evaluator, LanguageConfigManager, ProcessSandbox,
    ProcessSandboxOptions, Sandbox,
};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the result document, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Gavel worker booting...");

    let config = EvaluatorConfig::from_env().context("Invalid evaluator configuration")?;
    debug!(?config, "Evaluator configuration");

    let registry = load_registry()?;
    info!("Loaded language configurations for: {:?}", registry.list_languages());

    let sandbox = select_sandbox(&config)?;

    let request = read_request(std::env::args().nth(1).as_deref())?;
    info!(
        language = %request.submission.language,
        test_cases = request.test_cases.len(),
        source_size = request.submission.source_code.len(),
        "Received evaluation request"
    );

    let builds = Arc::new(BuildManager::new(Arc::new(registry), &config));
    let evaluator = Evaluator::new(builds, sandbox.clone(), config);

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received shutdown signal, cancelling evaluation...");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Failed to install CTRL+C handler"),
            }
        }
    };
    let shutdown = tokio::spawn(shutdown);

    let result = evaluator.evaluate_request(&request, &cancel).await;
    shutdown.abort();

    if cancel.is_cancelled() {
        sandbox.terminate().await;
    }
    let usage = sandbox.resource_usage();
    debug!(launched = usage.launched, killed = usage.killed, "Sandbox usage");

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    println!("{}", json);

    info!(status = %result.overall_status, "Worker shutdown complete");
    Ok(())
}

fn load_registry() -> Result<LanguageConfigManager> {
    match std::env::var("GAVEL_LANGUAGES") {
        Ok(path) => LanguageConfigManager::load(Path::new(&path))
            .with_context(|| format!("Failed to load language configurations from {}", path)),
        Err(_) if Path::new(DEFAULT_LANGUAGES_PATH).exists() => {
            LanguageConfigManager::load_default().context("Failed to load language configurations")
        }
        Err(_) => {
            warn!("{} not found, using built-in toolchains", DEFAULT_LANGUAGES_PATH);
            Ok(LanguageConfigManager::builtin())
        }
    }
}

fn select_sandbox(config: &EvaluatorConfig) -> Result<Arc<dyn Sandbox>> {
    let backend = std::env::var("GAVEL_SANDBOX").unwrap_or_else(|_| "process".to_string());
    match backend.to_lowercase().as_str() {
        "process" => {
            info!(namespaces = config.sandbox_namespaces, "Using process sandbox");
            Ok(Arc::new(ProcessSandbox::new(ProcessSandboxOptions::from_config(config))))
        }
        "docker" => {
            info!("Using docker sandbox");
            let sandbox = DockerSandbox::connect(config.work_root.clone())
                .context("Failed to connect to Docker daemon")?;
            Ok(Arc::new(sandbox))
        }
        other => bail!("Invalid GAVEL_SANDBOX: {} (valid options: process, docker)", other),
    }
}

fn read_request(path: Option<&str>) -> Result<EvaluationRequest> {
    let content = match path {
        Some("-") | None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read request from stdin")?;
            buffer
        }
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
        }
    };
    serde_json::from_str(&content).context("Failed to parse evaluation request")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"submission": {"source_code": "echo 1", "language": "bash"},
                "test_cases": [{"ordinal": 1, "input": "", "expected_output": "1"}]}"#,
        )
        .unwrap();

        let request = read_request(path.to_str()).unwrap();
        assert_eq!(request.test_cases.len(), 1);
        assert_eq!(request.submission.source_code, "echo 1");
    }

    #[test]
    fn test_read_request_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(read_request(path.to_str()).is_err());
    }
}
