/// Docker sandbox backend
///
/// **Container Rules:**
/// 1. Pulls the language image if it is not cached locally
/// 2. Creates a container per run with:
///    - Networking disabled
///    - Read-only root filesystem, tmpfs scratch at /tmp
///    - cgroup memory (no swap), CPU and pid limits
///    - All capabilities dropped, no-new-privileges
///    - The artifact workspace bind-mounted read-only at its host path
/// 3. Feeds stdin from a read-only mounted file
/// 4. Streams stdout/stderr into capped buffers
/// 5. Kills the container on wall timeout or cancellation
/// 6. Reads the OOM flag back from container state
/// 7. Removes the container on every exit path (Drop guard)
///
/// Compiled artifacts are built on the host, so the image must be able to
/// execute host binaries (same libc family). Peak memory is not reported.
use super::{RawExecutionResult, Sandbox, SandboxError, SandboxUsage, Termination, UsageCounters};
use crate::build::BuildArtifact;
use crate::limits::{CappedBuffer, ResourceLimits};
use crate::metrics;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const STDIN_MOUNT: &str = "/gavel";

type LiveContainers = Arc<Mutex<HashSet<String>>>;

/// Container cleanup guard - registers the container as live and guarantees
/// it is forgotten and removed on drop, on every exit path including early
/// errors and cancellation of the run future.
struct ContainerGuard {
    docker: Docker,
    live: LiveContainers,
    container_id: String,
}

impl ContainerGuard {
    fn track(docker: Docker, live: LiveContainers, container_id: String) -> Self {
        if let Ok(mut set) = live.lock() {
            set.insert(container_id.clone());
        }
        Self {
            docker,
            live,
            container_id,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = std::mem::take(&mut self.container_id);
        if let Ok(mut set) = self.live.lock() {
            set.remove(&container_id);
        }
        let docker = self.docker.clone();

        // Drop cannot be async; removal happens on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                    warn!(container_id = %container_id, error = %e, "Failed to clean up container");
                }
            });
        }
    }
}

pub struct DockerSandbox {
    docker: Docker,
    work_root: PathBuf,
    live_containers: LiveContainers,
    counters: UsageCounters,
}

impl DockerSandbox {
    pub fn connect(work_root: PathBuf) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            work_root,
            live_containers: Arc::new(Mutex::new(HashSet::new())),
            counters: UsageCounters::default(),
        })
    }

    /// Ensure the image is available, pulling it on a cache miss.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(
        &self,
        artifact: &BuildArtifact,
        stdin_dir: &str,
        limits: &ResourceLimits,
    ) -> Config<String> {
        let workspace = artifact.workspace_dir().display().to_string();

        // argv after the script is passed through untouched as "$@"
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("exec \"$@\" < {}/stdin", STDIN_MOUNT),
            "gavel".to_string(),
        ];
        cmd.extend(artifact.run_command.iter().cloned());

        let memory = i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX);
        let scratch = format!("rw,nosuid,size={}", limits.scratch_file_bytes.min(1 << 30));

        Config {
            image: Some(artifact.image.clone()),
            cmd: Some(cmd),
            entrypoint: Some(vec![]),
            env: Some(vec!["HOME=/tmp".to_string(), "TMPDIR=/tmp".to_string()]),
            working_dir: Some("/tmp".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((artifact.cpu_limit as f64 * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.max_processes),
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                binds: Some(vec![
                    format!("{}:{}:ro", workspace, workspace),
                    format!("{}:{}:ro", stdin_dir, STDIN_MOUNT),
                ]),
                tmpfs: Some(HashMap::from([("/tmp".to_string(), scratch)])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id, error = %e, "Failed to kill container");
        }
        self.counters.record_kill();
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[instrument(skip_all, fields(language = %artifact.language, image = %artifact.image))]
    async fn run(
        &self,
        artifact: &BuildArtifact,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, SandboxError> {
        if artifact.image.is_empty() {
            return Err(SandboxError::InvalidArtifact(format!(
                "no container image configured for {}",
                artifact.language
            )));
        }
        self.ensure_image(&artifact.image).await?;

        let stdin_dir = tempfile::Builder::new()
            .prefix("gavel-stdin-")
            .tempdir_in(&self.work_root)?;
        tokio::fs::write(stdin_dir.path().join("stdin"), input).await?;

        let stdin_path = stdin_dir.path().display().to_string();
        let config = self.container_config(artifact, &stdin_path, limits);
        let name = format!("gavel-{}", uuid::Uuid::new_v4());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        let container_id = container.id;

        // set up cleanup immediately after creation
        let _guard = ContainerGuard::track(
            self.docker.clone(),
            self.live_containers.clone(),
            container_id.clone(),
        );

        let start = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;
        let _active = self.counters.launch();

        let execution = async {
            let mut stdout = CappedBuffer::new(limits.stdout_bytes);
            let mut stderr = CappedBuffer::new(limits.stderr_bytes);

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let mut wait = self.docker.wait_container(
                &container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => return Err(SandboxError::from(e)),
                None => None,
            };
            Ok((stdout, stderr, exit_code))
        };

        let mut termination = None;
        let outcome = tokio::select! {
            result = tokio::time::timeout(limits.wall_time, execution) => match result {
                Ok(result) => Some(result?),
                Err(_) => {
                    termination = Some(Termination::Timeout);
                    None
                }
            },
            _ = cancel.cancelled() => {
                termination = Some(Termination::Cancelled);
                None
            }
        };
        if termination.is_some() {
            debug!(container_id = %container_id, "Killing container");
            self.kill(&container_id).await;
        }

        let duration = start.elapsed();
        metrics::SANDBOX_RUN_SECONDS.observe(duration.as_secs_f64());

        let oom_killed = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        let (stdout, stderr, exit_code) = outcome.unwrap_or_else(|| {
            (
                CappedBuffer::new(limits.stdout_bytes),
                CappedBuffer::new(limits.stderr_bytes),
                None,
            )
        });

        let mut result = RawExecutionResult {
            exit_code: exit_code.map(|code| code as i32),
            // 128 + n is how the container runtime reports a signal death
            signal: exit_code
                .filter(|code| *code > 128 && *code < 160)
                .map(|code| (code - 128) as i32),
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
            stdout_total_bytes: stdout.total_bytes(),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            duration_ms: duration.as_millis() as u64,
            memory_peak_bytes: None,
            oom: oom_killed,
            ..Default::default()
        };
        if let Some(termination) = termination {
            termination.apply(&mut result);
        }
        Ok(result)
    }

    async fn terminate(&self) {
        let containers: Vec<String> = match self.live_containers.lock() {
            Ok(live) => live.iter().cloned().collect(),
            Err(_) => return,
        };
        for container_id in containers {
            self.kill(&container_id).await;
        }
    }

    fn resource_usage(&self) -> SandboxUsage {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox")
            .field("work_root", &self.work_root)
            .field("usage", &self.counters.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ArtifactKind;
    use gavel_common::config::EvaluatorConfig;
    use gavel_common::types::{Language, Submission, TestCase};
    use std::time::Duration;

    fn artifact(image: &str, command: &[&str]) -> BuildArtifact {
        let workspace = tempfile::tempdir().unwrap();
        BuildArtifact::new(
            ArtifactKind::Interpreted {
                source: workspace.path().join("main.sh"),
            },
            Language::Bash,
            Submission::new(Language::Bash, command.join(" ")).id(),
            command.iter().map(|s| s.to_string()).collect(),
            workspace,
        )
        .with_image(image, 0.5)
    }

    #[test]
    fn test_guard_forgets_container_on_drop() {
        let Ok(sandbox) = DockerSandbox::connect(std::env::temp_dir()) else {
            return;
        };
        let guard = ContainerGuard::track(
            sandbox.docker.clone(),
            sandbox.live_containers.clone(),
            "gavel-test-container".to_string(),
        );
        assert!(sandbox.live_containers.lock().unwrap().contains("gavel-test-container"));

        // early-return paths in run only ever drop the guard
        drop(guard);
        assert!(sandbox.live_containers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_container_config_is_locked_down() {
        let Ok(sandbox) = DockerSandbox::connect(std::env::temp_dir()) else {
            return;
        };
        let limits = ResourceLimits::for_test(
            &TestCase::new(1, "", "").with_memory_limit(64 * 1024 * 1024),
            &EvaluatorConfig::default(),
        );
        let config = sandbox.container_config(&artifact("alpine:3", &["cat"]), "/tmp/in", &limits);
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.memory, Some(64 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(config.cmd.unwrap().last().map(String::as_str), Some("cat"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_docker_echo() {
        let sandbox = DockerSandbox::connect(std::env::temp_dir()).unwrap();
        let limits =
            ResourceLimits::for_test(&TestCase::new(1, "", ""), &EvaluatorConfig::default());
        let result = sandbox
            .run(&artifact("alpine:3", &["cat"]), b"ping\n", &limits, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, b"ping\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_docker_timeout() {
        let sandbox = DockerSandbox::connect(std::env::temp_dir()).unwrap();
        let mut limits =
            ResourceLimits::for_test(&TestCase::new(1, "", ""), &EvaluatorConfig::default());
        limits.wall_time = Duration::from_millis(500);
        let result = sandbox
            .run(&artifact("alpine:3", &["sleep", "30"]), b"", &limits, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(sandbox.resource_usage().active, 0);
    }
}
