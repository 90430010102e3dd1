// Local process sandbox
//
// Every run gets its own session (and so its own process group), a private
// scratch directory as cwd, a cleared environment and rlimits applied
// between fork and exec. Memory is enforced by summing the resident set of
// every process in the run's session on each poll, with RLIMIT_DATA as a
// per-process ceiling. The whole group is SIGKILLed when the run ends.
//
// Limitations: there is no PID namespace, so a descendant that calls
// setsid() itself escapes both the group kill and the memory sum. Sampling
// can miss a breach shorter than the poll interval.
use super::procfs;
use super::{RawExecutionResult, Sandbox, SandboxError, SandboxUsage, Termination, UsageCounters};
use crate::build::BuildArtifact;
use crate::limits::{CappedBuffer, ResourceLimits};
use crate::metrics;
use async_trait::async_trait;
use gavel_common::config::EvaluatorConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const READ_CHUNK: usize = 8 * 1024;

/// SIGKILL a whole process group. ESRCH (already gone) is not an error.
pub(crate) fn kill_group(pgid: i32) -> bool {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, error = %e, "Failed to kill process group");
            false
        }
    }
}

/// Kills a process group on drop unless disarmed.
pub(crate) struct ProcessGroupGuard {
    pgid: i32,
    armed: bool,
}

impl ProcessGroupGuard {
    pub(crate) fn new(pgid: i32) -> Self {
        Self { pgid, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_group(self.pgid);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSandboxOptions {
    /// Enter fresh user and network namespaces before exec. Needs
    /// unprivileged user namespaces on the host.
    pub isolate_namespaces: bool,
    /// Drop to this (uid, gid) before exec. Needs the worker to be root.
    pub run_as: Option<(u32, u32)>,
    pub memory_poll_interval: Duration,
    pub kill_grace: Duration,
    pub work_root: PathBuf,
}

impl Default for ProcessSandboxOptions {
    fn default() -> Self {
        Self::from_config(&EvaluatorConfig::default())
    }
}

impl ProcessSandboxOptions {
    pub fn from_config(config: &EvaluatorConfig) -> Self {
        Self {
            isolate_namespaces: config.sandbox_namespaces,
            run_as: None,
            memory_poll_interval: config.memory_poll_interval(),
            kill_grace: config.kill_grace(),
            work_root: config.work_root.clone(),
        }
    }

    pub fn with_run_as(mut self, uid: u32, gid: u32) -> Self {
        self.run_as = Some((uid, gid));
        self
    }
}

pub struct ProcessSandbox {
    options: ProcessSandboxOptions,
    live_groups: Mutex<HashSet<i32>>,
    counters: UsageCounters,
}

impl ProcessSandbox {
    pub fn new(options: ProcessSandboxOptions) -> Self {
        Self {
            options,
            live_groups: Mutex::new(HashSet::new()),
            counters: UsageCounters::default(),
        }
    }

    fn track(&self, pgid: i32) {
        if let Ok(mut live) = self.live_groups.lock() {
            live.insert(pgid);
        }
    }

    fn untrack(&self, pgid: i32) {
        if let Ok(mut live) = self.live_groups.lock() {
            live.remove(&pgid);
        }
    }

    fn command(
        &self,
        artifact: &BuildArtifact,
        scratch: &Path,
        limits: &ResourceLimits,
    ) -> Result<Command, SandboxError> {
        let Some((program, args)) = artifact.run_command.split_first() else {
            return Err(SandboxError::InvalidArtifact("empty run command".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rlimits = limits.process_rlimits();
        let isolate = self.options.isolate_namespaces;
        let run_as = self.options.run_as;

        // SAFETY: the closure only issues raw syscalls through nix; it does
        // not allocate or take locks between fork and exec.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid()?;
                if isolate {
                    use nix::sched::{unshare, CloneFlags};
                    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
                }
                rlimits.apply()?;
                if let Some((uid, gid)) = run_as {
                    use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};
                    let gid = Gid::from_raw(gid);
                    setgroups(&[gid])?;
                    setgid(gid)?;
                    setuid(Uid::from_raw(uid))?;
                }
                Ok(())
            });
        }

        Ok(command)
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    #[instrument(
        skip_all,
        fields(language = %artifact.language, wall_ms = limits.wall_time.as_millis() as u64)
    )]
    async fn run(
        &self,
        artifact: &BuildArtifact,
        input: &[u8],
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, SandboxError> {
        let scratch = tempfile::Builder::new()
            .prefix("gavel-run-")
            .tempdir_in(&self.options.work_root)?;
        let mut command = self.command(artifact, scratch.path(), limits)?;

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: artifact.run_command[0].clone(),
            source,
        })?;

        let Some(pid) = child.id().map(|id| id as i32) else {
            return Err(SandboxError::InvalidArtifact(
                "child exited before it could be tracked".to_string(),
            ));
        };
        // setsid makes the child its own group leader
        let pgid = pid;
        let _group = ProcessGroupGuard::new(pgid);
        self.track(pgid);
        let _active = self.counters.launch();

        let writer = child.stdin.take().map(|stdin| {
            let input = input.to_vec();
            tokio::spawn(feed_stdin(stdin, input))
        });
        let stdout_reader = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, limits.stdout_bytes)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, limits.stderr_bytes)));

        let deadline = tokio::time::sleep(limits.wall_time);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.options.memory_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut termination: Option<Termination> = None;
        let mut memory_peak: u64 = 0;

        let wait_result = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline, if termination.is_none() => {
                    debug!(pid, "Wall time exceeded, killing process group");
                    termination = Some(Termination::Timeout);
                    kill_group(pgid);
                    self.counters.record_kill();
                }
                _ = cancel.cancelled(), if termination.is_none() => {
                    debug!(pid, "Run cancelled, killing process group");
                    termination = Some(Termination::Cancelled);
                    kill_group(pgid);
                    self.counters.record_kill();
                }
                _ = poll.tick() => {
                    if let Some(sample) = procfs::session_memory(pid) {
                        memory_peak = memory_peak.max(sample);
                        if termination.is_none() && memory_peak > limits.memory_bytes {
                            debug!(pid, memory_peak, "Memory limit exceeded, killing group");
                            termination = Some(Termination::MemoryLimit);
                            kill_group(pgid);
                            self.counters.record_kill();
                        }
                    }
                }
            }
        };

        // reap anything the program left behind before touching the pipes
        kill_group(pgid);
        self.untrack(pgid);
        let duration = start.elapsed();

        if let Some(writer) = writer {
            writer.abort();
        }
        let stdout = join_drain(stdout_reader, self.options.kill_grace, limits.stdout_bytes).await;
        let stderr = join_drain(stderr_reader, self.options.kill_grace, limits.stderr_bytes).await;

        let status = wait_result?;
        metrics::SANDBOX_RUN_SECONDS.observe(duration.as_secs_f64());

        let mut result = RawExecutionResult {
            exit_code: status.code(),
            signal: status.signal(),
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
            stdout_total_bytes: stdout.total_bytes(),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            duration_ms: duration.as_millis() as u64,
            memory_peak_bytes: (memory_peak > 0).then_some(memory_peak),
            ..Default::default()
        };
        if let Some(termination) = termination {
            termination.apply(&mut result);
        }
        // RLIMIT_CPU breach
        if result.signal == Some(Signal::SIGXCPU as i32) {
            result.timed_out = true;
        }

        debug!(
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            duration_ms = result.duration_ms,
            timed_out = result.timed_out,
            oom = result.oom,
            "Run finished"
        );
        Ok(result)
    }

    async fn terminate(&self) {
        let groups: Vec<i32> = match self.live_groups.lock() {
            Ok(live) => live.iter().copied().collect(),
            Err(_) => return,
        };
        for pgid in groups {
            if kill_group(pgid) {
                self.counters.record_kill();
            }
        }
    }

    fn resource_usage(&self) -> SandboxUsage {
        self.counters.snapshot()
    }
}

async fn feed_stdin(mut stdin: tokio::process::ChildStdin, input: Vec<u8>) {
    match stdin.write_all(&input).await {
        Ok(()) => {}
        // program exited without reading all of its input
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => debug!(error = %e, "Failed to write stdin"),
    }
    drop(stdin);
}

/// Read a stream to EOF, keeping at most `cap` bytes.
pub(crate) async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> io::Result<CappedBuffer> {
    let mut buffer = CappedBuffer::new(cap);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buffer);
        }
        buffer.push(&chunk[..n]);
    }
}

pub(crate) async fn join_drain(
    handle: Option<JoinHandle<io::Result<CappedBuffer>>>,
    grace: Duration,
    cap: usize,
) -> CappedBuffer {
    let Some(mut handle) = handle else {
        return CappedBuffer::new(cap);
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(Ok(buffer))) => buffer,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed to read sandbox output");
            CappedBuffer::new(cap)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            CappedBuffer::new(cap)
        }
        Err(_) => {
            // a descendant escaped the group and still holds the pipe
            warn!("Output pipe still open after kill grace, abandoning");
            handle.abort();
            CappedBuffer::new(cap)
        }
    }
}
