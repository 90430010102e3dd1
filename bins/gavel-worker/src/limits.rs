/// Resource Limiter
///
/// Wall-clock, CPU, memory and output ceilings for one execution. The
/// sandbox backends translate these into whatever the platform offers
/// (rlimits and `/proc` sampling locally, cgroup settings in Docker).

use gavel_common::config::EvaluatorConfig;
use gavel_common::types::TestCase;
use nix::sys::resource::{setrlimit, Resource};
use std::time::Duration;

/// Upper bound on processes a single run may spawn (Docker pids limit).
pub const DEFAULT_MAX_PROCESSES: i64 = 64;

/// Slack above twice the memory limit for RLIMIT_DATA. Managed runtimes map
/// writable arenas well ahead of use.
pub const DATA_RLIMIT_HEADROOM: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub scratch_file_bytes: u64,
    pub max_processes: i64,
}

impl ResourceLimits {
    pub fn for_test(test_case: &TestCase, config: &EvaluatorConfig) -> Self {
        Self {
            wall_time: test_case.time_limit(),
            cpu_time: test_case.time_limit(),
            memory_bytes: test_case.memory_limit_bytes,
            stdout_bytes: config.output_byte_cap,
            stderr_bytes: config.stderr_excerpt_bytes,
            scratch_file_bytes: config.scratch_file_bytes,
            max_processes: DEFAULT_MAX_PROCESSES,
        }
    }

    /// Limits for a compiler or syntax checker invocation.
    pub fn for_build(config: &EvaluatorConfig) -> Self {
        Self {
            wall_time: config.build_time_limit(),
            cpu_time: config.build_time_limit(),
            memory_bytes: u64::MAX,
            stdout_bytes: config.stderr_excerpt_bytes,
            stderr_bytes: config.stderr_excerpt_bytes,
            scratch_file_bytes: u64::MAX,
            max_processes: DEFAULT_MAX_PROCESSES,
        }
    }

    /// RLIMIT_CPU works in whole seconds; the wall clock is the precise bound.
    pub fn cpu_rlimit_secs(&self) -> u64 {
        let millis = self.cpu_time.as_millis() as u64;
        millis.div_ceil(1000) + 1
    }

    /// Per-process data segment ceiling. The sampled session total is the
    /// real memory bound; this only stops a single process from outrunning
    /// the poll interval.
    pub fn data_rlimit_bytes(&self) -> u64 {
        if self.memory_bytes == u64::MAX {
            return u64::MAX;
        }
        self.memory_bytes.saturating_mul(2).saturating_add(DATA_RLIMIT_HEADROOM)
    }

    pub fn process_rlimits(&self) -> ProcessRlimits {
        ProcessRlimits {
            cpu_secs: self.cpu_rlimit_secs(),
            file_bytes: self.scratch_file_bytes,
            data_bytes: self.data_rlimit_bytes(),
        }
    }
}

/// Plain-data rlimit set, copied into the child before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRlimits {
    pub cpu_secs: u64,
    pub file_bytes: u64,
    pub data_bytes: u64,
}

impl ProcessRlimits {
    /// Runs between fork and exec: only raw syscalls, no allocation.
    pub fn apply(&self) -> nix::Result<()> {
        // soft limit raises SIGXCPU, hard limit one second later is SIGKILL
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if self.file_bytes != u64::MAX {
            setrlimit(Resource::RLIMIT_FSIZE, self.file_bytes, self.file_bytes)?;
        }
        if self.data_bytes != u64::MAX {
            setrlimit(Resource::RLIMIT_DATA, self.data_bytes, self.data_bytes)?;
        }
        Ok(())
    }
}

/// Byte sink with a hard ceiling. Bytes past the cap are counted, not kept.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    total: u64,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(64 * 1024)),
            cap,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Lossy UTF-8 excerpt of at most `cap` bytes.
pub fn excerpt(bytes: &[u8], cap: usize) -> String {
    let end = bytes.len().min(cap);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer_keeps_prefix_and_counts_rest() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        buf.push(b"defgh");
        buf.push(b"ij");

        assert_eq!(buf.as_bytes(), b"abcde");
        assert_eq!(buf.total_bytes(), 10);
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_capped_buffer_exact_fit_is_not_truncated() {
        let mut buf = CappedBuffer::new(4);
        buf.push(b"abcd");
        assert!(!buf.is_truncated());
        assert_eq!(buf.into_bytes(), b"abcd".to_vec());
    }

    #[test]
    fn test_zero_cap_discards_everything() {
        let mut buf = CappedBuffer::new(0);
        buf.push(b"noise");
        assert!(buf.as_bytes().is_empty());
        assert_eq!(buf.total_bytes(), 5);
    }

    #[test]
    fn test_limits_for_test_case() {
        let config = EvaluatorConfig::default();
        let tc = TestCase::new(1, "", "")
            .with_time_limit(Duration::from_millis(1500))
            .with_memory_limit(64 * 1024 * 1024);
        let limits = ResourceLimits::for_test(&tc, &config);

        assert_eq!(limits.wall_time, Duration::from_millis(1500));
        assert_eq!(limits.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(limits.stdout_bytes, config.output_byte_cap);
        // 1.5s rounds up to 2s, plus one second of slack
        assert_eq!(limits.cpu_rlimit_secs(), 3);
    }

    #[test]
    fn test_data_rlimit_tracks_memory_limit() {
        let config = EvaluatorConfig::default();
        let tc = TestCase::new(1, "", "").with_memory_limit(32 * 1024 * 1024);
        let rlimits = ResourceLimits::for_test(&tc, &config).process_rlimits();
        assert_eq!(rlimits.data_bytes, 64 * 1024 * 1024 + DATA_RLIMIT_HEADROOM);

        // builds run without a memory ceiling
        assert_eq!(ResourceLimits::for_build(&config).process_rlimits().data_bytes, u64::MAX);
    }

    #[test]
    fn test_excerpt_truncates_on_bytes() {
        assert_eq!(excerpt(b"hello world", 5), "hello");
        assert_eq!(excerpt(b"hi", 5), "hi");
    }
}
