// Process table sampling for the local sandbox
//
// A run is identified by its session id, which setsid makes equal to the
// leader's pid. Descendants keep the session even after setpgid, so the
// memory sample covers every process the program started.
use std::fs;

/// Fields of `/proc/<pid>/stat` the sandbox reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub pid: i32,
    pub session: i32,
}

/// Parse one `/proc/<pid>/stat` line. The command name may contain spaces
/// and parentheses, so fields are counted from the last `)`.
pub(crate) fn parse_stat(line: &str) -> Option<ProcStat> {
    let (pid, _) = line.split_once(' ')?;
    let rest = &line[line.rfind(')')? + 1..];
    // rest starts at field 3 (state); session is field 6
    let session = rest.split_whitespace().nth(3)?.parse().ok()?;
    Some(ProcStat {
        pid: pid.trim().parse().ok()?,
        session,
    })
}

/// Resident and peak resident set size in bytes (VmRSS, VmHWM).
pub(crate) fn parse_rss(status: &str) -> (Option<u64>, Option<u64>) {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    (field("VmRSS:"), field("VmHWM:"))
}

/// Every live process whose session id is `session`.
pub(crate) fn session_members(session: i32) -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            name.to_str().is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|line| parse_stat(&line))
        .filter(|stat| stat.session == session)
        .collect()
}

/// Memory held by a whole session right now.
///
/// The sum of current RSS across members, or the largest single member's
/// high-water mark if that is bigger. Both are lower bounds on the true
/// peak, so the sample never overstates usage.
pub(crate) fn session_memory(session: i32) -> Option<u64> {
    let mut total: u64 = 0;
    let mut largest_peak: u64 = 0;
    let mut seen = false;
    for member in session_members(session) {
        let Ok(status) = fs::read_to_string(format!("/proc/{}/status", member.pid)) else {
            continue;
        };
        let (rss, hwm) = parse_rss(&status);
        if let Some(rss) = rss {
            total = total.saturating_add(rss);
            seen = true;
        }
        if let Some(hwm) = hwm {
            largest_peak = largest_peak.max(hwm);
            seen = true;
        }
    }
    seen.then_some(total.max(largest_peak))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_counts_from_last_paren() {
        let line = "4242 (my (odd) prog) S 4000 4242 4100 0 -1 4194560 120 0 0 0 1 0 0 0 \
                    20 0 1 0 99 2400000 300 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 \
                    0 17 3 0 0 0 0 0";
        assert_eq!(
            parse_stat(line),
            Some(ProcStat {
                pid: 4242,
                session: 4100
            })
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_parse_rss() {
        let status = "Name:\tsh\nVmPeak:\t  2000 kB\nVmHWM:\t  1536 kB\nVmRSS:\t  1024 kB\n";
        assert_eq!(parse_rss(status), (Some(1024 * 1024), Some(1536 * 1024)));
        assert_eq!(parse_rss("Name:\tkthreadd\n"), (None, None));
    }

    #[test]
    fn test_own_session_is_visible() {
        let sid = nix::unistd::getsid(None).unwrap().as_raw();
        let members = session_members(sid);
        let me = std::process::id() as i32;
        assert!(members.iter().any(|m| m.pid == me));
        assert!(session_memory(sid).unwrap() > 0);
    }
}
