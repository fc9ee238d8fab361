//! Per-process procfs files: `stat`, `status`, `statm`, `io` and `smaps`.

use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    types::{CtxSwitches, IoCounters, MemoryMap, Pid, ProcessIds, ProcessStatus},
};

/// Fields of `/proc/<pid>/stat`. Times are in clock ticks, `rss` in pages.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PidStat {
    pub name: String,
    pub state: char,
    pub ppid: Pid,
    pub tty_nr: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub nice: i64,
    pub num_threads: u64,
    pub starttime: u64,
    pub vsize: u64,
    pub rss: u64,
}

/// Parses `/proc/<pid>/stat`.
///
/// The process name sits between the first `(` and the *last* `)`, since the name itself may contain parentheses and
/// spaces. Everything after that is space separated.
pub(crate) fn parse_stat(text: &str) -> Result<PidStat> {
    let bad = |detail: &str| Error::parse("/proc/<pid>/stat", detail);

    let open = text.find('(').ok_or_else(|| bad("missing '('"))?;
    let close = text.rfind(')').ok_or_else(|| bad("missing ')'"))?;
    if close < open {
        return Err(bad("mismatched parentheses"));
    }

    let name = text[open + 1..close].to_string();
    let fields = text[close + 1..].split_whitespace().collect::<Vec<_>>();
    if fields.len() < 22 {
        return Err(bad("too few fields"));
    }

    fn num<T: std::str::FromStr>(fields: &[&str], i: usize) -> Result<T> {
        fields[i]
            .parse()
            .map_err(|_| Error::parse("/proc/<pid>/stat", format!("bad field {}: {:?}", i + 3, fields[i])))
    }

    Ok(PidStat {
        name,
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: num(&fields, 1)?,
        tty_nr: num::<i64>(&fields, 4)? as u64,
        minflt: num(&fields, 7)?,
        majflt: num(&fields, 9)?,
        utime: num(&fields, 11)?,
        stime: num(&fields, 12)?,
        cutime: num(&fields, 13)?,
        cstime: num(&fields, 14)?,
        nice: num(&fields, 16)?,
        num_threads: num(&fields, 17)?,
        starttime: num(&fields, 19)?,
        vsize: num(&fields, 20)?,
        rss: num::<i64>(&fields, 21)?.max(0) as u64,
    })
}

/// Maps the single-letter state of `/proc/<pid>/stat`.
pub(crate) fn status_from_state(state: char) -> ProcessStatus {
    match state {
        'R' => ProcessStatus::Running,
        'S' => ProcessStatus::Sleeping,
        'D' => ProcessStatus::DiskSleep,
        'T' => ProcessStatus::Stopped,
        't' => ProcessStatus::TracingStop,
        'Z' => ProcessStatus::Zombie,
        'X' | 'x' => ProcessStatus::Dead,
        'K' => ProcessStatus::WakeKill,
        'W' => ProcessStatus::Waking,
        'I' => ProcessStatus::Idle,
        'P' => ProcessStatus::Parked,
        _ => ProcessStatus::Sleeping,
    }
}

/// Parses `/proc/<pid>/status` into its raw `Key:\tvalue` pairs.
pub(crate) fn parse_status(text: &str) -> HashMap<&str, &str> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

/// Extracts the real, effective and saved IDs from a `Uid:` or `Gid:` line of `/proc/<pid>/status`.
pub(crate) fn status_ids(status: &HashMap<&str, &str>, key: &str) -> Result<ProcessIds> {
    let ids = status
        .get(key)
        .map(|value| value.split_whitespace().filter_map(|v| v.parse::<u32>().ok()).collect::<Vec<_>>())
        .unwrap_or_default();
    match ids[..] {
        [real, effective, saved, ..] => Ok(ProcessIds { real, effective, saved }),
        _ => Err(Error::parse("/proc/<pid>/status", format!("missing or short {} line", key))),
    }
}

/// Extracts context switch counters from `/proc/<pid>/status`.
pub(crate) fn status_ctx_switches(status: &HashMap<&str, &str>) -> Result<CtxSwitches> {
    let get = |key: &str| status.get(key).and_then(|v| v.parse::<u64>().ok());
    match (get("voluntary_ctxt_switches"), get("nonvoluntary_ctxt_switches")) {
        (Some(voluntary), Some(involuntary)) => Ok(CtxSwitches { voluntary, involuntary }),
        // Missing on kernels built without CONFIG_SCHED_DEBUG-era accounting (before 2.6.23).
        _ => Err(Error::unsupported("context switch counters")),
    }
}

/// Extracts a `kB` amount from `/proc/<pid>/status`, in bytes.
pub(crate) fn status_amount(status: &HashMap<&str, &str>, key: &str) -> Option<u64> {
    let value = status.get(key)?;
    let number = value.split_whitespace().next()?.parse::<u64>().ok()?;
    Some(number * 1024)
}

/// Fields of `/proc/<pid>/statm`, in pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Statm {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
    pub text: u64,
    pub data: u64,
}

/// Parses `/proc/<pid>/statm`.
pub(crate) fn parse_statm(text: &str) -> Result<Statm> {
    let values = text
        .split_whitespace()
        .map(|v| v.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::parse("/proc/<pid>/statm", e.to_string()))?;
    match values[..] {
        // size resident shared text lib data dt
        [size, resident, shared, text, _lib, data, ..] => Ok(Statm {
            size,
            resident,
            shared,
            text,
            data,
        }),
        _ => Err(Error::parse("/proc/<pid>/statm", "expected 7 fields")),
    }
}

/// Parses `/proc/<pid>/io`.
pub(crate) fn parse_io(text: &str) -> Result<IoCounters> {
    let fields = text
        .lines()
        .filter_map(super::parse_kv_amount)
        .collect::<HashMap<_, _>>();
    let get = |key: &str| {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| Error::parse("/proc/<pid>/io", format!("missing {}", key)))
    };
    Ok(IoCounters {
        read_count: get("syscr")?,
        write_count: get("syscw")?,
        read_bytes: get("read_bytes")?,
        write_bytes: get("write_bytes")?,
    })
}

/// Parses `/proc/<pid>/smaps` into one record per mapping.
pub(crate) fn parse_smaps(text: &str) -> Result<Vec<MemoryMap>> {
    let mut maps: Vec<MemoryMap> = Vec::new();

    for line in text.lines() {
        let first = line.split_whitespace().next().unwrap_or("");
        if first.is_empty() {
            continue;
        }

        if !first.ends_with(':') {
            // Mapping header: `address perms offset dev inode [path]`.
            let perms = line.split_whitespace().nth(1).unwrap_or("").to_string();
            let path = super::skip_fields(line, 5);
            maps.push(MemoryMap {
                address: first.to_string(),
                perms,
                path: if path.is_empty() { "[anon]".to_string() } else { path.to_string() },
                ..Default::default()
            });
            continue;
        }

        let Some(current) = maps.last_mut() else {
            return Err(Error::parse("/proc/<pid>/smaps", "field before first mapping"));
        };
        let Some((key, bytes)) = super::parse_kv_amount(line) else {
            // `VmFlags:` and friends aren't amounts.
            continue;
        };
        let slot = match key {
            "Size" => &mut current.size,
            "Rss" => &mut current.rss,
            "Pss" => &mut current.pss,
            "Shared_Clean" => &mut current.shared_clean,
            "Shared_Dirty" => &mut current.shared_dirty,
            "Private_Clean" => &mut current.private_clean,
            "Private_Dirty" => &mut current.private_dirty,
            "Referenced" => &mut current.referenced,
            "Anonymous" => &mut current.anonymous,
            "Swap" => &mut current.swap,
            _ => continue,
        };
        *slot = bytes;
    }

    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (weird) proc) S 1 1234 1234 34817 1234 4194304 1550 0 2 0 120 35 4 1 20 0 3 0 \
                        5000 20508672 1337 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 2 0 0 0 0 0";

    #[test]
    fn stat_with_parenthesized_name() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.name, "my (weird) proc");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.tty_nr, 34817);
        assert_eq!(stat.minflt, 1550);
        assert_eq!(stat.majflt, 2);
        assert_eq!(stat.utime, 120);
        assert_eq!(stat.stime, 35);
        assert_eq!(stat.cutime, 4);
        assert_eq!(stat.nice, 0);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.starttime, 5000);
        assert_eq!(stat.vsize, 20508672);
        assert_eq!(stat.rss, 1337);
    }

    #[test]
    fn truncated_stat_is_a_parse_error() {
        assert!(parse_stat("1 (init) S 0 1").is_err());
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn states() {
        assert_eq!(status_from_state('Z'), ProcessStatus::Zombie);
        assert_eq!(status_from_state('t'), ProcessStatus::TracingStop);
        assert_eq!(status_from_state('I'), ProcessStatus::Idle);
    }

    const STATUS: &str = "Name:\tbash\nState:\tS (sleeping)\nTgid:\t4242\nPid:\t4242\nUid:\t1000\t1001\t1002\t1003\n\
                          Gid:\t100\t100\t100\t100\nVmHWM:\t    5120 kB\nThreads:\t1\n\
                          voluntary_ctxt_switches:\t150\nnonvoluntary_ctxt_switches:\t12\n";

    #[test]
    fn status_fixture() {
        let status = parse_status(STATUS);
        assert_eq!(status.get("Tgid"), Some(&"4242"));
        assert_eq!(
            status_ids(&status, "Uid").unwrap(),
            ProcessIds { real: 1000, effective: 1001, saved: 1002 }
        );
        assert_eq!(status_ids(&status, "Gid").unwrap().saved, 100);
        assert!(status_ids(&status, "Groups").is_err());
        assert_eq!(
            status_ctx_switches(&status).unwrap(),
            CtxSwitches { voluntary: 150, involuntary: 12 }
        );
        assert_eq!(status_amount(&status, "VmHWM"), Some(5120 * 1024));
    }

    #[test]
    fn statm_fixture() {
        let statm = parse_statm("5007 1337 901 220 0 1024 0\n").unwrap();
        assert_eq!(statm.size, 5007);
        assert_eq!(statm.resident, 1337);
        assert_eq!(statm.shared, 901);
        assert_eq!(statm.data, 1024);
        assert!(parse_statm("1 2 3").is_err());
    }

    #[test]
    fn io_fixture() {
        let io = parse_io(
            "rchar: 323934931\nwchar: 323929600\nsyscr: 632687\nsyscw: 632675\nread_bytes: 4096\n\
             write_bytes: 323932160\ncancelled_write_bytes: 0\n",
        )
        .unwrap();
        assert_eq!(
            io,
            IoCounters {
                read_count: 632687,
                write_count: 632675,
                read_bytes: 4096,
                write_bytes: 323932160,
            }
        );
    }

    const SMAPS: &str = "\
00400000-0048a000 r-xp 00000000 fd:03 960637       /usr/bin/my program
Size:                552 kB
Rss:                 460 kB
Pss:                 100 kB
Shared_Clean:        460 kB
Private_Dirty:         0 kB
Swap:                  0 kB
VmFlags: rd ex mr mw me dw
7ffc4c1b3000-7ffc4c1d4000 rw-p 00000000 00:00 0
Size:                132 kB
Rss:                  16 kB
Pss:                  16 kB
Private_Dirty:        16 kB
Anonymous:            16 kB
";

    #[test]
    fn smaps_fixture() {
        let maps = parse_smaps(SMAPS).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].path, "/usr/bin/my program");
        assert_eq!(maps[0].perms, "r-xp");
        assert_eq!(maps[0].rss, 460 * 1024);
        assert_eq!(maps[0].shared_clean, 460 * 1024);
        assert_eq!(maps[1].path, "[anon]");
        assert_eq!(maps[1].private_dirty, 16 * 1024);
        assert_eq!(maps[1].anonymous, 16 * 1024);
    }
}
