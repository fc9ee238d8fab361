//! System-wide procfs files: `stat`, `meminfo`, `vmstat`, `loadavg`.

use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    types::{CpuTimes, LoadAvg, SwapMemory, VirtualMemory},
};

/// The parts of `/proc/stat` we care about.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Stat {
    pub total: CpuTimes,
    pub per_cpu: Vec<CpuTimes>,
    pub ctx_switches: u64,
    pub interrupts: u64,
    pub soft_interrupts: u64,
    pub boot_time: Option<u64>,
}

/// Parses `/proc/stat`. CPU times are in clock ticks and get divided by `clock_ticks` to yield seconds.
pub(crate) fn parse_stat(text: &str, clock_ticks: f64) -> Result<Stat> {
    let mut stat = Stat::default();
    let mut saw_total = false;

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else { continue };

        match key {
            "cpu" => {
                stat.total = parse_cpu_fields(fields, clock_ticks)?;
                saw_total = true;
            }
            key if key.starts_with("cpu") => stat.per_cpu.push(parse_cpu_fields(fields, clock_ticks)?),
            "ctxt" => stat.ctx_switches = next_u64(&mut fields),
            // The first number is the total; per-IRQ counts follow.
            "intr" => stat.interrupts = next_u64(&mut fields),
            "softirq" => stat.soft_interrupts = next_u64(&mut fields),
            "btime" => stat.boot_time = fields.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    if !saw_total {
        return Err(Error::parse("/proc/stat", "no aggregate cpu line"));
    }
    Ok(stat)
}

fn next_u64<'a, I: Iterator<Item = &'a str>>(fields: &mut I) -> u64 {
    fields.next().and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn parse_cpu_fields<'a, I: Iterator<Item = &'a str>>(fields: I, clock_ticks: f64) -> Result<CpuTimes> {
    let values = fields
        .map(|v| v.parse::<u64>().map(|ticks| ticks as f64 / clock_ticks))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::parse("/proc/stat", format!("bad cpu field: {}", e)))?;

    if values.len() < 4 {
        return Err(Error::parse("/proc/stat", "cpu line has fewer than 4 fields"));
    }

    // Columns were added over kernel versions: iowait, irq and softirq in 2.6, steal in 2.6.11, guest in 2.6.24 and
    // guest_nice in 2.6.33.
    Ok(CpuTimes {
        user: values[0],
        nice: Some(values[1]),
        system: values[2],
        idle: values[3],
        iowait: values.get(4).copied(),
        irq: values.get(5).copied(),
        softirq: values.get(6).copied(),
        steal: values.get(7).copied(),
        guest: values.get(8).copied(),
        guest_nice: values.get(9).copied(),
        interrupt: None,
        dpc: None,
    })
}

/// Parses a `Key: value [kB]` file, such as `/proc/meminfo`, into bytes.
pub(crate) fn parse_meminfo(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(super::parse_kv_amount)
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Parses a `key value` file, such as `/proc/vmstat`.
pub(crate) fn parse_vmstat(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

/// Derives system memory from `/proc/meminfo`.
pub(crate) fn virtual_memory(meminfo: &HashMap<String, u64>) -> Result<VirtualMemory> {
    let get = |key: &str| meminfo.get(key).copied();
    let total = get("MemTotal").ok_or_else(|| Error::parse("/proc/meminfo", "missing MemTotal"))?;
    let free = get("MemFree").unwrap_or(0);
    let buffers = get("Buffers").unwrap_or(0);
    // Reclaimable slab is page cache in all but name.
    let cached = get("Cached").unwrap_or(0) + get("SReclaimable").unwrap_or(0);

    let mut used = total.saturating_sub(free + cached + buffers);
    if used == 0 {
        // Some container runtimes report cache figures larger than the container's limit.
        used = total.saturating_sub(free);
    }

    // MemAvailable appeared in Linux 3.14. Before that, estimate it the way `free` did.
    let available = get("MemAvailable").unwrap_or(free + cached).min(total);

    Ok(VirtualMemory {
        total,
        available,
        used,
        free,
        active: get("Active"),
        inactive: get("Inactive"),
        buffers: Some(buffers),
        cached: Some(cached),
        shared: get("Shmem").or_else(|| get("MemShared")),
        slab: get("Slab"),
        wired: None,
    })
}

/// Derives swap usage from `/proc/meminfo`, and swap traffic from `/proc/vmstat` (in pages).
pub(crate) fn swap_memory(
    meminfo: &HashMap<String, u64>, vmstat: Option<&HashMap<String, u64>>, page_size: u64,
) -> Result<SwapMemory> {
    let total = meminfo
        .get("SwapTotal")
        .copied()
        .ok_or_else(|| Error::parse("/proc/meminfo", "missing SwapTotal"))?;
    let free = meminfo.get("SwapFree").copied().unwrap_or(0);

    let (sin, sout) = match vmstat {
        Some(vmstat) => (
            vmstat.get("pswpin").copied().unwrap_or(0) * page_size,
            vmstat.get("pswpout").copied().unwrap_or(0) * page_size,
        ),
        None => (0, 0),
    };

    Ok(SwapMemory {
        total,
        used: total.saturating_sub(free),
        free,
        sin,
        sout,
    })
}

/// Parses `/proc/loadavg`.
pub(crate) fn parse_loadavg(text: &str) -> Result<LoadAvg> {
    let mut fields = text.split_whitespace().map(|v| v.parse::<f64>());
    let mut next = || {
        fields
            .next()
            .and_then(|v| v.ok())
            .ok_or_else(|| Error::parse("/proc/loadavg", "expected three load averages"))
    };
    Ok(LoadAvg {
        one: next()?,
        five: next()?,
        fifteen: next()?,
    })
}

/// Parses `/proc/uptime` into the boot time, given the current time in seconds since the epoch.
pub(crate) fn boot_time_from_uptime(text: &str, now: f64) -> Result<f64> {
    let uptime = text
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| Error::parse("/proc/uptime", "expected uptime in seconds"))?;
    Ok(now - uptime)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  4705 150 1120 16250 520 0 12 0 0 0
cpu0 2350 75 560 8125 260 0 6 0 0 0
cpu1 2355 75 560 8125 260 0 6 0 0 0
intr 114930548 113199788 3 0 5 263 0 4 [...]
ctxt 1990473
btime 1062191376
processes 2915
procs_running 1
procs_blocked 0
softirq 183433 0 21755 12 39 1137 231 21459 2263
";

    #[test]
    fn stat_fixture() {
        let stat = parse_stat(STAT, 100.0).unwrap();
        assert_eq!(stat.total.user, 47.05);
        assert_eq!(stat.total.idle, 162.5);
        assert_eq!(stat.total.guest_nice, Some(0.0));
        assert_eq!(stat.per_cpu.len(), 2);
        assert_eq!(stat.per_cpu[1].user, 23.55);
        assert_eq!(stat.ctx_switches, 1990473);
        assert_eq!(stat.interrupts, 114930548);
        assert_eq!(stat.soft_interrupts, 183433);
        assert_eq!(stat.boot_time, Some(1062191376));
    }

    #[test]
    fn old_kernel_stat_has_fewer_columns() {
        let stat = parse_stat("cpu 1 2 3 4\n", 1.0).unwrap();
        assert_eq!(stat.total.system, 3.0);
        assert_eq!(stat.total.iowait, None);
        assert_eq!(stat.total.steal, None);
    }

    #[test]
    fn stat_without_cpu_is_a_parse_error() {
        assert!(parse_stat("ctxt 5\n", 100.0).is_err());
        assert!(parse_stat("cpu 1 2\n", 100.0).is_err());
    }

    const MEMINFO: &str = "\
MemTotal:       16318764 kB
MemFree:         1025492 kB
MemAvailable:    9311488 kB
Buffers:          401612 kB
Cached:          7688188 kB
SwapCached:        12340 kB
Active:          8053768 kB
Inactive:        5519428 kB
Shmem:            641948 kB
Slab:             861072 kB
SReclaimable:     592212 kB
SwapTotal:       2097148 kB
SwapFree:        1048574 kB
";

    #[test]
    fn meminfo_fixture() {
        let meminfo = parse_meminfo(MEMINFO);
        let mem = virtual_memory(&meminfo).unwrap();
        assert_eq!(mem.total, 16318764 * 1024);
        assert_eq!(mem.available, 9311488 * 1024);
        assert_eq!(mem.cached, Some((7688188 + 592212) * 1024));
        assert_eq!(mem.used, (16318764 - 1025492 - 7688188 - 592212 - 401612) * 1024);
        assert_eq!(mem.shared, Some(641948 * 1024));
        assert!(mem.used + mem.free <= mem.total);
    }

    #[test]
    fn meminfo_without_available() {
        let meminfo = parse_meminfo("MemTotal: 1000 kB\nMemFree: 100 kB\nCached: 200 kB\n");
        let mem = virtual_memory(&meminfo).unwrap();
        assert_eq!(mem.available, 300 * 1024);
        assert!(virtual_memory(&HashMap::new()).is_err());
    }

    #[test]
    fn swap_fixture() {
        let meminfo = parse_meminfo(MEMINFO);
        let vmstat = parse_vmstat("pswpin 10\npswpout 20\nnr_free_pages 5\n");
        let swap = swap_memory(&meminfo, Some(&vmstat), 4096).unwrap();
        assert_eq!(swap.total, 2097148 * 1024);
        assert_eq!(swap.used, (2097148 - 1048574) * 1024);
        assert_eq!(swap.sin, 40960);
        assert_eq!(swap.sout, 81920);
    }

    #[test]
    fn loadavg_fixture() {
        let avg = parse_loadavg("0.20 0.18 0.12 1/80 11206\n").unwrap();
        assert_eq!(avg, LoadAvg { one: 0.20, five: 0.18, fifteen: 0.12 });
        assert!(parse_loadavg("0.20").is_err());
    }

    #[test]
    fn uptime_fixture() {
        let boot_time = boot_time_from_uptime("350735.47 234388.90\n", 1_000_000.5).unwrap();
        assert!((boot_time - 649265.03).abs() < 1e-6);
        assert!(boot_time_from_uptime("", 1.0).is_err());
    }
}
