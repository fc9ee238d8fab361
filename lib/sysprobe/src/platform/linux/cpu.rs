use std::{collections::HashSet, fs};

use super::PlatformImpl;
use crate::{
    error::{Error, Result},
    platform::procfs::read_text,
    types::CpuFreq,
};

pub(super) fn count_logical(platform: &PlatformImpl) -> Result<usize> {
    // SAFETY: `sysconf` has no pointer arguments.
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 {
        return Ok(online as usize);
    }

    let stat = platform.stat()?;
    if stat.per_cpu.is_empty() {
        return Err(Error::unsupported("cpu_count_logical"));
    }
    Ok(stat.per_cpu.len())
}

pub(super) fn count_cores(platform: &PlatformImpl) -> Result<usize> {
    // Each distinct sibling list is one core. `core_cpus_list` replaced `thread_siblings_list` in Linux 5.7.
    let mut siblings = HashSet::new();
    if let Ok(entries) = fs::read_dir(platform.sysfs.join("devices/system/cpu")) {
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|name| name.strip_prefix("cpu")) else {
                continue;
            };
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }

            let topology = entry.path().join("topology");
            let list = fs::read_to_string(topology.join("core_cpus_list"))
                .or_else(|_| fs::read_to_string(topology.join("thread_siblings_list")));
            if let Ok(list) = list {
                siblings.insert(list.trim().to_string());
            }
        }
    }
    if !siblings.is_empty() {
        return Ok(siblings.len());
    }

    let cores = cores_from_cpuinfo(&platform.procfs.read("cpuinfo")?);
    if cores == 0 {
        return Err(Error::unsupported("cpu_count_cores"));
    }
    Ok(cores)
}

/// Counts distinct `(physical id, core id)` pairs in `/proc/cpuinfo`.
fn cores_from_cpuinfo(text: &str) -> usize {
    let mut cores = HashSet::new();
    let mut physical_id = None;
    let mut core_id = None;

    // Processors are separated by blank lines; a trailing one is not guaranteed.
    for line in text.lines().chain(std::iter::once("")) {
        let line = line.trim();
        if line.is_empty() {
            if let (Some(physical), Some(core)) = (physical_id.take(), core_id.take()) {
                cores.insert((physical, core));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            match key.trim() {
                "physical id" => physical_id = value.trim().parse::<u32>().ok(),
                "core id" => core_id = value.trim().parse::<u32>().ok(),
                _ => {}
            }
        }
    }
    cores.len()
}

pub(super) fn freq(platform: &PlatformImpl) -> Result<CpuFreq> {
    let policies = cpufreq_policies(platform);
    if !policies.is_empty() {
        let current = policies.iter().map(|p| p.current).sum::<f64>() / policies.len() as f64;
        let min = policies.iter().map(|p| p.min).fold(f64::INFINITY, f64::min);
        let max = policies.iter().map(|p| p.max).fold(0.0, f64::max);
        return Ok(CpuFreq {
            current,
            min: if min.is_finite() { min } else { 0.0 },
            max,
        });
    }

    // Without cpufreq (most VMs), fall back to what the CPU reported at boot.
    let speeds = mhz_from_cpuinfo(&platform.procfs.read("cpuinfo")?);
    if speeds.is_empty() {
        return Err(Error::unsupported("cpu_freq"));
    }
    Ok(CpuFreq {
        current: speeds.iter().sum::<f64>() / speeds.len() as f64,
        min: 0.0,
        max: 0.0,
    })
}

/// Per-policy frequencies, in MHz.
fn cpufreq_policies(platform: &PlatformImpl) -> Vec<CpuFreq> {
    let Ok(entries) = fs::read_dir(platform.sysfs.join("devices/system/cpu/cpufreq")) else {
        return Vec::new();
    };

    let read_khz = |path: std::path::PathBuf| -> Option<f64> {
        read_text(&path).ok()?.trim().parse::<f64>().ok().map(|khz| khz / 1000.0)
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("policy"))
        .filter_map(|entry| {
            let dir = entry.path();
            let current = read_khz(dir.join("scaling_cur_freq")).or_else(|| read_khz(dir.join("cpuinfo_cur_freq")))?;
            Some(CpuFreq {
                current,
                min: read_khz(dir.join("cpuinfo_min_freq")).unwrap_or(0.0),
                max: read_khz(dir.join("cpuinfo_max_freq")).unwrap_or(0.0),
            })
        })
        .collect()
}

fn mhz_from_cpuinfo(text: &str) -> Vec<f64> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim().eq_ignore_ascii_case("cpu MHz"))
        .filter_map(|(_, value)| value.trim().parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUINFO: &str = "\
processor\t: 0
physical id\t: 0
core id\t\t: 0
cpu MHz\t\t: 2400.000

processor\t: 1
physical id\t: 0
core id\t\t: 0
cpu MHz\t\t: 2600.000

processor\t: 2
physical id\t: 0
core id\t\t: 1
cpu MHz\t\t: 2500.000";

    #[test]
    fn cores_are_distinct_physical_core_pairs() {
        assert_eq!(cores_from_cpuinfo(CPUINFO), 2);
        assert_eq!(cores_from_cpuinfo("processor\t: 0\n"), 0);
    }

    #[test]
    fn mhz_lines() {
        assert_eq!(mhz_from_cpuinfo(CPUINFO), vec![2400.0, 2600.0, 2500.0]);
    }
}
