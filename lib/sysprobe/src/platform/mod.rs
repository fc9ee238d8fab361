//! Platform backends.
//!
//! Every supported OS has one module here exporting a `PlatformImpl` that implements [`Platform`]. Exactly one of them
//! is compiled in, and re-exported from the crate root as [`Probe`][crate::Probe]. Operations a backend doesn't
//! implement keep the trait's default, which fails with [`Error::Unsupported`].

use std::{collections::BTreeMap, path::Path};

use crate::{
    error::{Error, Result},
    filter::ConnectionFilter,
    types::*,
};

#[cfg(unix)]
mod posix;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
mod bsdlike;

// The procfs parsers are plain text processing, so they're built everywhere to keep them under test.
#[cfg_attr(not(any(target_os = "linux", target_os = "android", target_os = "cygwin")), allow(dead_code))]
mod procfs;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::linux::PlatformImpl;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::PlatformImpl;

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
mod bsd;
#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub use self::bsd::PlatformImpl;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::PlatformImpl;

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod sunos;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub use self::sunos::PlatformImpl;

#[cfg(target_os = "aix")]
mod aix;
#[cfg(target_os = "aix")]
pub use self::aix::PlatformImpl;

#[cfg(target_os = "haiku")]
mod haiku;
#[cfg(target_os = "haiku")]
pub use self::haiku::PlatformImpl;

#[cfg(target_os = "cygwin")]
mod cygwin;
#[cfg(target_os = "cygwin")]
pub use self::cygwin::PlatformImpl;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows,
    target_os = "solaris",
    target_os = "illumos",
    target_os = "aix",
    target_os = "haiku",
    target_os = "cygwin",
)))]
mod unsupported;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows,
    target_os = "solaris",
    target_os = "illumos",
    target_os = "aix",
    target_os = "haiku",
    target_os = "cygwin",
)))]
pub use self::unsupported::PlatformImpl;

macro_rules! unsupported {
    ($name:literal) => {
        Err(Error::unsupported($name))
    };
}

/// Queries against the running OS.
///
/// Every method is a single synchronous round trip to the kernel. None of them cache anything: calling the same method
/// twice returns two independent snapshots.
pub trait Platform {
    /// System boot time, as seconds since the Unix epoch.
    fn boot_time(&self) -> Result<f64> {
        unsupported!("boot_time")
    }

    /// System-wide CPU times.
    fn cpu_times(&self) -> Result<CpuTimes> {
        unsupported!("cpu_times")
    }

    /// CPU times for each logical CPU.
    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        unsupported!("per_cpu_times")
    }

    /// Number of logical CPUs.
    fn cpu_count_logical(&self) -> Result<usize> {
        unsupported!("cpu_count_logical")
    }

    /// Number of physical cores.
    fn cpu_count_cores(&self) -> Result<usize> {
        unsupported!("cpu_count_cores")
    }

    /// Cumulative CPU event counters.
    fn cpu_stats(&self) -> Result<CpuStats> {
        unsupported!("cpu_stats")
    }

    /// CPU frequency.
    fn cpu_freq(&self) -> Result<CpuFreq> {
        unsupported!("cpu_freq")
    }

    /// Load averages.
    fn load_avg(&self) -> Result<LoadAvg> {
        unsupported!("load_avg")
    }

    /// System memory.
    fn virtual_memory(&self) -> Result<VirtualMemory> {
        unsupported!("virtual_memory")
    }

    /// Swap memory.
    fn swap_memory(&self) -> Result<SwapMemory> {
        unsupported!("swap_memory")
    }

    /// Mounted filesystems. Unless `all` is set, pseudo and virtual filesystems are skipped.
    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        let _ = all;
        unsupported!("disk_partitions")
    }

    /// Usage of the filesystem holding `path`.
    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let _ = path;
        unsupported!("disk_usage")
    }

    /// Per-disk I/O counters, keyed by disk name.
    fn disk_io_counters(&self) -> Result<BTreeMap<String, DiskIoCounters>> {
        unsupported!("disk_io_counters")
    }

    /// Per-interface network counters, keyed by interface name.
    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        unsupported!("net_io_counters")
    }

    /// Addresses assigned to each interface.
    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        unsupported!("net_if_addrs")
    }

    /// Status of each interface.
    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        unsupported!("net_if_stats")
    }

    /// System-wide sockets matching `filter`.
    fn net_connections(&self, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        let _ = filter;
        unsupported!("net_connections")
    }

    /// Logged-in users.
    fn users(&self) -> Result<Vec<User>> {
        unsupported!("users")
    }

    /// PIDs of every running process.
    fn pids(&self) -> Result<Vec<Pid>> {
        unsupported!("pids")
    }

    /// Whether a process with this PID exists.
    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        let _ = pid;
        unsupported!("pid_exists")
    }

    /// Battery status, or `None` when there is no battery.
    fn sensors_battery(&self) -> Result<Option<Battery>> {
        unsupported!("sensors_battery")
    }

    /// Temperature sensors.
    fn sensors_temperatures(&self) -> Result<Temperatures> {
        unsupported!("sensors_temperatures")
    }

    /// Process name.
    fn proc_name(&self, pid: Pid) -> Result<String> {
        let _ = pid;
        unsupported!("proc_name")
    }

    /// Absolute path of the process executable.
    fn proc_exe(&self, pid: Pid) -> Result<String> {
        let _ = pid;
        unsupported!("proc_exe")
    }

    /// Command line arguments.
    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        let _ = pid;
        unsupported!("proc_cmdline")
    }

    /// Environment variables.
    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        let _ = pid;
        unsupported!("proc_environ")
    }

    /// Current working directory.
    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        let _ = pid;
        unsupported!("proc_cwd")
    }

    /// Parent PID.
    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        let _ = pid;
        unsupported!("proc_ppid")
    }

    /// Scheduler state.
    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        let _ = pid;
        unsupported!("proc_status")
    }

    /// Real, effective and saved user IDs.
    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        let _ = pid;
        unsupported!("proc_uids")
    }

    /// Real, effective and saved group IDs.
    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let _ = pid;
        unsupported!("proc_gids")
    }

    /// Controlling terminal, or `None` if there is none.
    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        let _ = pid;
        unsupported!("proc_terminal")
    }

    /// Process start time, as seconds since the Unix epoch.
    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        let _ = pid;
        unsupported!("proc_create_time")
    }

    /// CPU time consumed by the process.
    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let _ = pid;
        unsupported!("proc_cpu_times")
    }

    /// Basic memory counters.
    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        let _ = pid;
        unsupported!("proc_memory_info")
    }

    /// Memory footprint, including the unique set size.
    fn proc_memory_full_info(&self, pid: Pid) -> Result<MemoryFootprint> {
        let _ = pid;
        unsupported!("proc_memory_full_info")
    }

    /// Memory mappings.
    fn proc_memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMap>> {
        let _ = pid;
        unsupported!("proc_memory_maps")
    }

    /// Number of threads.
    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        let _ = pid;
        unsupported!("proc_num_threads")
    }

    /// CPU time of each thread.
    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        let _ = pid;
        unsupported!("proc_threads")
    }

    /// Context switch counters.
    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        let _ = pid;
        unsupported!("proc_num_ctx_switches")
    }

    /// I/O counters.
    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        let _ = pid;
        unsupported!("proc_io_counters")
    }

    /// Regular files held open.
    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        let _ = pid;
        unsupported!("proc_open_files")
    }

    /// Number of open file descriptors (handles on Windows).
    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        let _ = pid;
        unsupported!("proc_num_fds")
    }

    /// Sockets held open by the process, matching `filter`.
    fn proc_connections(&self, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        let _ = (pid, filter);
        unsupported!("proc_connections")
    }

    /// Scheduling priority.
    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        let _ = pid;
        unsupported!("proc_nice")
    }

    /// Sets the scheduling priority.
    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        let _ = (pid, value);
        unsupported!("proc_set_nice")
    }

    /// CPUs the process may run on.
    fn proc_cpu_affinity(&self, pid: Pid) -> Result<Vec<usize>> {
        let _ = pid;
        unsupported!("proc_cpu_affinity")
    }

    /// Restricts the process to the given CPUs.
    fn proc_set_cpu_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<()> {
        let _ = (pid, cpus);
        unsupported!("proc_set_cpu_affinity")
    }

    /// Current limits for a resource.
    fn proc_rlimit(&self, pid: Pid, resource: Resource) -> Result<ResourceLimit> {
        let _ = (pid, resource);
        unsupported!("proc_rlimit")
    }

    /// Sends a signal.
    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        let _ = (pid, signal);
        unsupported!("proc_send_signal")
    }

    /// Suspends every thread of the process.
    fn proc_suspend(&self, pid: Pid) -> Result<()> {
        self.proc_send_signal(pid, Signal::Stop)
    }

    /// Resumes a suspended process.
    fn proc_resume(&self, pid: Pid) -> Result<()> {
        self.proc_send_signal(pid, Signal::Continue)
    }

    /// Whether the process is a zombie.
    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        Ok(self.proc_status(pid)? == ProcessStatus::Zombie)
    }
}

/// Converts a footprint from `process-memory` into our record.
///
/// Only `statm` is left when the kernel has no `smaps`, and it can't tell private pages apart.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", windows))]
fn footprint_from(footprint: process_memory::Footprint) -> Result<MemoryFootprint> {
    let Some(uss) = footprint.uss else {
        return Err(Error::unsupported("proc_memory_full_info without smaps"));
    };
    Ok(MemoryFootprint {
        rss: footprint.rss,
        pss: footprint.pss,
        uss,
        swap: footprint.swap,
    })
}

/// Splits a `KEY=VALUE\0KEY=VALUE\0` environment block, skipping malformed entries.
#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        windows,
        target_os = "solaris",
        target_os = "illumos",
        target_os = "aix",
        target_os = "cygwin",
    )),
    allow(dead_code)
)]
fn parse_environ_block<S: AsRef<str>, I: IntoIterator<Item = S>>(entries: I) -> BTreeMap<String, String> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref();
            // Windows has per-drive pseudo variables such as `=C:=C:\`, which start with the separator.
            let split = entry.char_indices().skip(1).find(|(_, c)| *c == '=').map(|(i, _)| i)?;
            Some((entry[..split].to_string(), entry[split + 1..].to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl Platform for Nothing {}

    #[test]
    fn defaults_are_unsupported() {
        let nothing = Nothing;
        assert_eq!(nothing.cpu_freq().unwrap_err().kind(), crate::ErrorKind::Unsupported);
        assert_eq!(nothing.proc_cwd(1).unwrap_err().kind(), crate::ErrorKind::Unsupported);
        assert_eq!(nothing.proc_suspend(1).unwrap_err().kind(), crate::ErrorKind::Unsupported);
        assert_eq!(nothing.proc_is_zombie(1).unwrap_err().kind(), crate::ErrorKind::Unsupported);
    }

    #[test]
    fn environ_blocks() {
        let env = parse_environ_block(["PATH=/bin:/usr/bin", "EMPTY=", "=C:=C:\\", "garbage", "A=b=c"]);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/bin:/usr/bin"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(env.get("=C:").map(String::as_str), Some("C:\\"));
        assert_eq!(env.get("A").map(String::as_str), Some("b=c"));
        assert!(!env.contains_key("garbage"));
    }
}
