//! Cygwin backend.
//!
//! Cygwin emulates a Linux-style procfs closely enough for the shared procfs parsers: `stat`, `meminfo`, `loadavg`,
//! `mounts` and the per-process `stat`, `statm`, `status`, `cmdline`, `environ` and link files all use the Linux
//! formats. PIDs are Cygwin PIDs, not Windows ones.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use super::{
    posix,
    procfs::{self, pid as procfs_pid, system, Procfs},
    Platform,
};
use crate::{
    bounded::run_bounded,
    classify::{check_pid, ClassifyExt as _, Liveness},
    context::BindingContext,
    error::Result,
    types::*,
};

const DEFAULT_CLOCK_TICKS: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// The Cygwin probe.
pub struct PlatformImpl {
    context: BindingContext,
    procfs: Procfs,
    clock_ticks: f64,
    page_size: u64,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        let procfs = Procfs::new(context.procfs_root());

        // SAFETY: `sysconf` has no pointer arguments.
        let clock_ticks = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            ticks if ticks > 0 => ticks as f64,
            _ => DEFAULT_CLOCK_TICKS,
        };
        // SAFETY: As above.
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as u64,
            _ => DEFAULT_PAGE_SIZE,
        };

        Self {
            context,
            procfs,
            clock_ticks,
            page_size,
        }
    }

    fn stat(&self) -> Result<system::Stat> {
        system::parse_stat(&self.procfs.read("stat")?, self.clock_ticks)
    }

    fn meminfo(&self) -> Result<std::collections::HashMap<String, u64>> {
        Ok(system::parse_meminfo(&self.procfs.read("meminfo")?))
    }

    fn proc_stat(&self, pid: Pid) -> Result<procfs_pid::PidStat> {
        check_pid(pid)?;
        let stat = self.procfs.read_pid(pid, "stat").classify_for(self, pid)?;
        procfs_pid::parse_stat(&stat).classify_for(self, pid)
    }

    fn proc_status_map(&self, pid: Pid, key: &str) -> Result<ProcessIds> {
        check_pid(pid)?;
        let status = self.procfs.read_pid(pid, "status").classify_for(self, pid)?;
        procfs_pid::status_ids(&procfs_pid::parse_status(&status), key).classify_for(self, pid)
    }

    fn fd_entries(&self, pid: Pid) -> Result<fs::ReadDir> {
        check_pid(pid)?;
        let dir = self.procfs.pid_path(pid, "fd");
        fs::read_dir(&dir)
            .map_err(|source| procfs::io_error("opendir", &dir, source))
            .classify_for(self, pid)
    }
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        posix::pid_exists(pid)
    }

    fn is_zombie(&self, pid: Pid) -> bool {
        self.procfs
            .read_pid(pid, "stat")
            .and_then(|stat| procfs_pid::parse_stat(&stat))
            .map(|stat| stat.state == 'Z')
            .unwrap_or(false)
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        if let Some(boot_time) = self.stat()?.boot_time {
            return Ok(boot_time as f64);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        system::boot_time_from_uptime(&self.procfs.read("uptime")?, now)
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        Ok(self.stat()?.total)
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        Ok(self.stat()?.per_cpu)
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        // SAFETY: `sysconf` has no pointer arguments.
        match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            count if count > 0 => Ok(count as usize),
            _ => Ok(self.stat()?.per_cpu.len()),
        }
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        let stat = self.stat()?;
        Ok(CpuStats {
            ctx_switches: stat.ctx_switches,
            interrupts: stat.interrupts,
            soft_interrupts: stat.soft_interrupts,
            syscalls: 0,
        })
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        system::parse_loadavg(&self.procfs.read("loadavg")?)
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        system::virtual_memory(&self.meminfo()?)
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        // No `vmstat`, so swap traffic reads as zero.
        system::swap_memory(&self.meminfo()?, None, self.page_size)
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        let partitions = procfs::disk::parse_mounts(&self.procfs.read("mounts")?, None);
        if all {
            return Ok(partitions);
        }
        // Drive letters and the install root are backed by real volumes; `cygdrive` style pseudo mounts aren't.
        Ok(partitions
            .into_iter()
            .filter(|partition| partition.device.contains(':') || partition.device.starts_with('/'))
            .collect())
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        self.procfs.pids()
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(self.proc_stat(pid)?.name)
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        let exe = self.procfs.read_pid_link(pid, "exe").classify_for(self, pid)?;
        Ok(exe.to_string_lossy().into_owned())
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        check_pid(pid)?;
        let raw = self.procfs.read_pid_bytes(pid, "cmdline").classify_for(self, pid)?;
        Ok(posix::split_nul_block(&raw))
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        check_pid(pid)?;
        let raw = self.procfs.read_pid_bytes(pid, "environ").classify_for(self, pid)?;
        Ok(super::parse_environ_block(posix::split_nul_block(&raw)))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        let cwd = self.procfs.read_pid_link(pid, "cwd").classify_for(self, pid)?;
        Ok(cwd.to_string_lossy().into_owned())
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(self.proc_stat(pid)?.ppid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(procfs_pid::status_from_state(self.proc_stat(pid)?.state))
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        self.proc_status_map(pid, "Uid")
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        self.proc_status_map(pid, "Gid")
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        let starttime = self.proc_stat(pid)?.starttime;
        Ok(self.boot_time()? + starttime as f64 / self.clock_ticks)
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let stat = self.proc_stat(pid)?;
        Ok(ProcessCpuTimes {
            user: stat.utime as f64 / self.clock_ticks,
            system: stat.stime as f64 / self.clock_ticks,
            children_user: Some(stat.cutime.max(0) as f64 / self.clock_ticks),
            children_system: Some(stat.cstime.max(0) as f64 / self.clock_ticks),
        })
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        check_pid(pid)?;
        let statm = self.procfs.read_pid(pid, "statm").classify_for(self, pid)?;
        let statm = procfs_pid::parse_statm(&statm).classify_for(self, pid)?;
        let stat = self.proc_stat(pid)?;

        let pages = |n: u64| n * self.page_size;
        Ok(ProcessMemory {
            rss: pages(statm.resident),
            vms: pages(statm.size),
            shared: Some(pages(statm.shared)),
            text: Some(pages(statm.text)),
            data: Some(pages(statm.data)),
            page_faults: Some(stat.minflt + stat.majflt),
            peak_rss: None,
        })
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(self.proc_stat(pid)?.num_threads)
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        let mut files = Vec::new();
        for entry in self.fd_entries(pid)?.filter_map(|entry| entry.ok()) {
            let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
                continue;
            };
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            match fs::metadata(entry.path()) {
                Ok(metadata) if metadata.is_file() && target.is_absolute() => files.push(OpenFile {
                    path: target.to_string_lossy().into_owned(),
                    fd,
                }),
                Ok(_) => {}
                Err(e) => {
                    if self.context.debug() {
                        debug!(fd, error = %e, "Ignoring descriptor that vanished.");
                    }
                }
            }
        }
        files.sort_by_key(|file| file.fd);
        Ok(files)
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        Ok(self.fd_entries(pid)?.filter_map(|entry| entry.ok()).count() as u64)
    }

    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        posix::get_priority(self, pid)
    }

    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        posix::set_priority(self, pid, value)
    }

    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        posix::send_signal(self, pid, signal)
    }

    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        Ok(self.proc_stat(pid)?.state == 'Z')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn platform() -> PlatformImpl {
        PlatformImpl::new(BindingContext::builder().testing(true).build())
    }

    #[test]
    fn own_process() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        assert!(platform.pids().unwrap().contains(&pid));
        assert!(platform.proc_memory_info(pid).unwrap().rss > 0);
        assert!(platform.proc_num_threads(pid).unwrap() >= 1);
        assert!(!platform.proc_cmdline(pid).unwrap().is_empty());
        assert!(platform.proc_num_fds(pid).unwrap() >= 3);
    }

    #[test]
    fn missing_process() {
        let platform = platform();
        assert_eq!(platform.proc_name(99_999_996).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(platform.proc_cwd(-1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn system_counters() {
        let platform = platform();
        assert!(platform.virtual_memory().unwrap().total > 0);
        assert!(platform.cpu_count_logical().unwrap() >= 1);
        assert!(platform.boot_time().unwrap() > 0.0);
    }
}
