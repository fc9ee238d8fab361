//! Linux (and Android) backend.
//!
//! Almost everything is read from procfs and sysfs. Both are located relative to the context's procfs root, so a probe
//! can be pointed at a host's `/proc` mounted into a container (with its `/sys` next to it), or at a fixture tree.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
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
    filter::ConnectionFilter,
    types::*,
};

mod cpu;
mod net;
mod proc;
mod sensors;
mod socks;

const DEFAULT_CLOCK_TICKS: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// The Linux probe.
pub struct PlatformImpl {
    context: BindingContext,
    procfs: Procfs,
    sysfs: PathBuf,
    devfs: PathBuf,
    clock_ticks: f64,
    page_size: u64,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        let procfs = Procfs::new(context.procfs_root());
        let base = context.procfs_root().parent().unwrap_or_else(|| Path::new("/"));
        let sysfs = base.join("sys");
        let devfs = base.join("dev");

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
            sysfs,
            devfs,
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

    /// Logs an error that is deliberately not surfaced, when the context asks for it.
    fn swallowed(&self, what: &str, error: &dyn std::fmt::Display) {
        if self.context.debug() {
            debug!(what, error = %error, "Ignoring error.");
        }
    }
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        if pid < 0 {
            return false;
        }

        // `/proc/<tid>` exists for every thread too, though it isn't listed. Only thread group leaders count.
        match self.procfs.read_pid(pid, "status") {
            Ok(status) => {
                let status = procfs_pid::parse_status(&status);
                status.get("Tgid").and_then(|tgid| tgid.parse::<Pid>().ok()) == Some(pid)
            }
            Err(_) => self.procfs.pid_dir(pid).exists(),
        }
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
        cpu::count_logical(self)
    }

    fn cpu_count_cores(&self) -> Result<usize> {
        cpu::count_cores(self)
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        let stat = self.stat()?;
        Ok(CpuStats {
            ctx_switches: stat.ctx_switches,
            interrupts: stat.interrupts,
            soft_interrupts: stat.soft_interrupts,
            // Linux doesn't count system calls.
            syscalls: 0,
        })
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        cpu::freq(self)
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        system::parse_loadavg(&self.procfs.read("loadavg")?)
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        system::virtual_memory(&self.meminfo()?)
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        let meminfo = self.meminfo()?;
        // `vmstat` is missing on some container runtimes; swap traffic is then reported as zero.
        let vmstat = match self.procfs.read("vmstat") {
            Ok(text) => Some(system::parse_vmstat(&text)),
            Err(e) => {
                self.swallowed("vmstat", &e);
                None
            }
        };
        system::swap_memory(&meminfo, vmstat.as_ref(), self.page_size)
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        let mounts = match self.procfs.read("self/mounts") {
            Ok(mounts) => mounts,
            Err(_) => self.procfs.read("mounts")?,
        };

        if all {
            return Ok(procfs::disk::parse_mounts(&mounts, None));
        }
        let physical = procfs::disk::parse_physical_filesystems(&self.procfs.read("filesystems")?);
        Ok(procfs::disk::parse_mounts(&mounts, Some(&physical)))
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        // `statvfs` blocks indefinitely on an unresponsive network mount.
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn disk_io_counters(&self) -> Result<BTreeMap<String, DiskIoCounters>> {
        procfs::disk::parse_diskstats(&self.procfs.read("diskstats")?)
    }

    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        procfs::net::parse_net_dev(&self.procfs.read("net/dev")?)
    }

    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        posix::ifaddrs::net_if_addrs()
    }

    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        net::if_stats(self)
    }

    fn net_connections(&self, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        socks::connections(self, filter, None)
    }

    fn users(&self) -> Result<Vec<User>> {
        posix::utmpx::users()
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        self.procfs.pids()
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn sensors_battery(&self) -> Result<Option<Battery>> {
        sensors::battery(self)
    }

    fn sensors_temperatures(&self) -> Result<Temperatures> {
        sensors::temperatures(self)
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(self.proc_stat(pid)?.name)
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        proc::exe(self, pid)
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        check_pid(pid)?;
        let raw = self.procfs.read_pid_bytes(pid, "cmdline").classify_for(self, pid)?;
        Ok(proc::split_cmdline(&raw))
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
        let status = self.proc_status_text(pid)?;
        procfs_pid::status_ids(&procfs_pid::parse_status(&status), "Uid").classify_for(self, pid)
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let status = self.proc_status_text(pid)?;
        procfs_pid::status_ids(&procfs_pid::parse_status(&status), "Gid").classify_for(self, pid)
    }

    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        let tty_nr = self.proc_stat(pid)?.tty_nr;
        Ok(proc::terminal_name(&self.devfs, tty_nr))
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
        proc::memory_info(self, pid)
    }

    fn proc_memory_full_info(&self, pid: Pid) -> Result<MemoryFootprint> {
        proc::memory_full_info(self, pid)
    }

    fn proc_memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMap>> {
        check_pid(pid)?;
        let smaps = self.procfs.read_pid(pid, "smaps").classify_for(self, pid)?;
        procfs_pid::parse_smaps(&smaps).classify_for(self, pid)
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(self.proc_stat(pid)?.num_threads)
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        proc::threads(self, pid)
    }

    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        let status = self.proc_status_text(pid)?;
        procfs_pid::status_ctx_switches(&procfs_pid::parse_status(&status))
    }

    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        check_pid(pid)?;
        let io = self.procfs.read_pid(pid, "io").classify_for(self, pid)?;
        procfs_pid::parse_io(&io).classify_for(self, pid)
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        proc::open_files(self, pid)
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        proc::num_fds(self, pid)
    }

    fn proc_connections(&self, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        check_pid(pid)?;
        socks::connections(self, filter, Some(pid))
    }

    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        posix::get_priority(self, pid)
    }

    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        posix::set_priority(self, pid, value)
    }

    fn proc_cpu_affinity(&self, pid: Pid) -> Result<Vec<usize>> {
        proc::cpu_affinity(self, pid)
    }

    fn proc_set_cpu_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<()> {
        proc::set_cpu_affinity(self, pid, cpus)
    }

    #[cfg(target_os = "linux")]
    fn proc_rlimit(&self, pid: Pid, resource: Resource) -> Result<ResourceLimit> {
        proc::rlimit(self, pid, resource)
    }

    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        posix::send_signal(self, pid, signal)
    }

    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        Ok(self.proc_stat(pid)?.state == 'Z')
    }
}

impl PlatformImpl {
    fn proc_stat(&self, pid: Pid) -> Result<procfs_pid::PidStat> {
        check_pid(pid)?;
        let stat = self.procfs.read_pid(pid, "stat").classify_for(self, pid)?;
        procfs_pid::parse_stat(&stat).classify_for(self, pid)
    }

    fn proc_status_text(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        self.procfs.read_pid(pid, "status").classify_for(self, pid)
    }
}
