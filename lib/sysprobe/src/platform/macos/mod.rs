//! macOS backend.
//!
//! Per-process data comes from libproc (`proc_pidinfo` and friends) and `sysctl(KERN_PROC)`, system-wide data from Mach
//! host statistics and `sysctl`. Memory footprints go through `process-memory`, which walks the task's VM regions.

use std::{collections::BTreeMap, path::Path};

use tracing::debug;

use super::{
    bsdlike::{self, sysctl},
    posix, Platform,
};
use crate::{
    bounded::run_bounded,
    classify::{check_pid, Liveness},
    context::BindingContext,
    error::Result,
    filter::ConnectionFilter,
    types::*,
};

mod cpu;
mod ffi;
mod mem;
mod net;
mod proc;
mod socks;

const DEFAULT_CLOCK_TICKS: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// The macOS probe.
pub struct PlatformImpl {
    context: BindingContext,
    /// Nanoseconds per Mach absolute time unit.
    timebase: f64,
    clock_ticks: f64,
    page_size: u64,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        let mut info = mach2::mach_time::mach_timebase_info { numer: 0, denom: 0 };
        // SAFETY: `info` is valid for writes.
        let timebase = match unsafe { mach2::mach_time::mach_timebase_info(&mut info) } {
            mach2::kern_return::KERN_SUCCESS if info.denom != 0 => info.numer as f64 / info.denom as f64,
            _ => 1.0,
        };

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
            timebase,
            clock_ticks,
            page_size,
        }
    }

    /// Converts Mach absolute time units to seconds.
    fn mach_to_secs(&self, units: u64) -> f64 {
        units as f64 * self.timebase / 1_000_000_000.0
    }

    /// Logs an error that is deliberately not surfaced, when the context asks for it.
    fn swallowed(&self, what: &str, error: &dyn std::fmt::Display) {
        if self.context.debug() {
            debug!(what, error = %error, "Ignoring error.");
        }
    }
}

/// The host port from `mach_host_self`, released on drop.
struct HostPort(mach2::port::mach_port_t);

impl HostPort {
    fn new() -> Self {
        // SAFETY: `mach_host_self` has no preconditions.
        Self(unsafe { ffi::mach_host_self() })
    }

    /// Reads a fixed-size `host_statistics` record. `T` must be a plain-old-data `host_*_info` struct.
    fn statistics<T: Copy + Default>(&self, flavor: libc::c_int, syscall: &str) -> Result<T> {
        self.query(ffi::host_statistics, flavor, syscall)
    }

    /// Reads a fixed-size `host_statistics64` record.
    fn statistics64<T: Copy + Default>(&self, flavor: libc::c_int, syscall: &str) -> Result<T> {
        self.query(ffi::host_statistics64, flavor, syscall)
    }

    fn query<T: Copy + Default>(&self, call: HostStatisticsFn, flavor: libc::c_int, syscall: &str) -> Result<T> {
        let mut info = T::default();
        let mut count = (std::mem::size_of::<T>() / std::mem::size_of::<libc::c_int>()) as u32;
        // SAFETY: `info` is valid for `count` integers of writes.
        let rc = unsafe { call(self.0, flavor, &mut info as *mut T as *mut libc::c_int, &mut count) };
        if rc != mach2::kern_return::KERN_SUCCESS {
            return Err(kern_error(syscall, rc));
        }
        Ok(info)
    }
}

type HostStatisticsFn = unsafe extern "C" fn(
    mach2::port::mach_port_t,
    libc::c_int,
    *mut libc::c_int,
    *mut u32,
) -> mach2::kern_return::kern_return_t;

impl Drop for HostPort {
    fn drop(&mut self) {
        // SAFETY: The port name was handed to us by `mach_host_self`.
        unsafe {
            mach2::mach_port::mach_port_deallocate(mach2::traps::mach_task_self(), self.0);
        }
    }
}

/// Mach calls return a `kern_return_t` rather than setting errno.
fn kern_error(syscall: &str, rc: mach2::kern_return::kern_return_t) -> crate::error::Error {
    crate::error::Error::Os {
        syscall: syscall.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, format!("kern_return_t {}", rc)),
    }
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        posix::pid_exists(pid)
    }

    fn is_zombie(&self, pid: Pid) -> bool {
        proc::kinfo(pid)
            .map(|kinfo| kinfo.kp_proc.p_stat == ffi::SZOMB)
            .unwrap_or(false)
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        sysctl::boot_time()
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        cpu::times(self)
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        cpu::per_cpu_times(self)
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        Ok(sysctl::value_by_name::<i32>("hw.logicalcpu")?.max(1) as usize)
    }

    fn cpu_count_cores(&self) -> Result<usize> {
        Ok(sysctl::value_by_name::<i32>("hw.physicalcpu")?.max(1) as usize)
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        cpu::freq()
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        bsdlike::load_avg()
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        mem::virtual_memory(self)
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        mem::swap_memory(self)
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        bsdlike::mounts::partitions(self.context.buffer_policy(), all)
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        // `statvfs` blocks indefinitely on an unresponsive network mount.
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        net::io_counters(self)
    }

    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        posix::ifaddrs::net_if_addrs()
    }

    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        bsdlike::ifnet::if_stats()
    }

    fn net_connections(&self, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        socks::system_connections(self, filter)
    }

    fn users(&self) -> Result<Vec<User>> {
        posix::utmpx::users()
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        proc::pids(self)
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        proc::name(self, pid)
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        proc::exe(self, pid)
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        Ok(proc::procargs(self, pid)?.argv)
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        Ok(super::parse_environ_block(proc::procargs(self, pid)?.env))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        proc::cwd(self, pid)
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(proc::kinfo_for(self, pid)?.kp_eproc.e_ppid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(proc::status_from_stat(proc::kinfo_for(self, pid)?.kp_proc.p_stat))
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        let info = proc::bsd_info(self, pid)?;
        Ok(ProcessIds {
            real: info.pbi_ruid,
            effective: info.pbi_uid,
            saved: info.pbi_svuid,
        })
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let info = proc::bsd_info(self, pid)?;
        Ok(ProcessIds {
            real: info.pbi_rgid,
            effective: info.pbi_gid,
            saved: info.pbi_svgid,
        })
    }

    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        proc::terminal(self, pid)
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        let info = proc::bsd_info(self, pid)?;
        Ok(info.pbi_start_tvsec as f64 + info.pbi_start_tvusec as f64 / 1_000_000.0)
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let info = proc::task_info(self, pid)?;
        Ok(ProcessCpuTimes {
            user: self.mach_to_secs(info.pti_total_user),
            system: self.mach_to_secs(info.pti_total_system),
            children_user: None,
            children_system: None,
        })
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        let info = proc::task_info(self, pid)?;
        Ok(ProcessMemory {
            rss: info.pti_resident_size,
            vms: info.pti_virtual_size,
            page_faults: Some(info.pti_faults.max(0) as u64),
            ..Default::default()
        })
    }

    fn proc_memory_full_info(&self, pid: Pid) -> Result<MemoryFootprint> {
        proc::memory_full_info(self, pid)
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(proc::task_info(self, pid)?.pti_threadnum.max(0) as u64)
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        proc::threads(self, pid)
    }

    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        // Mach only counts context switches as a whole.
        Ok(CtxSwitches {
            voluntary: proc::task_info(self, pid)?.pti_csw.max(0) as u64,
            involuntary: 0,
        })
    }

    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        proc::io_counters(self, pid)
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        proc::open_files(self, pid)
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        Ok(proc::list_fds(self, pid)?.len() as u64)
    }

    fn proc_connections(&self, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        check_pid(pid)?;
        socks::process_connections(self, pid, filter)
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
        Ok(proc::kinfo_for(self, pid)?.kp_proc.p_stat == ffi::SZOMB)
    }
}
