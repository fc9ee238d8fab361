//! FreeBSD, OpenBSD and NetBSD backend.
//!
//! The three kernels share the `sysctl` process table, routing sockets and `getmntinfo`, so the `Platform` surface is
//! implemented once here. Each OS module supplies its own `kinfo_proc` flavor, normalized into [`ProcInfo`], along with
//! whatever it exposes differently: argument vectors, descriptor tables, memory counters and sensors.

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
use std::io;
use std::{collections::BTreeMap, mem::MaybeUninit, path::Path};

use libc::{c_char, c_int, c_uint, c_void};
use tracing::debug;

use super::{
    bsdlike::{self, sysctl},
    posix, Platform,
};
use crate::{
    bounded::run_bounded,
    classify::{check_pid, ClassifyExt as _, Liveness},
    context::BindingContext,
    error::{Error, Result},
    filter::ConnectionFilter,
    types::*,
};
#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
use crate::buffer::{grow_until_fits, read_records, BufferPolicy, Fill};

#[cfg(target_os = "freebsd")]
mod freebsd;
#[cfg(target_os = "freebsd")]
use self::freebsd as os;

#[cfg(target_os = "openbsd")]
mod openbsd;
#[cfg(target_os = "openbsd")]
use self::openbsd as os;

#[cfg(target_os = "netbsd")]
mod netbsd;
#[cfg(target_os = "netbsd")]
use self::netbsd as os;

const DEFAULT_CLOCK_TICKS: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

extern "C" {
    fn devname(dev: libc::dev_t, kind: libc::mode_t) -> *mut c_char;
}

/// The BSD probe.
pub struct PlatformImpl {
    context: BindingContext,
    clock_ticks: f64,
    page_size: u64,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
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
            clock_ticks,
            page_size,
        }
    }

    fn swallowed(&self, what: &str, error: &dyn std::fmt::Display) {
        if self.context.debug() {
            debug!(what, error = %error, "Ignoring error.");
        }
    }

    /// The normalized process record, classified for `pid`.
    fn proc_info(&self, pid: Pid) -> Result<ProcInfo> {
        check_pid(pid)?;
        os::kinfo(pid, self.page_size).classify_for(self, pid)
    }

    /// Reads a variable-length per-process node, classifying failures for `pid`.
    fn proc_node(&self, pid: Pid, mib: &[c_int], syscall: &str) -> Result<Vec<u8>> {
        check_pid(pid)?;
        sysctl::read_bytes(self.context.buffer_policy(), mib, syscall).classify_for(self, pid)
    }
}

/// What every BSD `kinfo_proc` flavor carries, in portable units.
#[derive(Clone, Debug, PartialEq)]
struct ProcInfo {
    pid: Pid,
    ppid: Pid,
    status: ProcessStatus,
    comm: String,
    uids: ProcessIds,
    gids: ProcessIds,
    /// Controlling terminal device, if any.
    tdev: Option<u64>,
    create_time: f64,
    cpu: ProcessCpuTimes,
    memory: ProcessMemory,
    /// Thread count, when the record carries one.
    num_threads: Option<u64>,
    ctx: CtxSwitches,
    io: IoCounters,
}

fn timeval_secs(sec: i64, usec: i64) -> f64 {
    sec as f64 + usec as f64 / 1_000_000.0
}

/// Reads a single fixed-size record for one PID.
///
/// The kernel answers an empty record, rather than an error, for PIDs it doesn't know on some versions.
fn kinfo_record<T: Copy>(mib: &[c_int], pid: Pid, syscall: &str) -> Result<T> {
    let mut record = MaybeUninit::<T>::zeroed();
    let mut len = std::mem::size_of::<T>();
    // SAFETY: `record` is valid for `len` bytes of writes.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as c_uint,
            record.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        return Err(Error::last_os_error(syscall));
    }
    if len == 0 {
        return Err(Error::NotFound { pid });
    }
    // SAFETY: The record was zeroed and then filled by the kernel, and `T` is plain old data.
    Ok(unsafe { record.assume_init() })
}

/// Reads a table whose MIB ends in the element size and the number of elements wanted, as OpenBSD's and NetBSD's
/// `KERN_PROC`, `KERN_FILE` and PCB list nodes do.
#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
fn read_table<T: Copy>(policy: &BufferPolicy, prefix: &[c_int], syscall: &str) -> Result<Vec<T>> {
    let elem_size = std::mem::size_of::<T>();
    let mut mib = prefix.to_vec();
    mib.extend_from_slice(&[elem_size as c_int, 0]);
    let count_slot = mib.len() - 1;

    let mut needed = 0usize;
    // SAFETY: A null `oldp` only asks for the size, which is written to `needed`.
    let rc = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as c_uint,
            std::ptr::null_mut(),
            &mut needed,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        return Err(Error::last_os_error(syscall));
    }

    let bytes = grow_until_fits::<u8, _>(policy, syscall, needed + elem_size, |buf| {
        let count = buf.len() / elem_size;
        mib[count_slot] = count as c_int;
        let mut len = count * elem_size;
        // SAFETY: `buf` is valid for at least `len` bytes of writes.
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as c_uint,
                buf.as_mut_ptr() as *mut c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc == -1 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::ENOMEM) {
                return Ok(Fill::TooSmall(None));
            }
            return Err(Error::Os {
                syscall: syscall.to_string(),
                source: error,
            });
        }
        Ok(Fill::Done(len))
    })?;
    Ok(read_records(&bytes))
}

/// Splits CPU tick counters into per-CPU records of `states` counters each.
fn split_cpu_ticks(ticks: &[u64], states: usize, to_times: impl Fn(&[u64]) -> CpuTimes) -> Vec<CpuTimes> {
    ticks.chunks_exact(states).map(to_times).collect()
}

/// Connections of every process. Processes that exit, or belong to someone else, while we walk them are skipped.
fn connections_of_all(
    platform: &PlatformImpl, mut per_process: impl FnMut(Pid) -> Result<Vec<Connection>>,
) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for pid in os::pids(platform)? {
        match per_process(pid) {
            Ok(found) => connections.extend(found),
            Err(e) => platform.swallowed("process connections", &e),
        }
    }
    Ok(connections)
}

fn terminal_name(tdev: u64) -> Option<String> {
    // SAFETY: `devname` returns null or a pointer to a static buffer, which is copied out right away.
    let name = unsafe { posix::c_ptr_to_string(devname(tdev as libc::dev_t, libc::S_IFCHR)) };
    if name.is_empty() || name == "??" {
        return None;
    }
    Some(format!("/dev/{}", name))
}

fn logical_cpus() -> Result<usize> {
    let count: c_int = sysctl::value(&[libc::CTL_HW, libc::HW_NCPU], "sysctl(hw.ncpu)")?;
    Ok(count.max(1) as usize)
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        posix::pid_exists(pid)
    }

    fn is_zombie(&self, pid: Pid) -> bool {
        os::kinfo(pid, self.page_size)
            .map(|info| info.status == ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        sysctl::boot_time()
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        os::cpu_times(self)
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        os::per_cpu_times(self)
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        logical_cpus()
    }

    fn cpu_count_cores(&self) -> Result<usize> {
        os::cpu_count_cores()
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        os::cpu_stats()
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        os::cpu_freq(self)
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        bsdlike::load_avg()
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        os::virtual_memory(self)
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        os::swap_memory(self)
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

    fn disk_io_counters(&self) -> Result<BTreeMap<String, DiskIoCounters>> {
        os::disk_io_counters(self)
    }

    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        os::net_io_counters()
    }

    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        posix::ifaddrs::net_if_addrs()
    }

    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        bsdlike::ifnet::if_stats()
    }

    fn net_connections(&self, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        os::net_connections(self, filter)
    }

    fn users(&self) -> Result<Vec<User>> {
        os::users()
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        os::pids(self)
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    #[cfg(target_os = "freebsd")]
    fn sensors_battery(&self) -> Result<Option<Battery>> {
        os::battery()
    }

    #[cfg(target_os = "freebsd")]
    fn sensors_temperatures(&self) -> Result<Temperatures> {
        os::temperatures()
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(self.proc_info(pid)?.comm)
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        os::exe(self, pid)
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        os::cmdline(self, pid)
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        Ok(super::parse_environ_block(os::environ(self, pid)?))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        os::cwd(self, pid)
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(self.proc_info(pid)?.ppid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(self.proc_info(pid)?.status)
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        Ok(self.proc_info(pid)?.uids)
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        Ok(self.proc_info(pid)?.gids)
    }

    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        Ok(self.proc_info(pid)?.tdev.and_then(terminal_name))
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        Ok(self.proc_info(pid)?.create_time)
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        Ok(self.proc_info(pid)?.cpu)
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        Ok(self.proc_info(pid)?.memory)
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        match self.proc_info(pid)?.num_threads {
            Some(count) => Ok(count),
            None => Ok(os::threads(self, pid)?.len() as u64),
        }
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        os::threads(self, pid)
    }

    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        Ok(self.proc_info(pid)?.ctx)
    }

    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        Ok(self.proc_info(pid)?.io)
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        os::open_files(self, pid)
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        os::num_fds(self, pid)
    }

    fn proc_connections(&self, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        check_pid(pid)?;
        os::connections(self, pid, filter)
    }

    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        posix::get_priority(self, pid)
    }

    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        posix::set_priority(self, pid, value)
    }

    #[cfg(target_os = "freebsd")]
    fn proc_cpu_affinity(&self, pid: Pid) -> Result<Vec<usize>> {
        os::cpu_affinity(self, pid)
    }

    #[cfg(target_os = "freebsd")]
    fn proc_set_cpu_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<()> {
        os::set_cpu_affinity(self, pid, cpus)
    }

    #[cfg(target_os = "freebsd")]
    fn proc_rlimit(&self, pid: Pid, resource: Resource) -> Result<ResourceLimit> {
        os::rlimit(self, pid, resource)
    }

    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        posix::send_signal(self, pid, signal)
    }

    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        Ok(self.proc_info(pid)?.status == ProcessStatus::Zombie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn platform() -> PlatformImpl {
        PlatformImpl::new(BindingContext::builder().build())
    }

    #[test]
    fn tick_splitting() {
        let ticks = [1, 2, 3, 4, 5, 6, 7];
        let per_cpu = split_cpu_ticks(&ticks, 3, |cpu| CpuTimes {
            user: cpu[0] as f64,
            ..Default::default()
        });
        assert_eq!(per_cpu.len(), 2);
        assert_eq!(per_cpu[1].user, 4.0);
    }

    #[test]
    fn own_process() {
        let platform = platform();
        let pid = std::process::id() as Pid;

        let info = platform.proc_info(pid).unwrap();
        assert_eq!(info.pid, pid);
        assert_eq!(info.ppid, platform.proc_ppid(pid).unwrap());
        assert!(matches!(info.status, ProcessStatus::Running | ProcessStatus::Sleeping));
        assert!(info.memory.rss > 0);
        assert!(info.create_time > 0.0);
        assert!(platform.proc_num_threads(pid).unwrap() >= 1);
        assert!(!platform.proc_threads(pid).unwrap().is_empty());
        assert!(platform.pids().unwrap().contains(&pid));
    }

    #[test]
    fn missing_process() {
        let platform = platform();
        assert_eq!(platform.proc_info(99_999_999).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(platform.proc_status(-1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn system_counters() {
        let platform = platform();
        let logical = platform.cpu_count_logical().unwrap();
        assert_eq!(platform.per_cpu_times().unwrap().len(), logical);
        assert!(platform.cpu_times().unwrap().idle > 0.0);

        let memory = platform.virtual_memory().unwrap();
        assert!(memory.total > 0);
        assert!(memory.available <= memory.total);
    }
}
