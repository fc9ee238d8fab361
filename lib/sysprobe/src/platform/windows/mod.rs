//! Windows backend.
//!
//! Process data mostly comes from the native `NtQuerySystemInformation` process snapshot, which any user can read for
//! any process, with `OpenProcess` based Win32 calls layered on top where they give better numbers. System-wide data
//! comes from the Win32 API. The load average is emulated by a background sampler started on first use.

use std::{
    collections::BTreeMap,
    ffi::c_void,
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::debug;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};

use super::Platform;
use crate::{
    buffer::{grow_until_fits, BufferPolicy, Fill},
    classify::{check_pid, Liveness},
    context::BindingContext,
    error::{Error, Result},
    filter::ConnectionFilter,
    loadavg::LoadAverageTracker,
    types::*,
};

mod cpu;
mod disk;
mod ffi;
mod handles;
mod loadavg;
mod mem;
mod net;
mod proc;
mod socks;
mod sys;

/// 100ns intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

/// The Windows probe.
pub struct PlatformImpl {
    context: BindingContext,
    tracker: Arc<LoadAverageTracker>,
    sampler: Mutex<Option<loadavg::Sampler>>,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        Self {
            context,
            tracker: Arc::new(LoadAverageTracker::new()),
            sampler: Mutex::new(None),
        }
    }

    /// Logs an error that is deliberately not surfaced, when the context asks for it.
    fn swallowed(&self, what: &str, error: &dyn std::fmt::Display) {
        if self.context.debug() {
            debug!(what, error = %error, "Ignoring error.");
        }
    }

    fn sampled_load_avg(&self) -> Result<LoadAvg> {
        let mut sampler = match self.sampler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if sampler.is_none() {
            *sampler = Some(loadavg::Sampler::start(Arc::clone(&self.tracker), self.context.testing())?);
        }
        Ok(self.tracker.snapshot())
    }
}

/// An owned kernel handle, closed on drop.
pub(super) struct HandleGuard(HANDLE);

impl HandleGuard {
    /// Wraps `handle`, or returns `None` if it's one of the two "no handle" values.
    pub(super) fn new(handle: HANDLE) -> Option<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return None;
        }
        Some(Self(handle))
    }

    pub(super) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        // SAFETY: The handle is owned by this guard and closed exactly once.
        unsafe { CloseHandle(self.0) };
    }
}

/// A kernel buffer with 8-byte alignment, viewed as bytes.
pub(super) struct AlignedBytes {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    pub(super) fn bytes(&self) -> &[u8] {
        // SAFETY: The words are initialized, and `len` never exceeds their size in bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }
}

/// Calls `fill` with growing, 8-byte aligned buffers until the result fits.
///
/// `fill` gets the buffer and its size in bytes, and reports the outcome in bytes too.
pub(super) fn grow_aligned<F>(policy: &BufferPolicy, syscall: &str, initial_bytes: usize, mut fill: F) -> Result<AlignedBytes>
where
    F: FnMut(*mut c_void, usize) -> Result<Fill>,
{
    let words_for = |bytes: usize| bytes.div_ceil(8);
    let mut written = 0;
    let words = grow_until_fits::<u64, _>(policy, syscall, words_for(initial_bytes), |buf| {
        let capacity = buf.len() * 8;
        match fill(buf.as_mut_ptr() as *mut c_void, capacity)? {
            Fill::Done(bytes) => {
                written = bytes.min(capacity);
                Ok(Fill::Done(words_for(written)))
            }
            Fill::TooSmall(needed) => Ok(Fill::TooSmall(needed.map(words_for))),
        }
    })?;
    Ok(AlignedBytes { words, len: written })
}

/// Converts an `NTSTATUS` failure into an OS error naming `syscall`.
pub(super) fn nt_error(syscall: &str, status: ffi::NTSTATUS) -> Error {
    // SAFETY: `RtlNtStatusToDosError` has no pointer arguments.
    let code = unsafe { ffi::RtlNtStatusToDosError(status) };
    Error::Os {
        syscall: syscall.to_string(),
        source: io::Error::from_raw_os_error(code as i32),
    }
}

/// Reads a variable-length `NtQuerySystemInformation` class.
pub(super) fn query_system_information(
    platform: &PlatformImpl, class: u32, syscall: &str, initial_bytes: usize,
) -> Result<AlignedBytes> {
    grow_aligned(platform.context.buffer_policy(), syscall, initial_bytes, |buf, capacity| {
        let mut needed = 0u32;
        // SAFETY: `buf` is valid for `capacity` bytes of writes.
        let status = unsafe { ffi::NtQuerySystemInformation(class, buf, capacity as u32, &mut needed) };
        match status {
            ffi::STATUS_INFO_LENGTH_MISMATCH | ffi::STATUS_BUFFER_TOO_SMALL => {
                Ok(Fill::TooSmall(Some(needed as usize).filter(|n| *n > 0)))
            }
            status if status < 0 => Err(nt_error(syscall, status)),
            _ => Ok(Fill::Done(needed as usize)),
        }
    })
}

/// Seconds in a count of 100ns intervals.
pub(super) fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / 10_000_000.0
}

/// Seconds since the Unix epoch for a `FILETIME` timestamp.
pub(super) fn filetime_to_unix(ticks: i64) -> f64 {
    ticks_to_secs(ticks - FILETIME_UNIX_OFFSET)
}

pub(super) fn filetime_ticks(time: &windows_sys::Win32::Foundation::FILETIME) -> i64 {
    ((time.dwHighDateTime as i64) << 32) | time.dwLowDateTime as i64
}

/// NUL-terminated UTF-16 for passing strings in.
pub(super) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Decodes UTF-16 up to the first NUL.
pub(super) fn from_wide(wide: &[u16]) -> String {
    let end = wide.iter().position(|c| *c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..end])
}

/// Decodes a NUL-terminated UTF-16 string owned by the OS.
///
/// ## Safety
///
/// `ptr` must be null or point to a NUL-terminated UTF-16 string.
pub(super) unsafe fn from_wide_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

/// Decodes little-endian UTF-16 bytes.
pub(super) fn utf16_bytes(bytes: &[u8]) -> String {
    let wide = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect::<Vec<_>>();
    from_wide(&wide)
}

/// Windows PIDs are `u32`; ours are `i32`, and negative ones never reach the OS.
pub(super) fn os_pid(pid: Pid) -> Result<u32> {
    check_pid(pid)?;
    Ok(pid as u32)
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        proc::pid_exists(self, pid)
    }

    fn is_zombie(&self, _pid: Pid) -> bool {
        false
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        sys::boot_time()
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        cpu::times()
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        cpu::per_cpu_times(self)
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        cpu::count_logical()
    }

    fn cpu_count_cores(&self) -> Result<usize> {
        cpu::count_cores(self)
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        cpu::stats(self)
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        cpu::freq()
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        self.sampled_load_avg()
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        mem::virtual_memory()
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        mem::swap_memory()
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        disk::partitions(self, all)
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        disk::usage(self, path)
    }

    fn disk_io_counters(&self) -> Result<BTreeMap<String, DiskIoCounters>> {
        disk::io_counters(self)
    }

    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        net::io_counters(self)
    }

    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        net::if_addrs(self)
    }

    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        net::if_stats(self)
    }

    fn net_connections(&self, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        socks::connections(self, None, filter)
    }

    fn users(&self) -> Result<Vec<User>> {
        sys::users()
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        Ok(proc::processes(self)?.into_iter().map(|process| process.pid).collect())
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn sensors_battery(&self) -> Result<Option<Battery>> {
        sys::battery()
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(proc::entry(self, pid)?.name)
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        proc::exe(self, pid)
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        proc::cmdline(self, pid)
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        Ok(super::parse_environ_block(proc::environ(self, pid)?))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        proc::cwd(self, pid)
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(proc::entry(self, pid)?.ppid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(proc::entry(self, pid)?.status())
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        proc::create_time(self, pid)
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        proc::cpu_times(self, pid)
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        proc::memory_info(self, pid)
    }

    fn proc_memory_full_info(&self, pid: Pid) -> Result<MemoryFootprint> {
        proc::memory_full_info(self, pid)
    }

    fn proc_memory_maps(&self, pid: Pid) -> Result<Vec<MemoryMap>> {
        proc::memory_maps(self, pid)
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(proc::entry(self, pid)?.num_threads)
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        Ok(proc::entry(self, pid)?
            .threads
            .iter()
            .map(|thread| ThreadTimes {
                id: thread.tid,
                user: thread.user,
                system: thread.system,
            })
            .collect())
    }

    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        // The kernel doesn't tell voluntary and involuntary switches apart.
        let entry = proc::entry(self, pid)?;
        Ok(CtxSwitches {
            voluntary: entry.threads.iter().map(|thread| thread.context_switches).sum(),
            involuntary: 0,
        })
    }

    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        proc::io_counters(self, pid)
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        handles::open_files(self, pid)
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        proc::num_handles(self, pid)
    }

    fn proc_connections(&self, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
        // Tables are keyed by owner, so a vanished process would otherwise just show no sockets.
        proc::entry(self, pid)?;
        socks::connections(self, Some(pid), filter)
    }

    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        proc::priority_class(self, pid)
    }

    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        proc::set_priority_class(self, pid, value)
    }

    fn proc_cpu_affinity(&self, pid: Pid) -> Result<Vec<usize>> {
        proc::cpu_affinity(self, pid)
    }

    fn proc_set_cpu_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<()> {
        proc::set_cpu_affinity(self, pid, cpus)
    }

    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        match signal {
            Signal::Terminate | Signal::Kill => proc::terminate(self, pid),
            Signal::Stop => proc::suspend(self, pid),
            Signal::Continue => proc::resume(self, pid),
            _ => Err(Error::unsupported(format!("sending {:?}", signal))),
        }
    }

    fn proc_suspend(&self, pid: Pid) -> Result<()> {
        proc::suspend(self, pid)
    }

    fn proc_resume(&self, pid: Pid) -> Result<()> {
        proc::resume(self, pid)
    }

    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        proc::entry(self, pid)?;
        Ok(false)
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
    fn wide_strings() {
        assert_eq!(to_wide("C:"), vec![b'C' as u16, b':' as u16, 0]);
        assert_eq!(from_wide(&[b'a' as u16, 0, b'b' as u16]), "a");
        assert_eq!(utf16_bytes(&[b'h', 0, b'i', 0, 0, 0, b'x', 0]), "hi");
    }

    #[test]
    fn filetimes() {
        assert_eq!(filetime_to_unix(FILETIME_UNIX_OFFSET), 0.0);
        assert_eq!(filetime_to_unix(FILETIME_UNIX_OFFSET + 15_000_000), 1.5);
    }

    #[test]
    fn own_process() {
        let platform = platform();
        let pid = std::process::id() as Pid;

        assert!(platform.pids().unwrap().contains(&pid));
        assert!(platform.proc_name(pid).unwrap().to_lowercase().ends_with(".exe"));
        assert!(platform.proc_exe(pid).unwrap().to_lowercase().ends_with(".exe"));
        assert!(platform.proc_num_threads(pid).unwrap() >= 1);
        assert!(platform.proc_memory_info(pid).unwrap().rss > 0);
        assert!(platform.proc_create_time(pid).unwrap() <= platform.boot_time().unwrap() + 1e9);
        assert!(!platform.proc_cmdline(pid).unwrap().is_empty());
        assert!(platform.proc_environ(pid).unwrap().keys().any(|key| key.eq_ignore_ascii_case("PATH")));
        assert!(!platform.proc_cwd(pid).unwrap().is_empty());
        assert!(!platform.proc_is_zombie(pid).unwrap());
    }

    #[test]
    fn missing_process() {
        let platform = platform();
        assert_eq!(platform.proc_name(99_999_996).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(platform.proc_exe(-1).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(!platform.pid_exists(99_999_996).unwrap());
        assert!(platform.pid_exists(0).unwrap());
    }

    #[test]
    fn system_counters() {
        let platform = platform();
        assert!(platform.cpu_count_logical().unwrap() >= platform.cpu_count_cores().unwrap());
        assert!(platform.virtual_memory().unwrap().total > 0);
        assert!(platform.load_avg().is_ok());

        let partitions = platform.disk_partitions(false).unwrap();
        let system = partitions.iter().find(|p| p.mountpoint.starts_with("C:")).unwrap();
        assert_eq!(system.opts.split(',').filter(|opt| *opt == "rw" || *opt == "ro").count(), 1);
    }
}
