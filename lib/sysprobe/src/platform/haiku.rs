//! Haiku backend.
//!
//! Everything comes from the kernel kit: teams are processes, and their threads, areas and images hang off them.
//! Haiku has no interface for reading another team's arguments, environment or working directory, so those queries
//! are unsupported.

use std::{ffi::CStr, mem::MaybeUninit, os::unix::fs::MetadataExt as _, path::Path};

use libc::{area_info, c_char, cpu_info, fs_info, image_info, system_info, team_info, team_usage_info, thread_info};
use tracing::debug;

use super::{posix, Platform};
use crate::{
    bounded::run_bounded,
    classify::{check_pid, Liveness},
    context::BindingContext,
    error::{Error, Result},
    types::*,
};

const B_OK: i32 = 0;
const B_PAGE_SIZE: u64 = 4096;

const B_TEAM_USAGE_SELF: i32 = 0;
const B_TEAM_USAGE_CHILDREN: i32 = -1;

const B_APP_IMAGE: i32 = 1;

const B_FS_IS_READONLY: u32 = 0x0000_0001;
const B_FS_IS_REMOVABLE: u32 = 0x0000_0002;
const B_FS_IS_PERSISTENT: u32 = 0x0000_0004;
const B_FS_IS_SHARED: u32 = 0x0000_0008;

/// `thread_state`
const B_THREAD_RUNNING: i32 = 1;
const B_THREAD_READY: i32 = 2;
const B_THREAD_RECEIVING: i32 = 3;
const B_THREAD_ASLEEP: i32 = 4;
const B_THREAD_SUSPENDED: i32 = 5;
const B_THREAD_WAITING: i32 = 6;

fn micros(value: i64) -> f64 {
    value.max(0) as f64 / 1_000_000.0
}

fn status_error(syscall: &str, status: i32) -> Error {
    Error::Os {
        syscall: syscall.to_string(),
        source: std::io::Error::from_raw_os_error(status),
    }
}

/// Maps the state of a team's main thread.
fn status_from_thread_state(state: i32) -> ProcessStatus {
    match state {
        B_THREAD_RUNNING | B_THREAD_READY => ProcessStatus::Running,
        B_THREAD_RECEIVING | B_THREAD_WAITING => ProcessStatus::Waiting,
        B_THREAD_ASLEEP => ProcessStatus::Sleeping,
        B_THREAD_SUSPENDED => ProcessStatus::Stopped,
        _ => ProcessStatus::Idle,
    }
}

/// Mount options from `fs_info` flags, always leading with `ro` or `rw`.
fn volume_opts(flags: u32) -> String {
    let mut opts = vec![if flags & B_FS_IS_READONLY != 0 { "ro" } else { "rw" }];
    for (bit, name) in [
        (B_FS_IS_REMOVABLE, "removable"),
        (B_FS_IS_PERSISTENT, "persistent"),
        (B_FS_IS_SHARED, "shared"),
    ] {
        if flags & bit != 0 {
            opts.push(name);
        }
    }
    opts.join(",")
}

/// Where the volume whose root directory is `(dev, root)` is mounted, found among `/` and its children.
fn mount_point(dev: i32, root: i64) -> Option<String> {
    let matches = |path: &Path| {
        std::fs::metadata(path)
            .map(|metadata| metadata.dev() as i64 == i64::from(dev) && metadata.ino() as i64 == root)
            .unwrap_or(false)
    };
    if matches(Path::new("/")) {
        return Some("/".to_string());
    }
    std::fs::read_dir("/")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| matches(path))
        .map(|path| path.to_string_lossy().into_owned())
}

/// `team_info` with the fields Haiku appends to the BeOS layout. The kernel fills as much as the size passed in asks for.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct TeamInfo {
    team: i32,
    thread_count: i32,
    image_count: i32,
    area_count: i32,
    debugger_nub_thread: i32,
    debugger_nub_port: i32,
    argc: i32,
    args: [c_char; 64],
    uid: libc::uid_t,
    gid: libc::gid_t,
    real_uid: libc::uid_t,
    real_gid: libc::gid_t,
    group_id: libc::pid_t,
    session_id: libc::pid_t,
    parent: i32,
    name: [c_char; 32],
    start_time: i64,
}

fn chars(field: &[c_char]) -> String {
    posix::c_chars_to_string(field)
}

/// The Haiku probe.
pub struct PlatformImpl {
    context: BindingContext,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        Self { context }
    }

    fn system_info(&self) -> Result<system_info> {
        let mut info = MaybeUninit::<system_info>::zeroed();
        // SAFETY: `info` is valid for writes.
        let status = unsafe { libc::get_system_info(info.as_mut_ptr()) };
        if status != B_OK {
            return Err(status_error("get_system_info", status));
        }
        // SAFETY: Filled in by the kernel.
        Ok(unsafe { info.assume_init() })
    }

    fn cpu_infos(&self) -> Result<Vec<cpu_info>> {
        let count = self.system_info()?.cpu_count;
        // SAFETY: Plain old data.
        let mut infos = vec![unsafe { std::mem::zeroed::<cpu_info>() }; count as usize];
        // SAFETY: `infos` holds `count` records.
        let status = unsafe { libc::get_cpu_info(0, count, infos.as_mut_ptr()) };
        if status != B_OK {
            return Err(status_error("get_cpu_info", status));
        }
        Ok(infos)
    }

    fn team_info(&self, pid: Pid) -> Result<TeamInfo> {
        check_pid(pid)?;
        let mut info = MaybeUninit::<TeamInfo>::zeroed();
        // SAFETY: `info` is valid for `size_of::<TeamInfo>()` bytes of writes, and starts with the `team_info` layout.
        let status = unsafe {
            libc::_get_team_info(pid, info.as_mut_ptr() as *mut team_info, std::mem::size_of::<TeamInfo>())
        };
        if status != B_OK {
            // Teams vanish without leaving zombies behind.
            return Err(Error::NotFound { pid });
        }
        // SAFETY: Filled in by the kernel.
        Ok(unsafe { info.assume_init() })
    }

    fn team_usage(&self, pid: Pid, who: i32) -> Result<team_usage_info> {
        check_pid(pid)?;
        let mut usage = MaybeUninit::<team_usage_info>::zeroed();
        // SAFETY: `usage` is valid for writes.
        let status = unsafe { libc::get_team_usage_info(pid, who, usage.as_mut_ptr()) };
        if status != B_OK {
            return Err(self.team_error(pid, "get_team_usage_info", status));
        }
        // SAFETY: Filled in by the kernel.
        Ok(unsafe { usage.assume_init() })
    }

    fn team_error(&self, pid: Pid, syscall: &str, status: i32) -> Error {
        if !Liveness::pid_exists(self, pid) {
            return Error::NotFound { pid };
        }
        Error::ProcessOs {
            pid,
            syscall: syscall.to_string(),
            source: std::io::Error::from_raw_os_error(status),
        }
    }

    fn threads(&self, pid: Pid) -> Result<Vec<thread_info>> {
        self.team_info(pid)?;
        let mut cookie = 0i32;
        let mut threads = Vec::new();
        loop {
            let mut info = MaybeUninit::<thread_info>::zeroed();
            // SAFETY: `cookie` and `info` are valid for writes.
            if unsafe { libc::get_next_thread_info(pid, &mut cookie, info.as_mut_ptr()) } != B_OK {
                break;
            }
            // SAFETY: Filled in by the kernel.
            threads.push(unsafe { info.assume_init() });
        }
        Ok(threads)
    }

    fn areas(&self, pid: Pid) -> Result<Vec<area_info>> {
        self.team_info(pid)?;
        let mut cookie = 0isize;
        let mut areas = Vec::new();
        loop {
            let mut info = MaybeUninit::<area_info>::zeroed();
            // SAFETY: `cookie` and `info` are valid for writes.
            if unsafe { libc::get_next_area_info(pid, &mut cookie, info.as_mut_ptr()) } != B_OK {
                break;
            }
            // SAFETY: Filled in by the kernel.
            areas.push(unsafe { info.assume_init() });
        }
        Ok(areas)
    }

    /// The image the team was started from.
    fn app_image(&self, pid: Pid) -> Result<image_info> {
        self.team_info(pid)?;
        let mut cookie = 0i32;
        loop {
            let mut info = MaybeUninit::<image_info>::zeroed();
            // SAFETY: `cookie` and `info` are valid for writes.
            if unsafe { libc::get_next_image_info(pid, &mut cookie, info.as_mut_ptr()) } != B_OK {
                return Err(self.team_error(pid, "get_next_image_info", libc::ENOENT));
            }
            // SAFETY: Filled in by the kernel.
            let info = unsafe { info.assume_init() };
            if info.image_type as i32 == B_APP_IMAGE {
                return Ok(info);
            }
        }
    }

    fn volumes(&self) -> Vec<fs_info> {
        let mut cookie = 0i32;
        let mut volumes = Vec::new();
        loop {
            // SAFETY: `cookie` is valid for writes.
            let dev = unsafe { libc::next_dev(&mut cookie) };
            if dev < 0 {
                break;
            }
            let mut info = MaybeUninit::<fs_info>::zeroed();
            // SAFETY: `info` is valid for writes.
            if unsafe { libc::fs_stat_dev(dev, info.as_mut_ptr()) } != 0 {
                if self.context.debug() {
                    debug!(dev, "Skipping volume that vanished.");
                }
                continue;
            }
            // SAFETY: Filled in by the kernel.
            volumes.push(unsafe { info.assume_init() });
        }
        volumes
    }
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        if pid < 0 {
            return false;
        }
        let mut info = MaybeUninit::<team_info>::zeroed();
        // SAFETY: `info` is valid for writes.
        unsafe { libc::get_team_info(pid, info.as_mut_ptr()) == B_OK }
    }

    fn is_zombie(&self, _pid: Pid) -> bool {
        false
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        Ok(micros(self.system_info()?.boot_time))
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        let per_cpu = self.per_cpu_times()?;
        Ok(per_cpu.iter().fold(CpuTimes::default(), |mut total, cpu| {
            total.user += cpu.user;
            total.idle += cpu.idle;
            total
        }))
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        // SAFETY: `system_time` has no arguments.
        let uptime = unsafe { libc::system_time() };
        // Only busy time is tracked, and not split by mode.
        Ok(self
            .cpu_infos()?
            .iter()
            .map(|cpu| CpuTimes {
                user: micros(cpu.active_time),
                idle: micros(uptime - cpu.active_time),
                ..Default::default()
            })
            .collect())
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        Ok(self.system_info()?.cpu_count as usize)
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        let cpus = self.cpu_infos()?;
        let enabled = cpus.iter().filter(|cpu| cpu.enabled).collect::<Vec<_>>();
        if enabled.is_empty() {
            return Err(Error::unsupported("cpu_freq"));
        }
        let total_hz = enabled.iter().map(|cpu| cpu.current_frequency as f64).sum::<f64>();
        Ok(CpuFreq {
            current: total_hz / enabled.len() as f64 / 1_000_000.0,
            ..Default::default()
        })
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        let info = self.system_info()?;
        let total = info.max_pages * B_PAGE_SIZE;
        let used = info.used_pages * B_PAGE_SIZE;
        let cached = info.cached_pages * B_PAGE_SIZE;
        let free = total.saturating_sub(used + cached);
        Ok(VirtualMemory {
            total,
            available: free + cached,
            used,
            free,
            cached: Some(cached),
            ..Default::default()
        })
    }

    fn swap_memory(&self) -> Result<SwapMemory> {
        let info = self.system_info()?;
        let total = info.max_swap_pages * B_PAGE_SIZE;
        let free = info.free_swap_pages * B_PAGE_SIZE;
        Ok(SwapMemory {
            total,
            used: total.saturating_sub(free),
            free,
            sin: 0,
            sout: 0,
        })
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        Ok(self
            .volumes()
            .into_iter()
            .filter(|volume| all || volume.flags & B_FS_IS_PERSISTENT != 0)
            .filter_map(|volume| {
                Some(Partition {
                    device: chars(&volume.device_name),
                    mountpoint: mount_point(volume.dev, volume.root as i64)?,
                    fstype: chars(&volume.fsh_name),
                    opts: volume_opts(volume.flags),
                })
            })
            .collect())
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        let mut cookie = 0i32;
        let mut pids = Vec::new();
        loop {
            let mut info = MaybeUninit::<team_info>::zeroed();
            // SAFETY: `cookie` and `info` are valid for writes.
            if unsafe { libc::get_next_team_info(&mut cookie, info.as_mut_ptr()) } != B_OK {
                break;
            }
            // SAFETY: Filled in by the kernel.
            pids.push(unsafe { info.assume_init() }.team);
        }
        pids.sort_unstable();
        crate::buffer::ensure_nonempty(pids, "get_next_team_info")
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        let exe = self.proc_exe(pid)?;
        Ok(Path::new(&exe)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(exe))
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        let image = self.app_image(pid)?;
        // SAFETY: `name` is a NUL-terminated path buffer.
        let name = unsafe { CStr::from_ptr(image.name.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(self.team_info(pid)?.parent)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        // The main thread shares its ID with the team.
        let threads = self.threads(pid)?;
        let main = threads.iter().find(|thread| thread.thread == pid).or(threads.first());
        Ok(main
            .map(|thread| status_from_thread_state(thread.state as i32))
            .unwrap_or(ProcessStatus::Idle))
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        let info = self.team_info(pid)?;
        Ok(ProcessIds {
            real: info.real_uid,
            effective: info.uid,
            saved: info.uid,
        })
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let info = self.team_info(pid)?;
        Ok(ProcessIds {
            real: info.real_gid,
            effective: info.gid,
            saved: info.gid,
        })
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        let start = self.team_info(pid)?.start_time;
        Ok(self.boot_time()? + micros(start))
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let own = self.team_usage(pid, B_TEAM_USAGE_SELF)?;
        let children = self.team_usage(pid, B_TEAM_USAGE_CHILDREN)?;
        Ok(ProcessCpuTimes {
            user: micros(own.user_time),
            system: micros(own.kernel_time),
            children_user: Some(micros(children.user_time)),
            children_system: Some(micros(children.kernel_time)),
        })
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        let areas = self.areas(pid)?;
        Ok(ProcessMemory {
            rss: areas.iter().map(|area| area.ram_size as u64).sum(),
            vms: areas.iter().map(|area| area.size as u64).sum(),
            ..Default::default()
        })
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(self.team_info(pid)?.thread_count.max(0) as u64)
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        Ok(self
            .threads(pid)?
            .iter()
            .map(|thread| ThreadTimes {
                id: thread.thread.max(0) as u64,
                user: micros(thread.user_time),
                system: micros(thread.kernel_time),
            })
            .collect())
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
        self.team_info(pid).map(|_| false)
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
    fn thread_states() {
        assert_eq!(status_from_thread_state(B_THREAD_READY), ProcessStatus::Running);
        assert_eq!(status_from_thread_state(B_THREAD_SUSPENDED), ProcessStatus::Stopped);
        assert_eq!(status_from_thread_state(B_THREAD_RECEIVING), ProcessStatus::Waiting);
    }

    #[test]
    fn mount_options() {
        assert_eq!(volume_opts(B_FS_IS_PERSISTENT), "rw,persistent");
        assert_eq!(volume_opts(B_FS_IS_READONLY | B_FS_IS_REMOVABLE), "ro,removable");
    }

    #[test]
    fn own_team() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        assert!(platform.pids().unwrap().contains(&pid));
        assert!(platform.proc_memory_info(pid).unwrap().rss > 0);
        assert!(platform.proc_num_threads(pid).unwrap() >= 1);
        assert!(!platform.proc_name(pid).unwrap().is_empty());
    }

    #[test]
    fn unfinished_queries_are_unsupported() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        assert_eq!(platform.proc_cmdline(pid).unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(platform.proc_cwd(pid).unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(platform.proc_environ(pid).unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn extended_team_info() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        let info = platform.team_info(pid).unwrap();
        assert_eq!(info.team, pid);
        assert!(info.parent > 0);
        assert_eq!(platform.proc_ppid(pid).unwrap(), info.parent);
        assert!(platform.proc_create_time(pid).unwrap() >= platform.boot_time().unwrap());
        // SAFETY: `getuid` has no preconditions.
        assert_eq!(platform.proc_uids(pid).unwrap().real, unsafe { libc::getuid() });
    }

    #[test]
    fn missing_team() {
        assert_eq!(platform().proc_ppid(99_999_996).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
