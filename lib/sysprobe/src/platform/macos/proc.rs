//! Per-process queries through libproc and `sysctl(KERN_PROC)`.

use std::{io, mem::MaybeUninit};

use libc::{c_int, c_uint, c_void};
use process_memory::{Querier, Target};

use super::{ffi, PlatformImpl};
use crate::{
    buffer::{ensure_nonempty, grow_until_fits, read_records, Fill},
    classify::{check_pid, classify, ClassifyExt as _, Liveness as _},
    error::{Error, Result},
    platform::{bsdlike::sysctl, footprint_from, posix},
    types::*,
};

/// The `kinfo_proc` of a process, or `NotFound`.
pub(super) fn kinfo(pid: Pid) -> Result<ffi::kinfo_proc> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID, pid];
    let mut kinfo = MaybeUninit::<ffi::kinfo_proc>::zeroed();
    let mut len = std::mem::size_of::<ffi::kinfo_proc>();
    // SAFETY: `kinfo` is valid for `len` bytes of writes.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as c_uint,
            kinfo.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        return Err(Error::last_os_error("sysctl(kern.proc.pid)"));
    }
    // The kernel answers an empty record for PIDs it doesn't know.
    if len == 0 {
        return Err(Error::NotFound { pid });
    }
    // SAFETY: The record was zeroed and then filled by the kernel.
    Ok(unsafe { kinfo.assume_init() })
}

pub(super) fn kinfo_for(platform: &PlatformImpl, pid: Pid) -> Result<ffi::kinfo_proc> {
    check_pid(pid)?;
    kinfo(pid).classify_for(platform, pid)
}

pub(super) fn pids(platform: &PlatformImpl) -> Result<Vec<Pid>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_ALL, 0];
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(kern.proc.all)")?;
    let pids = read_records::<ffi::kinfo_proc>(&bytes)
        .into_iter()
        .map(|kinfo| kinfo.kp_proc.p_pid)
        .collect();
    ensure_nonempty(pids, "sysctl(kern.proc.all)")
}

pub(super) fn status_from_stat(stat: libc::c_char) -> ProcessStatus {
    match stat {
        ffi::SIDL => ProcessStatus::Idle,
        ffi::SRUN => ProcessStatus::Running,
        ffi::SSLEEP => ProcessStatus::Sleeping,
        ffi::SSTOP => ProcessStatus::Stopped,
        ffi::SZOMB => ProcessStatus::Zombie,
        _ => ProcessStatus::Waiting,
    }
}

/// A fixed-size `proc_pidinfo` record.
///
/// A short answer means the kernel withheld part of the record, which only happens across a privilege boundary.
fn pidinfo<T: Copy>(platform: &PlatformImpl, pid: Pid, flavor: c_int, arg: u64, syscall: &str) -> Result<T> {
    check_pid(pid)?;
    let mut info = MaybeUninit::<T>::zeroed();
    let size = std::mem::size_of::<T>() as c_int;
    // SAFETY: `info` is valid for `size` bytes of writes.
    let written = unsafe { ffi::proc_pidinfo(pid, flavor, arg, info.as_mut_ptr() as *mut c_void, size) };
    if written <= 0 {
        return Err(classify(platform, pid, syscall, io::Error::last_os_error()));
    }
    if written < size {
        return Err(classify(platform, pid, syscall, io::Error::from(io::ErrorKind::PermissionDenied)));
    }
    // SAFETY: The record was zeroed and then filled by the kernel.
    Ok(unsafe { info.assume_init() })
}

pub(super) fn bsd_info(platform: &PlatformImpl, pid: Pid) -> Result<ffi::proc_bsdinfo> {
    pidinfo(platform, pid, ffi::PROC_PIDTBSDINFO, 0, "proc_pidinfo(PROC_PIDTBSDINFO)")
}

pub(super) fn task_info(platform: &PlatformImpl, pid: Pid) -> Result<ffi::proc_taskinfo> {
    pidinfo(platform, pid, ffi::PROC_PIDTASKINFO, 0, "proc_pidinfo(PROC_PIDTASKINFO)")
}

pub(super) fn name(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    check_pid(pid)?;
    let mut buf = [0u8; 2 * 16 + 1];
    // SAFETY: `buf` is valid for `buf.len()` bytes of writes.
    let written = unsafe { ffi::proc_name(pid, buf.as_mut_ptr() as *mut c_void, buf.len() as u32) };
    if written > 0 {
        return Ok(String::from_utf8_lossy(&buf[..written as usize]).into_owned());
    }
    // Zombies and kernel tasks have no libproc name, but keep their `p_comm`.
    let kinfo = kinfo_for(platform, pid)?;
    Ok(posix::c_chars_to_string(&kinfo.kp_proc.p_comm))
}

pub(super) fn exe(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    check_pid(pid)?;
    let mut buf = vec![0u8; ffi::PROC_PIDPATHINFO_MAXSIZE];
    // SAFETY: `buf` is valid for `buf.len()` bytes of writes.
    let written = unsafe { ffi::proc_pidpath(pid, buf.as_mut_ptr() as *mut c_void, buf.len() as u32) };
    if written <= 0 {
        return Err(classify(platform, pid, "proc_pidpath", io::Error::last_os_error()));
    }
    Ok(String::from_utf8_lossy(&buf[..written as usize]).into_owned())
}

pub(super) fn cwd(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    let info: ffi::proc_vnodepathinfo = pidinfo(
        platform,
        pid,
        ffi::PROC_PIDVNODEPATHINFO,
        0,
        "proc_pidinfo(PROC_PIDVNODEPATHINFO)",
    )?;
    Ok(posix::c_chars_to_string(&info.pvi_cdir.vip_path))
}

pub(super) fn terminal(platform: &PlatformImpl, pid: Pid) -> Result<Option<String>> {
    let tdev = bsd_info(platform, pid)?.e_tdev;
    // NODEV
    if tdev == u32::MAX {
        return Ok(None);
    }
    // SAFETY: `devname` returns null or a pointer to a static buffer.
    let name = unsafe { posix::c_ptr_to_string(libc::devname(tdev as libc::dev_t, libc::S_IFCHR)) };
    if name.is_empty() || name == "??" {
        return Ok(None);
    }
    Ok(Some(format!("/dev/{}", name)))
}

/// Arguments and environment of a process, from `KERN_PROCARGS2`.
#[derive(Debug, Default, PartialEq)]
pub(super) struct ProcArgs {
    pub(super) argv: Vec<String>,
    pub(super) env: Vec<String>,
}

/// Parses a `KERN_PROCARGS2` block: `argc`, the executable path, NUL padding, `argc` arguments, then environment
/// strings up to the first empty one.
pub(super) fn parse_procargs(block: &[u8]) -> Option<ProcArgs> {
    let argc = i32::from_ne_bytes(block.get(..4)?.try_into().ok()?).max(0) as usize;
    let rest = &block[4..];

    // Skip the executable path and the padding after it.
    let exec_end = rest.iter().position(|b| *b == 0)?;
    let start = rest[exec_end..].iter().position(|b| *b != 0).map(|i| exec_end + i)?;

    let mut strings = rest[start..].split(|b| *b == 0);
    let argv = strings
        .by_ref()
        .take(argc)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect::<Vec<_>>();
    let env = strings
        .take_while(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect();

    Some(ProcArgs { argv, env })
}

pub(super) fn procargs(platform: &PlatformImpl, pid: Pid) -> Result<ProcArgs> {
    check_pid(pid)?;
    let argmax: c_int = sysctl::value(&[libc::CTL_KERN, libc::KERN_ARGMAX], "sysctl(kern.argmax)")?;

    let mib = [libc::CTL_KERN, libc::KERN_PROCARGS2, pid];
    let mut block = vec![0u8; argmax.max(0) as usize];
    let mut len = block.len();
    // SAFETY: `block` is valid for `len` bytes of writes.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as c_uint,
            block.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        let error = io::Error::last_os_error();
        // EINVAL is what the kernel says for a live process we may not inspect.
        if error.raw_os_error() == Some(libc::EINVAL) && platform.pid_exists(pid) && !platform.is_zombie(pid) {
            return Err(Error::PermissionDenied {
                pid,
                syscall: "sysctl(kern.procargs2)".to_string(),
            });
        }
        return Err(classify(platform, pid, "sysctl(kern.procargs2)", error));
    }
    block.truncate(len);

    // Kernel tasks have an empty block.
    if block.len() <= 4 {
        return Ok(ProcArgs::default());
    }
    parse_procargs(&block)
        .ok_or_else(|| Error::parse(format!("kern.procargs2.{}", pid), "truncated argument block"))
        .classify_for(platform, pid)
}

pub(super) fn memory_full_info(platform: &PlatformImpl, pid: Pid) -> Result<MemoryFootprint> {
    check_pid(pid)?;
    let mut querier = Querier::new(Target::Pid(pid));
    querier
        .footprint()
        .map_err(|source| classify(platform, pid, "task_for_pid", source))
        .and_then(footprint_from)
}

/// A variable-length `proc_pidinfo` list of `T`.
fn pidinfo_list<T: Copy + Default>(
    platform: &PlatformImpl, pid: Pid, flavor: c_int, initial_len: usize, syscall: &str,
) -> Result<Vec<T>> {
    check_pid(pid)?;
    let elem_size = std::mem::size_of::<T>();
    grow_until_fits::<T, _>(platform.context.buffer_policy(), syscall, initial_len, |buf| {
        let size = (buf.len() * elem_size) as c_int;
        // SAFETY: `buf` is valid for `size` bytes of writes.
        let written = unsafe { ffi::proc_pidinfo(pid, flavor, 0, buf.as_mut_ptr() as *mut c_void, size) };
        if written <= 0 {
            return Err(classify(platform, pid, syscall, io::Error::last_os_error()));
        }
        // A full buffer may have been truncated silently.
        if written >= size {
            return Ok(Fill::TooSmall(None));
        }
        Ok(Fill::Done(written as usize / elem_size))
    })
}

pub(super) fn list_fds(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ffi::proc_fdinfo>> {
    check_pid(pid)?;
    // SAFETY: A null buffer only asks for an estimate of the needed size.
    let estimate = unsafe { ffi::proc_pidinfo(pid, ffi::PROC_PIDLISTFDS, 0, std::ptr::null_mut(), 0) };
    if estimate <= 0 {
        return Err(classify(platform, pid, "proc_pidinfo(PROC_PIDLISTFDS)", io::Error::last_os_error()));
    }
    let initial_len = estimate as usize / std::mem::size_of::<ffi::proc_fdinfo>() + 16;
    pidinfo_list(platform, pid, ffi::PROC_PIDLISTFDS, initial_len, "proc_pidinfo(PROC_PIDLISTFDS)")
}

/// A `proc_pidfdinfo` record, or `None` if the descriptor was closed in the meantime.
pub(super) fn fd_info<T: Copy>(platform: &PlatformImpl, pid: Pid, fd: i32, flavor: c_int, syscall: &str) -> Result<Option<T>> {
    let mut info = MaybeUninit::<T>::zeroed();
    let size = std::mem::size_of::<T>() as c_int;
    // SAFETY: `info` is valid for `size` bytes of writes.
    let written = unsafe { ffi::proc_pidfdinfo(pid, fd, flavor, info.as_mut_ptr() as *mut c_void, size) };
    if written <= 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::EBADF) {
            return Ok(None);
        }
        return Err(classify(platform, pid, syscall, error));
    }
    if written < size {
        return Err(classify(platform, pid, syscall, io::Error::from(io::ErrorKind::PermissionDenied)));
    }
    // SAFETY: The record was zeroed and then filled by the kernel.
    Ok(Some(unsafe { info.assume_init() }))
}

pub(super) fn open_files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<OpenFile>> {
    let mut files = Vec::new();
    for fd in list_fds(platform, pid)? {
        if fd.proc_fdtype != ffi::PROX_FDTYPE_VNODE {
            continue;
        }
        let Some(info) = fd_info::<ffi::vnode_fdinfowithpath>(
            platform,
            pid,
            fd.proc_fd,
            ffi::PROC_PIDFDVNODEPATHINFO,
            "proc_pidfdinfo(PROC_PIDFDVNODEPATHINFO)",
        )?
        else {
            continue;
        };

        if info.pvip.vip_vi.vi_stat.vst_mode & libc::S_IFMT != libc::S_IFREG {
            continue;
        }
        let path = posix::c_chars_to_string(&info.pvip.vip_path);
        if !path.is_empty() {
            files.push(OpenFile { path, fd: fd.proc_fd });
        }
    }
    Ok(files)
}

pub(super) fn threads(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ThreadTimes>> {
    let count = task_info(platform, pid)?.pti_threadnum.max(0) as usize;
    let ids = pidinfo_list::<u64>(
        platform,
        pid,
        ffi::PROC_PIDLISTTHREADS,
        count + 16,
        "proc_pidinfo(PROC_PIDLISTTHREADS)",
    )?;

    let mut threads = Vec::with_capacity(ids.len());
    for id in ids {
        // Threads exit while we walk them.
        let info = match pidinfo::<ffi::proc_threadinfo>(
            platform,
            pid,
            ffi::PROC_PIDTHREADINFO,
            id,
            "proc_pidinfo(PROC_PIDTHREADINFO)",
        ) {
            Ok(info) => info,
            Err(Error::ProcessOs { .. }) => continue,
            Err(e) => return Err(e),
        };
        threads.push(ThreadTimes {
            id,
            user: info.pth_user_time as f64 / 1_000_000_000.0,
            system: info.pth_system_time as f64 / 1_000_000_000.0,
        });
    }
    Ok(threads)
}

pub(super) fn io_counters(platform: &PlatformImpl, pid: Pid) -> Result<IoCounters> {
    check_pid(pid)?;
    let mut info = MaybeUninit::<ffi::rusage_info_v2>::zeroed();
    // SAFETY: `info` is a `rusage_info_v2`, which is what this flavor writes.
    if unsafe { ffi::proc_pid_rusage(pid, ffi::RUSAGE_INFO_V2, info.as_mut_ptr() as *mut c_void) } != 0 {
        return Err(classify(platform, pid, "proc_pid_rusage", io::Error::last_os_error()));
    }
    // SAFETY: The call succeeded, so the record is filled.
    let info = unsafe { info.assume_init() };
    // Only byte counts are tracked.
    Ok(IoCounters {
        read_bytes: info.ri_diskio_bytesread,
        write_bytes: info.ri_diskio_byteswritten,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingContext;

    fn procargs_block(argc: i32, exec: &str, strings: &[&str]) -> Vec<u8> {
        let mut block = argc.to_ne_bytes().to_vec();
        block.extend_from_slice(exec.as_bytes());
        block.extend_from_slice(&[0, 0, 0]);
        for s in strings {
            block.extend_from_slice(s.as_bytes());
            block.push(0);
        }
        block.extend_from_slice(&[0, 0]);
        block
    }

    #[test]
    fn procargs_split_arguments_from_environment() {
        let block = procargs_block(2, "/bin/sleep", &["sleep", "10", "HOME=/Users/me", "TERM=xterm"]);
        let args = parse_procargs(&block).unwrap();
        assert_eq!(args.argv, vec!["sleep", "10"]);
        assert_eq!(args.env, vec!["HOME=/Users/me", "TERM=xterm"]);
    }

    #[test]
    fn procargs_without_environment() {
        let block = procargs_block(1, "/sbin/launchd", &["launchd"]);
        let args = parse_procargs(&block).unwrap();
        assert_eq!(args.argv, vec!["launchd"]);
        assert!(args.env.is_empty());
        assert_eq!(parse_procargs(&[1, 0]), None);
    }

    #[test]
    fn own_process() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        let pid = std::process::id() as Pid;

        assert!(pids(&platform).unwrap().contains(&pid));
        assert!(!exe(&platform, pid).unwrap().is_empty());
        assert!(!procargs(&platform, pid).unwrap().argv.is_empty());
        assert!(!threads(&platform, pid).unwrap().is_empty());
        assert!(list_fds(&platform, pid).unwrap().len() >= 3);
        assert_eq!(status_from_stat(kinfo(pid).unwrap().kp_proc.p_stat), ProcessStatus::Running);
    }

    #[test]
    fn missing_process() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        assert_eq!(bsd_info(&platform, 99_999_999).unwrap_err().kind(), crate::ErrorKind::NotFound);
        assert_eq!(kinfo_for(&platform, -1).unwrap_err().kind(), crate::ErrorKind::NotFound);
    }
}
