use std::{
    fs, io,
    os::unix::fs::{FileTypeExt as _, MetadataExt as _},
    path::Path,
};

use process_memory::{Querier, Target};

use super::PlatformImpl;
use crate::{
    buffer::{grow_until_fits, Fill},
    classify::{check_pid, classify, ClassifyExt as _, Liveness as _},
    error::{Error, Result},
    platform::{
        footprint_from,
        posix,
        procfs::pid as procfs_pid,
    },
    types::{MemoryFootprint, OpenFile, Pid, ProcessMemory, ThreadTimes},
};
#[cfg(target_os = "linux")]
use crate::types::{Resource, ResourceLimit};

pub(super) fn exe(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    check_pid(pid)?;
    match platform.procfs.read_pid_link(pid, "exe") {
        Ok(path) => Ok(path.to_string_lossy().into_owned()),
        // Kernel threads have no executable, and the link is then missing while the process is alive.
        Err(Error::Os { source, .. })
            if source.kind() == io::ErrorKind::NotFound
                && platform.pid_exists(pid)
                && !platform.is_zombie(pid) =>
        {
            Ok(String::new())
        }
        Err(e) => Err(e).classify_for(platform, pid),
    }
}

/// Splits `/proc/<pid>/cmdline`.
///
/// Processes that rewrite their argument area (`setproctitle` and friends) sometimes separate arguments with spaces
/// instead of NULs.
pub(super) fn split_cmdline(raw: &[u8]) -> Vec<String> {
    let nul_terminated = raw.last() == Some(&0);
    let args = posix::split_nul_block(raw);
    if !nul_terminated && args.len() == 1 && args[0].contains(' ') {
        return args[0].split(' ').filter(|arg| !arg.is_empty()).map(str::to_string).collect();
    }
    args
}

/// Finds the device node for a `tty_nr` from `/proc/<pid>/stat`.
pub(super) fn terminal_name(devfs: &Path, tty_nr: u64) -> Option<String> {
    if tty_nr == 0 {
        return None;
    }

    // `tty_nr` uses the same encoding as `st_rdev` for every major and minor a terminal can have.
    let candidates = fs::read_dir(devfs)
        .into_iter()
        .chain(fs::read_dir(devfs.join("pts")))
        .flatten()
        .filter_map(|entry| entry.ok());
    for entry in candidates {
        let path = entry.path();
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        if metadata.file_type().is_char_device() && metadata.rdev() == tty_nr {
            return Some(path.to_string_lossy().into_owned());
        }
    }
    None
}

pub(super) fn memory_info(platform: &PlatformImpl, pid: Pid) -> Result<ProcessMemory> {
    check_pid(pid)?;
    let statm = platform.procfs.read_pid(pid, "statm").classify_for(platform, pid)?;
    let statm = procfs_pid::parse_statm(&statm).classify_for(platform, pid)?;
    let stat = platform.proc_stat(pid)?;

    // The high water mark is only in `status`, which is fine to lose.
    let peak_rss = platform
        .proc_status_text(pid)
        .ok()
        .and_then(|status| procfs_pid::status_amount(&procfs_pid::parse_status(&status), "VmHWM"));

    let pages = |n: u64| n * platform.page_size;
    Ok(ProcessMemory {
        rss: pages(statm.resident),
        vms: pages(statm.size),
        shared: Some(pages(statm.shared)),
        text: Some(pages(statm.text)),
        data: Some(pages(statm.data)),
        page_faults: Some(stat.minflt + stat.majflt),
        peak_rss,
    })
}

pub(super) fn memory_full_info(platform: &PlatformImpl, pid: Pid) -> Result<MemoryFootprint> {
    check_pid(pid)?;
    let mut querier = Querier::with_procfs_root(Target::Pid(pid), platform.procfs.root());
    let footprint = querier
        .footprint()
        .map_err(|source| classify(platform, pid, "smaps", source))?;
    footprint_from(footprint)
}

pub(super) fn threads(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ThreadTimes>> {
    check_pid(pid)?;
    let dir = platform.procfs.pid_path(pid, "task");
    let entries = fs::read_dir(&dir)
        .map_err(|source| classify(platform, pid, &format!("opendir({})", dir.display()), source))?;

    let mut threads = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) else {
            continue;
        };
        // Threads exit while we walk them.
        let Ok(text) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let stat = procfs_pid::parse_stat(&text).classify_for(platform, pid)?;
        threads.push(ThreadTimes {
            id: tid,
            user: stat.utime as f64 / platform.clock_ticks,
            system: stat.stime as f64 / platform.clock_ticks,
        });
    }
    threads.sort_by_key(|thread| thread.id);
    Ok(threads)
}

fn fd_entries(platform: &PlatformImpl, pid: Pid) -> Result<fs::ReadDir> {
    check_pid(pid)?;
    let dir = platform.procfs.pid_path(pid, "fd");
    fs::read_dir(&dir).map_err(|source| classify(platform, pid, &format!("opendir({})", dir.display()), source))
}

pub(super) fn open_files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<OpenFile>> {
    let mut files = Vec::new();
    for entry in fd_entries(platform, pid)?.filter_map(|entry| entry.ok()) {
        let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };
        // Descriptors get closed while we walk them.
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        if !target.is_absolute() {
            // Sockets, pipes and anonymous inodes.
            continue;
        }
        // Following the fd link rather than the path reaches the file even if it was deleted or is in another mount
        // namespace.
        match fs::metadata(entry.path()) {
            Ok(metadata) if metadata.is_file() => files.push(OpenFile {
                path: target.to_string_lossy().into_owned(),
                fd,
            }),
            _ => continue,
        }
    }
    files.sort_by_key(|file| file.fd);
    Ok(files)
}

pub(super) fn num_fds(platform: &PlatformImpl, pid: Pid) -> Result<u64> {
    Ok(fd_entries(platform, pid)?.filter_map(|entry| entry.ok()).count() as u64)
}

/// Words of a CPU mask, sized for 1024 CPUs to start with.
const INITIAL_MASK_WORDS: usize = 1024 / 64;

pub(super) fn cpu_affinity(platform: &PlatformImpl, pid: Pid) -> Result<Vec<usize>> {
    check_pid(pid)?;
    let mask = grow_until_fits::<u64, _>(
        platform.context.buffer_policy(),
        "sched_getaffinity",
        INITIAL_MASK_WORDS,
        |words| {
            let size = std::mem::size_of_val(words);
            // SAFETY: The kernel writes at most `size` bytes to `words`.
            let rc = unsafe { libc::sched_getaffinity(pid, size, words.as_mut_ptr() as *mut libc::cpu_set_t) };
            if rc == -1 {
                let error = io::Error::last_os_error();
                // EINVAL means the mask is smaller than the kernel's.
                if error.raw_os_error() == Some(libc::EINVAL) {
                    return Ok(Fill::TooSmall(None));
                }
                return Err(classify(platform, pid, "sched_getaffinity", error));
            }
            Ok(Fill::Done(words.len()))
        },
    )?;

    Ok(cpus_from_mask(&mask))
}

pub(super) fn set_cpu_affinity(platform: &PlatformImpl, pid: Pid, cpus: &[usize]) -> Result<()> {
    check_pid(pid)?;
    if cpus.is_empty() {
        return Err(Error::Os {
            syscall: "sched_setaffinity".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty CPU set"),
        });
    }

    let mask = mask_from_cpus(cpus);
    let size = std::mem::size_of_val(mask.as_slice());
    // SAFETY: The kernel reads at most `size` bytes from `mask`.
    if unsafe { libc::sched_setaffinity(pid, size, mask.as_ptr() as *const libc::cpu_set_t) } == -1 {
        return Err(classify(platform, pid, "sched_setaffinity", io::Error::last_os_error()));
    }
    Ok(())
}

fn cpus_from_mask(mask: &[u64]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .flat_map(|(i, word)| (0..64).filter(move |bit| word & (1 << bit) != 0).map(move |bit| i * 64 + bit))
        .collect()
}

fn mask_from_cpus(cpus: &[usize]) -> Vec<u64> {
    let words = cpus.iter().max().map_or(0, |max| max / 64 + 1).max(INITIAL_MASK_WORDS);
    let mut mask = vec![0u64; words];
    for cpu in cpus {
        mask[cpu / 64] |= 1 << (cpu % 64);
    }
    mask
}

#[cfg(target_os = "linux")]
pub(super) fn rlimit(platform: &PlatformImpl, pid: Pid, resource: Resource) -> Result<ResourceLimit> {
    check_pid(pid)?;
    let which = match resource {
        Resource::AddressSpace => libc::RLIMIT_AS,
        Resource::CoreFileSize => libc::RLIMIT_CORE,
        Resource::CpuTime => libc::RLIMIT_CPU,
        Resource::DataSize => libc::RLIMIT_DATA,
        Resource::FileSize => libc::RLIMIT_FSIZE,
        Resource::Locks => libc::RLIMIT_LOCKS,
        Resource::LockedMemory => libc::RLIMIT_MEMLOCK,
        Resource::MessageQueue => libc::RLIMIT_MSGQUEUE,
        Resource::Nice => libc::RLIMIT_NICE,
        Resource::OpenFiles => libc::RLIMIT_NOFILE,
        Resource::Processes => libc::RLIMIT_NPROC,
        Resource::ResidentSet => libc::RLIMIT_RSS,
        Resource::RealtimePriority => libc::RLIMIT_RTPRIO,
        Resource::RealtimeTime => libc::RLIMIT_RTTIME,
        Resource::PendingSignals => libc::RLIMIT_SIGPENDING,
        Resource::StackSize => libc::RLIMIT_STACK,
    };

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is valid for writes, and a null new limit only reads.
    if unsafe { libc::prlimit(pid, which, std::ptr::null(), &mut limit) } == -1 {
        return Err(classify(platform, pid, "prlimit", io::Error::last_os_error()));
    }

    let finite = |value: libc::rlim_t| (value != libc::RLIM_INFINITY).then_some(value as u64);
    Ok(ResourceLimit {
        soft: finite(limit.rlim_cur),
        hard: finite(limit.rlim_max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_splitting() {
        assert_eq!(split_cmdline(b"/bin/sh\0-c\0echo hi\0"), vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(split_cmdline(b"nginx: worker process"), vec!["nginx:", "worker", "process"]);
        assert!(split_cmdline(b"").is_empty());
    }

    #[test]
    fn cpu_masks() {
        assert_eq!(cpus_from_mask(&[0b1011, 1]), vec![0, 1, 3, 64]);
        let mask = mask_from_cpus(&[0, 3, 130]);
        assert_eq!(mask.len(), INITIAL_MASK_WORDS);
        assert_eq!(cpus_from_mask(&mask), vec![0, 3, 130]);
        assert_eq!(mask_from_cpus(&[2000]).len(), 2000 / 64 + 1);
    }

    #[test]
    fn full_memory_info_needs_smaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("42")).unwrap();
        std::fs::write(dir.path().join("42/statm"), "2048 512 128 16 0 256 0\n").unwrap();
        let platform = PlatformImpl::new(
            crate::context::BindingContext::builder()
                .testing(true)
                .procfs_root(dir.path())
                .build(),
        );

        let error = memory_full_info(&platform, 42).unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[test]
    fn no_terminal() {
        assert_eq!(terminal_name(Path::new("/dev"), 0), None);
    }
}
