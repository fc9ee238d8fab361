//! Solaris and illumos backend.
//!
//! System-wide counters come from kstat. Per-process data comes from the binary records under `/proc/<pid>`
//! (`psinfo`, `usage`, `cred`, `lwp/*/lwpusage`), symlinks under `/proc/<pid>/path`, and the process address space
//! for argument and environment vectors.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use tracing::debug;

use self::{
    kstat::{kstat_io_t, KstatGuard, KSTAT_TYPE_IO, KSTAT_TYPE_NAMED},
    proc::{decode, seconds, PrCred, PrUsage, PsInfo, PRNODEV, SZOMB},
};
use super::{
    posix::{self, addrspace::AddressSpace},
    procfs::{self, Procfs},
    Platform,
};
use crate::{
    bounded::run_bounded,
    buffer::{ensure_nonempty, read_record},
    classify::{check_pid, ClassifyExt as _, Liveness},
    context::BindingContext,
    error::{Error, Result},
    types::*,
};

mod kstat;
mod proc;

const DEFAULT_CLOCK_TICKS: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Fixed-point scale of the `avenrun_*` load averages.
const FSCALE: f64 = 256.0;

/// Filesystems with nothing on disk behind them.
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "autofs", "bootfs", "ctfs", "dev", "devfs", "fd", "lofs", "mntfs", "objfs", "proc", "sharefs",
];

/// The Solaris/illumos probe.
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

    /// Decodes a binary record under `/proc/<pid>`, classifying failures.
    fn record<T: Copy>(&self, pid: Pid, name: &str) -> Result<T> {
        check_pid(pid)?;
        let bytes = self.procfs.read_pid_bytes(pid, name).classify_for(self, pid)?;
        decode::<T>(&bytes, &self.procfs.pid_path(pid, name)).classify_for(self, pid)
    }

    fn psinfo(&self, pid: Pid) -> Result<PsInfo> {
        self.record(pid, "psinfo")
    }

    fn usage(&self, pid: Pid) -> Result<PrUsage> {
        self.record(pid, "usage")
    }

    fn cred(&self, pid: Pid) -> Result<PrCred> {
        self.record(pid, "cred")
    }

    /// Opens the address space of a process for argument and environment reads.
    fn address_space(&self, pid: Pid, info: &PsInfo) -> Result<AddressSpace<fs::File>> {
        let path = self.procfs.pid_path(pid, "as");
        let file = fs::File::open(&path)
            .map_err(|source| procfs::io_error("open", &path, source))
            .classify_for(self, pid)?;
        Ok(AddressSpace::new(file, info.pointer_size()))
    }

    fn fd_entries(&self, pid: Pid) -> Result<fs::ReadDir> {
        check_pid(pid)?;
        let dir = self.procfs.pid_path(pid, "fd");
        fs::read_dir(&dir)
            .map_err(|source| procfs::io_error("opendir", &dir, source))
            .classify_for(self, pid)
    }

    /// Named kstats of every CPU (`cpu:N:sys`).
    fn cpu_sys(&self) -> Result<Vec<BTreeMap<String, u64>>> {
        let kstat = KstatGuard::open()?;
        let mut cpus = Vec::new();
        for ks in kstat.find("cpu", Some("sys")) {
            let values = kstat
                .read_named(&ks)?
                .into_iter()
                .filter_map(|(name, value)| value.map(|value| (name, value)))
                .collect::<BTreeMap<_, _>>();
            cpus.push((ks.instance(), values));
        }
        cpus.sort_by_key(|(instance, _)| *instance);
        ensure_nonempty(cpus.into_iter().map(|(_, values)| values).collect(), "kstat(cpu::sys)")
    }

    fn cpu_ticks(&self, values: &BTreeMap<String, u64>) -> CpuTimes {
        let ticks = |key: &str| values.get(key).copied().unwrap_or(0) as f64 / self.clock_ticks;
        CpuTimes {
            user: ticks("cpu_ticks_user"),
            system: ticks("cpu_ticks_kernel"),
            idle: ticks("cpu_ticks_idle"),
            iowait: Some(ticks("cpu_ticks_wait")),
            ..Default::default()
        }
    }

    /// Named values of `unix:0:<name>`.
    fn unix_named(&self, name: &str) -> Result<BTreeMap<String, u64>> {
        let kstat = KstatGuard::open()?;
        let ks = kstat
            .find("unix", Some(name))
            .next()
            .ok_or_else(|| Error::unsupported(format!("kstat(unix::{})", name)))?;
        Ok(kstat
            .read_named(&ks)?
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .collect())
    }
}

/// Sums CPU time over every CPU.
fn sum_cpu_times(per_cpu: &[CpuTimes]) -> CpuTimes {
    per_cpu.iter().fold(
        CpuTimes {
            iowait: Some(0.0),
            ..Default::default()
        },
        |mut total, cpu| {
            total.user += cpu.user;
            total.system += cpu.system;
            total.idle += cpu.idle;
            total.iowait = Some(total.iowait.unwrap_or(0.0) + cpu.iowait.unwrap_or(0.0));
            total
        },
    )
}

/// Makes mount options carry exactly one of `ro` and `rw`.
fn normalize_opts(opts: &str) -> String {
    let mut parts = opts
        .split(',')
        .filter(|opt| !opt.is_empty() && *opt != "rw" && *opt != "ro")
        .collect::<Vec<_>>();
    let access = if opts.split(',').any(|opt| opt == "ro") { "ro" } else { "rw" };
    parts.insert(0, access);
    parts.join(",")
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        posix::pid_exists(pid)
    }

    fn is_zombie(&self, pid: Pid) -> bool {
        self.procfs
            .read_pid_bytes(pid, "psinfo")
            .ok()
            .and_then(|bytes| read_record::<PsInfo>(&bytes, 0))
            .map(|info| info.pr_lwp.pr_state == SZOMB)
            .unwrap_or(false)
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        let misc = self.unix_named("system_misc")?;
        misc.get("boot_time")
            .map(|boot_time| *boot_time as f64)
            .ok_or_else(|| Error::unsupported("kstat(unix::system_misc:boot_time)"))
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        Ok(sum_cpu_times(&self.per_cpu_times()?))
    }

    fn per_cpu_times(&self) -> Result<Vec<CpuTimes>> {
        Ok(self.cpu_sys()?.iter().map(|values| self.cpu_ticks(values)).collect())
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        // SAFETY: `sysconf` has no pointer arguments.
        match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            count if count > 0 => Ok(count as usize),
            _ => Ok(self.cpu_sys()?.len()),
        }
    }

    fn cpu_count_cores(&self) -> Result<usize> {
        let kstat = KstatGuard::open()?;
        let mut cores = BTreeSet::new();
        for ks in kstat.find("cpu_info", None) {
            let values = kstat.read_named(&ks)?;
            let value = |key: &str| values.iter().find(|(name, _)| name == key).and_then(|(_, value)| *value);
            if let Some(core) = value("core_id") {
                cores.insert((value("chip_id").unwrap_or(0), core));
            }
        }
        if cores.is_empty() {
            return Err(Error::unsupported("cpu_count_cores"));
        }
        Ok(cores.len())
    }

    fn cpu_stats(&self) -> Result<CpuStats> {
        let mut stats = CpuStats::default();
        for values in self.cpu_sys()? {
            let value = |key: &str| values.get(key).copied().unwrap_or(0);
            stats.ctx_switches += value("pswitch");
            stats.interrupts += value("intr");
            stats.syscalls += value("syscall");
        }
        Ok(stats)
    }

    fn cpu_freq(&self) -> Result<CpuFreq> {
        let kstat = KstatGuard::open()?;
        let (mut current, mut max, mut cpus) = (0.0, 0.0f64, 0usize);
        for ks in kstat.find("cpu_info", None) {
            let values = kstat.read_named(&ks)?;
            let value = |key: &str| values.iter().find(|(name, _)| name == key).and_then(|(_, value)| *value);
            let rated = value("clock_MHz").unwrap_or(0) as f64;
            current += value("current_clock_Hz").map(|hz| hz as f64 / 1_000_000.0).unwrap_or(rated);
            max = max.max(rated);
            cpus += 1;
        }
        if cpus == 0 {
            return Err(Error::unsupported("cpu_freq"));
        }
        Ok(CpuFreq {
            current: current / cpus as f64,
            min: 0.0,
            max,
        })
    }

    fn load_avg(&self) -> Result<LoadAvg> {
        let misc = self.unix_named("system_misc")?;
        let avg = |key: &str| misc.get(key).copied().unwrap_or(0) as f64 / FSCALE;
        Ok(LoadAvg {
            one: avg("avenrun_1min"),
            five: avg("avenrun_5min"),
            fifteen: avg("avenrun_15min"),
        })
    }

    fn virtual_memory(&self) -> Result<VirtualMemory> {
        let pages = self.unix_named("system_pages")?;
        let bytes = |key: &str| pages.get(key).copied().unwrap_or(0) * self.page_size;
        let total = bytes("physmem");
        let free = bytes("freemem");
        Ok(VirtualMemory {
            total,
            available: free,
            used: total.saturating_sub(free),
            free,
            ..Default::default()
        })
    }

    fn disk_partitions(&self, all: bool) -> Result<Vec<Partition>> {
        let mnttab = procfs::read_text(Path::new("/etc/mnttab"))?;
        Ok(procfs::disk::parse_mounts(&mnttab, None)
            .into_iter()
            .filter(|partition| all || !PSEUDO_FILESYSTEMS.contains(&partition.fstype.as_str()))
            .map(|partition| Partition {
                opts: normalize_opts(&partition.opts),
                ..partition
            })
            .collect())
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn disk_io_counters(&self) -> Result<BTreeMap<String, DiskIoCounters>> {
        let kstat = KstatGuard::open()?;
        let mut counters = BTreeMap::new();
        for ks in kstat.iter().filter(|ks| ks.kind() == KSTAT_TYPE_IO && ks.class() == "disk") {
            let Some(io) = read_record::<kstat_io_t>(&kstat.read(&ks)?, 0) else {
                continue;
            };
            counters.insert(ks.name(), DiskIoCounters {
                read_count: u64::from(io.reads),
                write_count: u64::from(io.writes),
                read_bytes: io.nread,
                write_bytes: io.nwritten,
                read_time: (io.rtime.max(0) / 1_000_000) as u64,
                write_time: (io.wtime.max(0) / 1_000_000) as u64,
                busy_time: None,
            });
        }
        Ok(counters)
    }

    fn net_io_counters(&self) -> Result<BTreeMap<String, NetIoCounters>> {
        let interfaces = posix::ifaddrs::interface_flags()?;
        let kstat = KstatGuard::open()?;
        let mut counters = BTreeMap::new();
        for ks in kstat.iter().filter(|ks| ks.kind() == KSTAT_TYPE_NAMED && ks.class() == "net") {
            let name = ks.name();
            if !interfaces.contains_key(&name) || counters.contains_key(&name) {
                continue;
            }
            let values = kstat.read_named(&ks)?;
            let value = |key: &str| {
                values
                    .iter()
                    .find(|(name, _)| name == key)
                    .and_then(|(_, value)| *value)
                    .unwrap_or(0)
            };
            counters.insert(name, NetIoCounters {
                bytes_sent: value("obytes64"),
                bytes_recv: value("rbytes64"),
                packets_sent: value("opackets64"),
                packets_recv: value("ipackets64"),
                errin: value("ierrors"),
                errout: value("oerrors"),
                dropin: value("norcvbuf"),
                dropout: value("noxmtbuf"),
            });
        }
        Ok(counters)
    }

    fn net_if_addrs(&self) -> Result<BTreeMap<String, Vec<NicAddress>>> {
        posix::ifaddrs::net_if_addrs()
    }

    fn net_if_stats(&self) -> Result<BTreeMap<String, NicStats>> {
        let interfaces = posix::ifaddrs::interface_flags()?;
        let kstat = KstatGuard::open()?;
        let mut stats = BTreeMap::new();
        for (name, flags) in interfaces {
            let mut nic = NicStats {
                is_up: posix::ifaddrs::is_up(flags),
                flags: posix::ifaddrs::flag_names(flags),
                ..Default::default()
            };
            // Link properties live in the `net` class kstat named after the interface; IP-only interfaces have none.
            let link = kstat
                .iter()
                .find(|ks| ks.kind() == KSTAT_TYPE_NAMED && ks.class() == "net" && ks.name() == name);
            if let Some(ks) = link {
                match kstat.read_named(&ks) {
                    Ok(values) => {
                        let value = |key: &str| values.iter().find(|(n, _)| n == key).and_then(|(_, value)| *value);
                        nic.speed = value("ifspeed").unwrap_or(0) / 1_000_000;
                        nic.duplex = match value("link_duplex") {
                            Some(1) => Duplex::Half,
                            Some(2) => Duplex::Full,
                            _ => Duplex::Unknown,
                        };
                    }
                    Err(e) => {
                        if self.context.debug() {
                            debug!(interface = %name, error = %e, "Link kstat unreadable, leaving speed and duplex unknown.");
                        }
                    }
                }
            }
            stats.insert(name, nic);
        }
        Ok(stats)
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

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(self.psinfo(pid)?.name())
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        let exe = self.procfs.read_pid_link(pid, "path/a.out").classify_for(self, pid)?;
        Ok(exe.to_string_lossy().into_owned())
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        let info = self.psinfo(pid)?;
        let full = self
            .address_space(pid, &info)
            .and_then(|space| {
                let argc = usize::try_from(info.pr_argc).unwrap_or(0);
                space.argv(info.pr_argv as u64, argc).classify_for(self, pid)
            });
        match full {
            Ok(args) if !args.is_empty() => Ok(args),
            Ok(_) => Ok(info.short_args()),
            // The address space of other users' processes is off limits; `pr_psargs` isn't.
            Err(Error::PermissionDenied { .. }) => Ok(info.short_args()),
            Err(e) => Err(e),
        }
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        let info = self.psinfo(pid)?;
        let space = self.address_space(pid, &info)?;
        let entries = space.envp(info.pr_envp as u64).classify_for(self, pid)?;
        Ok(super::parse_environ_block(entries))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        let cwd = self.procfs.read_pid_link(pid, "path/cwd").classify_for(self, pid)?;
        Ok(cwd.to_string_lossy().into_owned())
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(self.psinfo(pid)?.pr_ppid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(proc::status_from_state(self.psinfo(pid)?.pr_lwp.pr_state))
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        let cred = self.cred(pid)?;
        Ok(ProcessIds {
            real: cred.pr_ruid,
            effective: cred.pr_euid,
            saved: cred.pr_suid,
        })
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let cred = self.cred(pid)?;
        Ok(ProcessIds {
            real: cred.pr_rgid,
            effective: cred.pr_egid,
            saved: cred.pr_sgid,
        })
    }

    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        let dev = self.psinfo(pid)?.pr_ttydev;
        if dev == PRNODEV {
            return Ok(None);
        }
        Ok(posix::terminal_name(dev as u64))
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        Ok(seconds(&self.psinfo(pid)?.pr_start))
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let usage = self.usage(pid)?;
        Ok(ProcessCpuTimes {
            user: seconds(&usage.pr_utime),
            system: seconds(&usage.pr_stime),
            children_user: None,
            children_system: None,
        })
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        let info = self.psinfo(pid)?;
        let usage = self.usage(pid)?;
        Ok(ProcessMemory {
            rss: info.pr_rssize as u64 * 1024,
            vms: info.pr_size as u64 * 1024,
            page_faults: Some(usage.pr_minf as u64 + usage.pr_majf as u64),
            ..Default::default()
        })
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(self.psinfo(pid)?.pr_nlwp.max(0) as u64)
    }

    fn proc_threads(&self, pid: Pid) -> Result<Vec<ThreadTimes>> {
        check_pid(pid)?;
        let dir = self.procfs.pid_path(pid, "lwp");
        let entries = fs::read_dir(&dir)
            .map_err(|source| procfs::io_error("opendir", &dir, source))
            .classify_for(self, pid)?;

        let mut threads = Vec::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path().join("lwpusage");
            // LWPs exit while we walk the directory.
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            let usage = decode::<PrUsage>(&bytes, &path)?;
            threads.push(ThreadTimes {
                id: usage.pr_lwpid.max(0) as u64,
                user: seconds(&usage.pr_utime),
                system: seconds(&usage.pr_stime),
            });
        }
        threads.sort_by_key(|thread| thread.id);
        Ok(threads)
    }

    fn proc_num_ctx_switches(&self, pid: Pid) -> Result<CtxSwitches> {
        let usage = self.usage(pid)?;
        Ok(CtxSwitches {
            voluntary: usage.pr_vctx as u64,
            involuntary: usage.pr_ictx as u64,
        })
    }

    fn proc_io_counters(&self, pid: Pid) -> Result<IoCounters> {
        let usage = self.usage(pid)?;
        // `pr_ioch` counts characters read and written together.
        Ok(IoCounters {
            read_count: usage.pr_inblk as u64,
            write_count: usage.pr_oublk as u64,
            read_bytes: usage.pr_ioch as u64,
            write_bytes: 0,
        })
    }

    fn proc_open_files(&self, pid: Pid) -> Result<Vec<OpenFile>> {
        let mut files = Vec::new();
        for entry in self.fd_entries(pid)?.filter_map(|entry| entry.ok()) {
            let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
                continue;
            };
            match fs::metadata(entry.path()) {
                Ok(metadata) if metadata.is_file() => {}
                Ok(_) => continue,
                Err(e) => {
                    if self.context.debug() {
                        debug!(fd, error = %e, "Ignoring descriptor that vanished.");
                    }
                    continue;
                }
            }
            // `path/<fd>` is missing for files whose name the kernel no longer knows.
            if let Ok(target) = self.procfs.read_pid_link(pid, &format!("path/{}", fd)) {
                files.push(OpenFile {
                    path: target.to_string_lossy().into_owned(),
                    fd,
                });
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
        Ok(self.psinfo(pid)?.pr_lwp.pr_state == SZOMB)
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
    fn mount_options() {
        assert_eq!(normalize_opts("rw,devices,setuid"), "rw,devices,setuid");
        assert_eq!(normalize_opts("devices,ro,nosuid"), "ro,devices,nosuid");
        assert_eq!(normalize_opts("dev=4010002"), "rw,dev=4010002");
    }

    #[test]
    fn summed_cpu_times() {
        let cpu = CpuTimes {
            user: 1.0,
            system: 2.0,
            idle: 3.0,
            iowait: Some(0.5),
            ..Default::default()
        };
        let total = sum_cpu_times(&[cpu.clone(), cpu]);
        assert_eq!(total.user, 2.0);
        assert_eq!(total.idle, 6.0);
        assert_eq!(total.iowait, Some(1.0));
    }

    #[test]
    fn own_process() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        assert!(platform.pids().unwrap().contains(&pid));
        assert!(platform.proc_memory_info(pid).unwrap().rss > 0);
        assert!(platform.proc_num_threads(pid).unwrap() >= 1);
        assert!(!platform.proc_cmdline(pid).unwrap().is_empty());
        assert!(platform.proc_environ(pid).unwrap().contains_key("PATH"));
        assert_eq!(platform.proc_uids(pid).unwrap().real, unsafe { libc::getuid() });
        assert!(!platform.proc_threads(pid).unwrap().is_empty());
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
        assert!(platform.boot_time().unwrap() > 0.0);
        assert!(platform.virtual_memory().unwrap().total > 0);
        assert_eq!(platform.per_cpu_times().unwrap().len(), platform.cpu_count_logical().unwrap());
        assert!(platform.disk_partitions(false).unwrap().iter().any(|p| p.mountpoint == "/"));
        assert_eq!(platform.swap_memory().unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
