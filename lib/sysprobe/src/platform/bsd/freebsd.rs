//! FreeBSD: `kinfo_proc` and `kinfo_file` through `sysctl(KERN_PROC)`, swap through `libkvm`, disk counters from
//! `kern.devstat.all`, and sensors from the ACPI and `coretemp` nodes.

use std::{collections::BTreeMap, io};

use libc::{c_char, c_int, c_long};

use super::{kinfo_record, logical_cpus, split_cpu_ticks, timeval_secs, PlatformImpl, ProcInfo};
use crate::{
    buffer::{read_record, read_records},
    classify::{check_pid, classify, ClassifyExt as _},
    error::{Error, ErrorKind, Result},
    filter::{AddressFamilies, ConnectionFilter, SocketTypes},
    platform::{
        bsdlike::{self, sockets, sysctl},
        posix,
    },
    types::*,
};

const KERN_PROC_INC_THREAD: c_int = 0x10;
const KERN_PROC_FILEDESC: c_int = 33;
const KERN_PROC_ENV: c_int = 35;
const KERN_PROC_RLIMIT: c_int = 37;

const SIDL: c_char = 1;
const SRUN: c_char = 2;
const SSLEEP: c_char = 3;
const SSTOP: c_char = 4;
const SZOMB: c_char = 5;
const SWAIT: c_char = 6;
const SLOCK: c_char = 7;

/// `CP_USER`, `CP_NICE`, `CP_SYS`, `CP_INTR`, `CP_IDLE`.
const CPUSTATES: usize = 5;

const CPU_LEVEL_WHICH: c_int = 3;
const CPU_WHICH_PID: c_int = 2;
/// Room for `CPU_MAXSIZE` (1024) CPUs.
const CPU_SET_WORDS: usize = 16;

extern "C" {
    fn cpuset_getaffinity(level: c_int, which: c_int, id: i64, setsize: usize, mask: *mut u64) -> c_int;
    fn cpuset_setaffinity(level: c_int, which: c_int, id: i64, setsize: usize, mask: *const u64) -> c_int;
}

/// Offsets into a `struct kinfo_file` record (FreeBSD 12 and later).
mod kf {
    pub(super) const STRUCTSIZE: usize = 0;
    pub(super) const TYPE: usize = 4;
    pub(super) const FD: usize = 8;
    pub(super) const VNODE_TYPE: usize = 32;
    pub(super) const SOCK_DOMAIN: usize = 36;
    pub(super) const SOCK_TYPE: usize = 40;
    pub(super) const SA_LOCAL: usize = 48;
    pub(super) const SA_PEER: usize = 176;
    pub(super) const SOCK_PCB: usize = 304;
    pub(super) const SOCKADDR_STORAGE: usize = 128;
    pub(super) const PATH: usize = 368;

    pub(super) const TYPE_VNODE: i32 = 1;
    pub(super) const TYPE_SOCKET: i32 = 2;
    pub(super) const VTYPE_VREG: i32 = 1;
    pub(super) const FD_TYPE_CWD: i32 = -1;
}

/// Offsets into a `struct xtcpcb` record of `net.inet.tcp.pcblist` (FreeBSD 12 and later).
mod xt {
    /// `xt_len`; the embedded `xinpcb` starts right after it with its own `xi_len`.
    pub(super) const LEN: usize = 0;
    pub(super) const INP: usize = 8;
    /// `xt_inp.xi_socket.so_pcb`
    pub(super) const SO_PCB: usize = 32;
    /// `t_state`, counted from the end of `xt_inp`.
    pub(super) const STATE_AFTER_INP: usize = 160;
}

fn status_from_stat(stat: c_char) -> ProcessStatus {
    match stat {
        SIDL => ProcessStatus::Idle,
        SRUN => ProcessStatus::Running,
        SSLEEP => ProcessStatus::Sleeping,
        SSTOP => ProcessStatus::Stopped,
        SZOMB => ProcessStatus::Zombie,
        SWAIT => ProcessStatus::Waiting,
        SLOCK => ProcessStatus::Locked,
        _ => ProcessStatus::Waiting,
    }
}

fn info_from(kinfo: &libc::kinfo_proc, page_size: u64) -> ProcInfo {
    let usage = &kinfo.ki_rusage;
    let children = &kinfo.ki_rusage_ch;
    let tdev = kinfo.ki_tdev as u64;
    // NODEV, in either width the kernel might report it.
    let tdev = (tdev != u64::MAX && tdev != u32::MAX as u64).then_some(tdev);
    let pages = |count: i64| count.max(0) as u64 * page_size;

    ProcInfo {
        pid: kinfo.ki_pid,
        ppid: kinfo.ki_ppid,
        status: status_from_stat(kinfo.ki_stat),
        comm: posix::c_chars_to_string(&kinfo.ki_comm),
        uids: ProcessIds {
            real: kinfo.ki_ruid,
            effective: kinfo.ki_uid,
            saved: kinfo.ki_svuid,
        },
        gids: ProcessIds {
            real: kinfo.ki_rgid,
            effective: kinfo.ki_groups[0],
            saved: kinfo.ki_svgid,
        },
        tdev,
        create_time: timeval_secs(kinfo.ki_start.tv_sec as i64, kinfo.ki_start.tv_usec as i64),
        cpu: ProcessCpuTimes {
            user: timeval_secs(usage.ru_utime.tv_sec as i64, usage.ru_utime.tv_usec as i64),
            system: timeval_secs(usage.ru_stime.tv_sec as i64, usage.ru_stime.tv_usec as i64),
            children_user: Some(timeval_secs(children.ru_utime.tv_sec as i64, children.ru_utime.tv_usec as i64)),
            children_system: Some(timeval_secs(children.ru_stime.tv_sec as i64, children.ru_stime.tv_usec as i64)),
        },
        memory: ProcessMemory {
            rss: pages(kinfo.ki_rssize as i64),
            vms: kinfo.ki_size as u64,
            text: Some(pages(kinfo.ki_tsize as i64)),
            data: Some(pages(kinfo.ki_dsize as i64)),
            page_faults: Some(usage.ru_majflt.max(0) as u64),
            ..Default::default()
        },
        num_threads: Some(kinfo.ki_numthreads.max(0) as u64),
        ctx: CtxSwitches {
            voluntary: usage.ru_nvcsw.max(0) as u64,
            involuntary: usage.ru_nivcsw.max(0) as u64,
        },
        io: IoCounters {
            read_count: usage.ru_inblock.max(0) as u64,
            write_count: usage.ru_oublock.max(0) as u64,
            ..Default::default()
        },
    }
}

pub(super) fn kinfo(pid: Pid, page_size: u64) -> Result<ProcInfo> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID, pid];
    let kinfo: libc::kinfo_proc = kinfo_record(&mib, pid, "sysctl(kern.proc.pid)")?;
    Ok(info_from(&kinfo, page_size))
}

pub(super) fn pids(platform: &PlatformImpl) -> Result<Vec<Pid>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PROC, 0];
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(kern.proc.proc)")?;
    Ok(read_records::<libc::kinfo_proc>(&bytes)
        .into_iter()
        .map(|kinfo| kinfo.ki_pid)
        .collect())
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub(super) fn exe(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PATHNAME, pid];
    match platform.proc_node(pid, &mib, "sysctl(kern.proc.pathname)") {
        Ok(bytes) => Ok(trim_nul(&bytes)),
        // Kernel processes, and processes whose executable was deleted, have no path.
        Err(Error::ProcessOs { source, .. }) if source.raw_os_error() == Some(libc::ENOENT) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

pub(super) fn cmdline(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_ARGS, pid];
    Ok(posix::split_nul_block(&platform.proc_node(pid, &mib, "sysctl(kern.proc.args)")?))
}

pub(super) fn environ(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, KERN_PROC_ENV, pid];
    Ok(posix::split_nul_block(&platform.proc_node(pid, &mib, "sysctl(kern.proc.env)")?))
}

/// One variable-length `kinfo_file` record.
struct FileRecord<'a>(&'a [u8]);

impl FileRecord<'_> {
    fn int(&self, offset: usize) -> i32 {
        read_record::<i32>(self.0, offset).unwrap_or(0)
    }

    fn fd(&self) -> i32 {
        self.int(kf::FD)
    }

    fn path(&self) -> String {
        trim_nul(self.0.get(kf::PATH..).unwrap_or_default())
    }

    fn sock_pcb(&self) -> Option<u64> {
        read_record::<u64>(self.0, kf::SOCK_PCB)
    }

    fn sockaddr(&self, offset: usize) -> &[u8] {
        let end = (offset + kf::SOCKADDR_STORAGE).min(self.0.len());
        self.0.get(offset..end).unwrap_or_default()
    }
}

/// Walks the packed `kinfo_file` records of `KERN_PROC_FILEDESC`, each prefixed by its own size.
fn file_records(bytes: &[u8]) -> Vec<FileRecord<'_>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while let Some(size) = read_record::<i32>(bytes, offset + kf::STRUCTSIZE) {
        if size <= 0 {
            break;
        }
        let end = (offset + size as usize).min(bytes.len());
        records.push(FileRecord(&bytes[offset..end]));
        offset = end;
    }
    records
}

fn filedesc(platform: &PlatformImpl, pid: Pid) -> Result<Vec<u8>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, KERN_PROC_FILEDESC, pid];
    platform.proc_node(pid, &mib, "sysctl(kern.proc.filedesc)")
}

pub(super) fn cwd(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    let bytes = filedesc(platform, pid)?;
    Ok(file_records(&bytes)
        .into_iter()
        .find(|record| record.fd() == kf::FD_TYPE_CWD)
        .map(|record| record.path())
        .unwrap_or_default())
}

fn open_files_in(bytes: &[u8]) -> Vec<OpenFile> {
    file_records(bytes)
        .into_iter()
        .filter(|record| {
            record.fd() >= 0 && record.int(kf::TYPE) == kf::TYPE_VNODE && record.int(kf::VNODE_TYPE) == kf::VTYPE_VREG
        })
        .filter_map(|record| {
            let path = record.path();
            (!path.is_empty()).then_some(OpenFile { path, fd: record.fd() })
        })
        .collect()
}

pub(super) fn open_files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<OpenFile>> {
    Ok(open_files_in(&filedesc(platform, pid)?))
}

pub(super) fn num_fds(platform: &PlatformImpl, pid: Pid) -> Result<u64> {
    let bytes = filedesc(platform, pid)?;
    Ok(file_records(&bytes).iter().filter(|record| record.fd() >= 0).count() as u64)
}

/// TCP state of every TCP socket, keyed by the kernel address of its protocol control block.
///
/// The records are bracketed by a leading and a trailing `xinpgen`, which are no longer than the header.
fn tcp_states_in(bytes: &[u8]) -> BTreeMap<u64, i32> {
    let mut states = BTreeMap::new();
    let Some(header) = read_record::<u64>(bytes, 0) else {
        return states;
    };
    let header = header as usize;
    let mut offset = header;
    while let Some(len) = read_record::<u64>(bytes, offset + xt::LEN) {
        let len = len as usize;
        if len <= header {
            break;
        }
        let Some(record) = bytes.get(offset..offset + len) else {
            break;
        };
        let inp_len = read_record::<u64>(record, xt::INP).unwrap_or(0) as usize;
        let pcb = read_record::<u64>(record, xt::SO_PCB);
        let state = read_record::<i32>(record, xt::INP + inp_len + xt::STATE_AFTER_INP);
        if let (Some(pcb), Some(state)) = (pcb, state) {
            states.insert(pcb, state);
        }
        offset += len;
    }
    states
}

/// TCP states from `net.inet.tcp.pcblist`, skipped when the filter can't match a TCP socket.
fn tcp_states(platform: &PlatformImpl, filter: &ConnectionFilter) -> Result<BTreeMap<u64, i32>> {
    if !filter.wants(AddressFamilies::Inet | AddressFamilies::Inet6, SocketTypes::Stream) {
        return Ok(BTreeMap::new());
    }
    let mib = sysctl::mib_by_name("net.inet.tcp.pcblist")?;
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(net.inet.tcp.pcblist)")?;
    Ok(tcp_states_in(&bytes))
}

/// Sockets among a process's descriptors. TCP sockets take their state from `tcp_states`, matched on the PCB address.
fn connections_in(
    bytes: &[u8], pid: Pid, filter: &ConnectionFilter, tcp_states: &BTreeMap<u64, i32>,
) -> Vec<Connection> {
    file_records(bytes)
        .into_iter()
        .filter(|record| record.fd() >= 0 && record.int(kf::TYPE) == kf::TYPE_SOCKET)
        .filter_map(|record| {
            let family = sockets::family_of(record.int(kf::SOCK_DOMAIN))?;
            let kind = sockets::kind_of(record.int(kf::SOCK_TYPE))?;
            if !filter.matches(family, kind) {
                return None;
            }
            let local = sockets::sockaddr_address(record.sockaddr(kf::SA_LOCAL));
            let remote = sockets::sockaddr_address(record.sockaddr(kf::SA_PEER)).filter(|a| !sockets::is_unset(a));
            let status = if kind == SocketTypes::Stream && family != AddressFamilies::Unix {
                record
                    .sock_pcb()
                    .and_then(|pcb| tcp_states.get(&pcb))
                    .map(|state| ConnectionStatus::from_bsd_tcp_state(*state))
                    .unwrap_or(ConnectionStatus::None)
            } else {
                ConnectionStatus::None
            };
            Some(Connection {
                fd: record.fd(),
                family,
                kind,
                local,
                remote,
                status,
                pid: Some(pid),
            })
        })
        .collect()
}

pub(super) fn connections(platform: &PlatformImpl, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let bytes = filedesc(platform, pid)?;
    let states = tcp_states(platform, &filter)?;
    Ok(connections_in(&bytes, pid, &filter, &states))
}

/// Connections of every process, sharing one TCP table.
pub(super) fn net_connections(platform: &PlatformImpl, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let states = tcp_states(platform, &filter)?;
    super::connections_of_all(platform, |pid| {
        Ok(connections_in(&filedesc(platform, pid)?, pid, &filter, &states))
    })
}

pub(super) fn threads(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ThreadTimes>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID | KERN_PROC_INC_THREAD, pid];
    let bytes = platform.proc_node(pid, &mib, "sysctl(kern.proc.pid, threads)")?;
    Ok(read_records::<libc::kinfo_proc>(&bytes)
        .into_iter()
        .map(|kinfo| ThreadTimes {
            id: kinfo.ki_tid as u64,
            user: timeval_secs(kinfo.ki_rusage.ru_utime.tv_sec as i64, kinfo.ki_rusage.ru_utime.tv_usec as i64),
            system: timeval_secs(kinfo.ki_rusage.ru_stime.tv_sec as i64, kinfo.ki_rusage.ru_stime.tv_usec as i64),
        })
        .collect())
}

pub(super) fn cpu_affinity(platform: &PlatformImpl, pid: Pid) -> Result<Vec<usize>> {
    check_pid(pid)?;
    let mut mask = [0u64; CPU_SET_WORDS];
    // SAFETY: `mask` is valid for `size_of_val(&mask)` bytes of writes.
    let rc = unsafe {
        cpuset_getaffinity(
            CPU_LEVEL_WHICH,
            CPU_WHICH_PID,
            pid as i64,
            std::mem::size_of_val(&mask),
            mask.as_mut_ptr(),
        )
    };
    if rc == -1 {
        return Err(classify(platform, pid, "cpuset_getaffinity", io::Error::last_os_error()));
    }
    Ok(mask
        .iter()
        .enumerate()
        .flat_map(|(i, word)| (0..64).filter(move |bit| word & (1 << bit) != 0).map(move |bit| i * 64 + bit))
        .collect())
}

pub(super) fn set_cpu_affinity(platform: &PlatformImpl, pid: Pid, cpus: &[usize]) -> Result<()> {
    check_pid(pid)?;
    let mut mask = [0u64; CPU_SET_WORDS];
    for cpu in cpus {
        let word = mask.get_mut(cpu / 64).ok_or_else(|| Error::Os {
            syscall: "cpuset_setaffinity".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, format!("CPU {} out of range", cpu)),
        })?;
        *word |= 1 << (cpu % 64);
    }
    // SAFETY: The kernel reads at most `size_of_val(&mask)` bytes from `mask`.
    let rc = unsafe {
        cpuset_setaffinity(
            CPU_LEVEL_WHICH,
            CPU_WHICH_PID,
            pid as i64,
            std::mem::size_of_val(&mask),
            mask.as_ptr(),
        )
    };
    if rc == -1 {
        return Err(classify(platform, pid, "cpuset_setaffinity", io::Error::last_os_error()));
    }
    Ok(())
}

pub(super) fn rlimit(platform: &PlatformImpl, pid: Pid, resource: Resource) -> Result<ResourceLimit> {
    check_pid(pid)?;
    let which = match resource {
        Resource::AddressSpace => libc::RLIMIT_AS,
        Resource::CoreFileSize => libc::RLIMIT_CORE,
        Resource::CpuTime => libc::RLIMIT_CPU,
        Resource::DataSize => libc::RLIMIT_DATA,
        Resource::FileSize => libc::RLIMIT_FSIZE,
        Resource::LockedMemory => libc::RLIMIT_MEMLOCK,
        Resource::OpenFiles => libc::RLIMIT_NOFILE,
        Resource::Processes => libc::RLIMIT_NPROC,
        Resource::ResidentSet => libc::RLIMIT_RSS,
        Resource::StackSize => libc::RLIMIT_STACK,
        other => return Err(Error::unsupported(format!("proc_rlimit({:?})", other))),
    };
    let mib = [libc::CTL_KERN, libc::KERN_PROC, KERN_PROC_RLIMIT, pid, which as c_int];
    let limit: libc::rlimit = sysctl::value(&mib, "sysctl(kern.proc.rlimit)").classify_for(platform, pid)?;
    let finite = |value: libc::rlim_t| (value != libc::RLIM_INFINITY).then_some(value as u64);
    Ok(ResourceLimit {
        soft: finite(limit.rlim_cur),
        hard: finite(limit.rlim_max),
    })
}

fn times_from_ticks(ticks: &[u64], clock_ticks: f64) -> CpuTimes {
    let secs = |state: usize| ticks.get(state).copied().unwrap_or(0) as f64 / clock_ticks;
    CpuTimes {
        user: secs(0),
        nice: Some(secs(1)),
        system: secs(2),
        interrupt: Some(secs(3)),
        idle: secs(4),
        ..Default::default()
    }
}

fn ticks_by_name(name: &str, platform: &PlatformImpl) -> Result<Vec<u64>> {
    let mib = sysctl::mib_by_name(name)?;
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, name)?;
    Ok(read_records::<c_long>(&bytes).into_iter().map(|tick| tick.max(0) as u64).collect())
}

pub(super) fn cpu_times(platform: &PlatformImpl) -> Result<CpuTimes> {
    Ok(times_from_ticks(&ticks_by_name("kern.cp_time", platform)?, platform.clock_ticks))
}

pub(super) fn per_cpu_times(platform: &PlatformImpl) -> Result<Vec<CpuTimes>> {
    let ticks = ticks_by_name("kern.cp_times", platform)?;
    // The table covers every CPU slot the kernel was built for, not only the present ones.
    let mut per_cpu = split_cpu_ticks(&ticks, CPUSTATES, |cpu| times_from_ticks(cpu, platform.clock_ticks));
    per_cpu.truncate(logical_cpus()?);
    Ok(per_cpu)
}

pub(super) fn cpu_count_cores() -> Result<usize> {
    Ok(sysctl::value_by_name::<c_int>("kern.smp.cores")?.max(1) as usize)
}

pub(super) fn cpu_stats() -> Result<CpuStats> {
    let counter = |name: &str| sysctl::value_by_name::<u32>(name).map(u64::from);
    Ok(CpuStats {
        ctx_switches: counter("vm.stats.sys.v_swtch")?,
        interrupts: counter("vm.stats.sys.v_intr")?,
        soft_interrupts: counter("vm.stats.sys.v_soft")?,
        syscalls: counter("vm.stats.sys.v_syscall")?,
    })
}

/// Lowest and highest frequency in a `freq_levels` list such as `2400/-1 2100/-1 1800/-1`.
fn freq_bounds(levels: &str) -> (f64, f64) {
    let freqs = levels
        .split_whitespace()
        .filter_map(|level| level.split('/').next()?.parse::<f64>().ok())
        .collect::<Vec<_>>();
    let min = freqs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = freqs.iter().copied().fold(0.0, f64::max);
    (if min.is_finite() { min } else { 0.0 }, max)
}

pub(super) fn cpu_freq(platform: &PlatformImpl) -> Result<CpuFreq> {
    let current = sysctl::value_by_name::<c_int>("dev.cpu.0.freq")?;
    let levels = sysctl::mib_by_name("dev.cpu.0.freq_levels")
        .and_then(|mib| sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(dev.cpu.0.freq_levels)"))
        .map(|bytes| trim_nul(&bytes))
        .unwrap_or_default();
    let (min, max) = freq_bounds(&levels);
    Ok(CpuFreq {
        current: current as f64,
        min,
        max,
    })
}

/// Page counters from `vm.stats.vm`, converted to bytes.
struct PageCounts {
    active: u64,
    inactive: u64,
    laundry: u64,
    wired: u64,
    cached: u64,
    free: u64,
}

fn memory_from_counts(total: u64, pages: &PageCounts, buffers: u64) -> VirtualMemory {
    VirtualMemory {
        total,
        available: pages.inactive + pages.laundry + pages.cached + pages.free,
        used: pages.active + pages.wired,
        free: pages.free,
        active: Some(pages.active),
        inactive: Some(pages.inactive),
        wired: Some(pages.wired),
        cached: Some(pages.cached),
        buffers: Some(buffers),
        ..Default::default()
    }
}

pub(super) fn virtual_memory(platform: &PlatformImpl) -> Result<VirtualMemory> {
    let bytes = |name: &str| sysctl::value_by_name::<u32>(name).map(|count| count as u64 * platform.page_size);
    // Laundry pages exist since FreeBSD 11.1, the cache queue went away in 12.
    let optional = |name: &str| match bytes(name) {
        Err(e) if e.kind() == ErrorKind::Unsupported => Ok(0),
        other => other,
    };

    let pages = PageCounts {
        active: bytes("vm.stats.vm.v_active_count")?,
        inactive: bytes("vm.stats.vm.v_inactive_count")?,
        laundry: optional("vm.stats.vm.v_laundry_count")?,
        wired: bytes("vm.stats.vm.v_wire_count")?,
        cached: optional("vm.stats.vm.v_cache_count")?,
        free: bytes("vm.stats.vm.v_free_count")?,
    };
    let total = sysctl::value_by_name::<libc::c_ulong>("hw.physmem")? as u64;
    let buffers = sysctl::value_by_name::<c_long>("vfs.bufspace")?.max(0) as u64;
    Ok(memory_from_counts(total, &pages, buffers))
}

/// A `libkvm` descriptor opened on `/dev/null`, which is enough for the swap statistics. Closed on drop.
struct Kvm(*mut libc::kvm_t);

impl Kvm {
    fn open() -> Result<Self> {
        let mut errbuf = [0 as c_char; 2048];
        // SAFETY: The path is NUL terminated and `errbuf` has `_POSIX2_LINE_MAX` bytes of room.
        let kd = unsafe {
            libc::kvm_openfiles(
                std::ptr::null(),
                b"/dev/null\0".as_ptr() as *const c_char,
                std::ptr::null(),
                libc::O_RDONLY,
                errbuf.as_mut_ptr(),
            )
        };
        if kd.is_null() {
            return Err(Error::Os {
                syscall: "kvm_openfiles".to_string(),
                source: io::Error::new(io::ErrorKind::Other, posix::c_chars_to_string(&errbuf)),
            });
        }
        Ok(Self(kd))
    }
}

impl Drop for Kvm {
    fn drop(&mut self) {
        // SAFETY: The descriptor came from `kvm_openfiles` and is closed exactly once.
        unsafe { libc::kvm_close(self.0) };
    }
}

pub(super) fn swap_memory(platform: &PlatformImpl) -> Result<SwapMemory> {
    let kvm = Kvm::open()?;
    // SAFETY: `kvm_swap` is plain old data.
    let mut total: libc::kvm_swap = unsafe { std::mem::zeroed() };
    // SAFETY: A single entry asks for the system-wide totals, and `total` has room for it.
    if unsafe { libc::kvm_getswapinfo(kvm.0, &mut total, 1, 0) } < 0 {
        return Err(Error::Os {
            syscall: "kvm_getswapinfo".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "kvm_getswapinfo failed"),
        });
    }

    let page = platform.page_size;
    let pages_in = sysctl::value_by_name::<u32>("vm.stats.vm.v_swappgsin")? as u64;
    let pages_out = sysctl::value_by_name::<u32>("vm.stats.vm.v_swappgsout")? as u64;
    let total_bytes = total.ksw_total as u64 * page;
    let used = total.ksw_used as u64 * page;
    Ok(SwapMemory {
        total: total_bytes,
        used,
        free: total_bytes.saturating_sub(used),
        sin: pages_in * page,
        sout: pages_out * page,
    })
}

/// `struct bintime`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct Bintime {
    sec: i64,
    frac: u64,
}

impl Bintime {
    fn millis(&self) -> u64 {
        let fraction = ((self.frac >> 32) * 1000) >> 32;
        self.sec.max(0) as u64 * 1000 + fraction
    }
}

/// `struct devstat` (`DEVSTAT_VERSION` 6).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(dead_code)]
struct Devstat {
    sequence0: u32,
    allocated: c_int,
    start_count: u32,
    end_count: u32,
    busy_from: Bintime,
    dev_links: u64,
    device_number: u32,
    device_name: [u8; 16],
    unit_number: c_int,
    bytes: [u64; 4],
    operations: [u64; 4],
    duration: [Bintime; 4],
    busy_time: Bintime,
    creation_time: Bintime,
    block_size: u32,
    tag_types: [u64; 3],
    flags: c_int,
    device_type: c_int,
    priority: c_int,
    id: u64,
    sequence1: u32,
}

const DEVSTAT_READ: usize = 1;
const DEVSTAT_WRITE: usize = 2;

/// Parses `kern.devstat.all`: a generation number followed by one `devstat` per device.
fn parse_devstats(bytes: &[u8]) -> BTreeMap<String, DiskIoCounters> {
    let records = bytes.get(std::mem::size_of::<c_long>()..).unwrap_or_default();
    read_records::<Devstat>(records)
        .into_iter()
        .map(|stat| {
            let name = format!("{}{}", trim_nul(&stat.device_name), stat.unit_number);
            let counters = DiskIoCounters {
                read_count: stat.operations[DEVSTAT_READ],
                write_count: stat.operations[DEVSTAT_WRITE],
                read_bytes: stat.bytes[DEVSTAT_READ],
                write_bytes: stat.bytes[DEVSTAT_WRITE],
                read_time: stat.duration[DEVSTAT_READ].millis(),
                write_time: stat.duration[DEVSTAT_WRITE].millis(),
                busy_time: Some(stat.busy_time.millis()),
            };
            (name, counters)
        })
        .collect()
}

pub(super) fn disk_io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, DiskIoCounters>> {
    let mib = sysctl::mib_by_name("kern.devstat.all")?;
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(kern.devstat.all)")?;
    Ok(parse_devstats(&bytes))
}

/// Interface counters, without the USB bus pseudo-interfaces (`usbus0`, ...).
pub(super) fn net_io_counters() -> Result<BTreeMap<String, NetIoCounters>> {
    let mut counters = bsdlike::ifnet::io_counters()?;
    counters.retain(|name, _| !name.starts_with("usbus"));
    Ok(counters)
}

pub(super) fn users() -> Result<Vec<User>> {
    posix::utmpx::users()
}

fn battery_from(percent: c_int, minutes: c_int, acline: Option<c_int>) -> Battery {
    let power_plugged = acline.map(|line| line == 1);
    let secs_left = if power_plugged == Some(true) {
        BatteryTime::Unlimited
    } else if minutes < 0 {
        BatteryTime::Unknown
    } else {
        BatteryTime::Seconds(minutes as u64 * 60)
    };
    Battery {
        percent: percent.clamp(0, 100) as f64,
        secs_left,
        power_plugged,
    }
}

/// Battery status from the ACPI nodes. Machines without a battery don't have them.
pub(super) fn battery() -> Result<Option<Battery>> {
    let percent = match sysctl::value_by_name::<c_int>("hw.acpi.battery.life") {
        Ok(percent) => percent,
        Err(e) if e.kind() == ErrorKind::Unsupported => return Ok(None),
        Err(e) => return Err(e),
    };
    let minutes = sysctl::value_by_name::<c_int>("hw.acpi.battery.time")?;
    let acline = sysctl::value_by_name::<c_int>("hw.acpi.acline").ok();
    Ok(Some(battery_from(percent, minutes, acline)))
}

/// `IK` sysctl values are tenths of a kelvin.
fn decikelvin_to_celsius(value: c_int) -> f64 {
    (value - 2731) as f64 / 10.0
}

/// Per-core temperatures from `coretemp(4)` or `amdtemp(4)`.
pub(super) fn temperatures() -> Result<Temperatures> {
    let mut readings = Vec::new();
    for cpu in 0..logical_cpus()? {
        let current = match sysctl::value_by_name::<c_int>(&format!("dev.cpu.{}.temperature", cpu)) {
            Ok(value) => value,
            Err(e) if e.kind() == ErrorKind::Unsupported => break,
            Err(e) => return Err(e),
        };
        let high = sysctl::value_by_name::<c_int>(&format!("dev.cpu.{}.coretemp.tjmax", cpu))
            .ok()
            .map(decikelvin_to_celsius);
        readings.push(Temperature {
            label: format!("Core {}", cpu),
            current: decikelvin_to_celsius(current),
            high,
            critical: high,
        });
    }

    if readings.is_empty() {
        return Err(Error::unsupported("sensors_temperatures"));
    }
    Ok(BTreeMap::from([("coretemp".to_string(), readings)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingContext;

    fn file_record(fd: i32, kind: i32, vnode_type: i32, path: &str) -> Vec<u8> {
        let mut record = vec![0u8; kf::PATH + path.len() + 1];
        let size = record.len() as i32;
        record[kf::STRUCTSIZE..4].copy_from_slice(&size.to_ne_bytes());
        record[kf::TYPE..kf::TYPE + 4].copy_from_slice(&kind.to_ne_bytes());
        record[kf::FD..kf::FD + 4].copy_from_slice(&fd.to_ne_bytes());
        record[kf::VNODE_TYPE..kf::VNODE_TYPE + 4].copy_from_slice(&vnode_type.to_ne_bytes());
        record[kf::PATH..kf::PATH + path.len()].copy_from_slice(path.as_bytes());
        record
    }

    fn socket_record(fd: i32, domain: i32, kind: i32, local: &[u8], peer: &[u8]) -> Vec<u8> {
        let mut record = file_record(fd, kf::TYPE_SOCKET, 0, "");
        record[kf::SOCK_DOMAIN..kf::SOCK_DOMAIN + 4].copy_from_slice(&domain.to_ne_bytes());
        record[kf::SOCK_TYPE..kf::SOCK_TYPE + 4].copy_from_slice(&kind.to_ne_bytes());
        record[kf::SA_LOCAL..kf::SA_LOCAL + local.len()].copy_from_slice(local);
        record[kf::SA_PEER..kf::SA_PEER + peer.len()].copy_from_slice(peer);
        record
    }

    #[test]
    fn descriptor_table() {
        let mut table = file_record(kf::FD_TYPE_CWD, kf::TYPE_VNODE, 2, "/home/user");
        table.extend(file_record(3, kf::TYPE_VNODE, kf::VTYPE_VREG, "/var/log/messages"));
        table.extend(file_record(4, kf::TYPE_VNODE, 2, "/tmp"));

        let records = file_records(&table);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].path(), "/home/user");

        let files = open_files_in(&table);
        assert_eq!(
            files,
            vec![OpenFile {
                path: "/var/log/messages".to_string(),
                fd: 3,
            }]
        );
    }

    fn with_pcb(mut record: Vec<u8>, pcb: u64) -> Vec<u8> {
        record[kf::SOCK_PCB..kf::SOCK_PCB + 8].copy_from_slice(&pcb.to_ne_bytes());
        record
    }

    /// A `net.inet.tcp.pcblist` answer holding one record per `(pcb, state)`.
    fn pcblist(entries: &[(u64, i32)]) -> Vec<u8> {
        const XINPGEN: usize = 64;
        const XINPCB: usize = 400;
        let mut bytes = vec![0u8; XINPGEN];
        bytes[..8].copy_from_slice(&(XINPGEN as u64).to_ne_bytes());
        for (pcb, state) in entries {
            let mut record = vec![0u8; xt::INP + XINPCB + xt::STATE_AFTER_INP + 64];
            let len = record.len() as u64;
            record[xt::LEN..xt::LEN + 8].copy_from_slice(&len.to_ne_bytes());
            record[xt::INP..xt::INP + 8].copy_from_slice(&(XINPCB as u64).to_ne_bytes());
            record[xt::SO_PCB..xt::SO_PCB + 8].copy_from_slice(&pcb.to_ne_bytes());
            let at = xt::INP + XINPCB + xt::STATE_AFTER_INP;
            record[at..at + 4].copy_from_slice(&state.to_ne_bytes());
            bytes.extend(record);
        }
        let trailer = bytes[..XINPGEN].to_vec();
        bytes.extend(trailer);
        bytes
    }

    #[test]
    fn socket_descriptors() {
        let local = [16, libc::AF_INET as u8, 0, 22, 10, 0, 0, 1];
        let peer = [16, libc::AF_INET as u8, 0xc3, 0x50, 10, 0, 0, 2];
        let mut table = with_pcb(socket_record(5, libc::AF_INET, libc::SOCK_STREAM, &local, &peer), 0xfffff800_0a1b2c00);
        table.extend(socket_record(6, libc::AF_INET, libc::SOCK_DGRAM, &local, &[]));
        let states = tcp_states_in(&pcblist(&[(0xfffff800_0a1b2c00, 4)]));

        let all = connections_in(&table, 42, &ConnectionFilter::all(), &states);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].local, Some(Address::Inet("10.0.0.1:22".parse().unwrap())));
        assert_eq!(all[0].remote, Some(Address::Inet("10.0.0.2:50000".parse().unwrap())));
        assert_eq!(all[0].status, ConnectionStatus::Established);
        assert_eq!(all[0].pid, Some(42));
        assert_eq!(all[1].remote, None);
        assert_eq!(all[1].status, ConnectionStatus::None);

        let tcp = connections_in(&table, 42, &"tcp".parse().unwrap(), &states);
        assert_eq!(tcp.len(), 1);
        assert_eq!(tcp[0].fd, 5);
    }

    #[test]
    fn tcp_states_by_pcb() {
        let states = tcp_states_in(&pcblist(&[(0x1000, 1), (0x2000, 10)]));
        assert_eq!(states, BTreeMap::from([(0x1000, 1), (0x2000, 10)]));

        let listening = with_pcb(socket_record(3, libc::AF_INET6, libc::SOCK_STREAM, &[], &[]), 0x1000);
        let unknown = with_pcb(socket_record(4, libc::AF_INET6, libc::SOCK_STREAM, &[], &[]), 0x3000);
        let mut table = listening;
        table.extend(unknown);
        let found = connections_in(&table, 1, &ConnectionFilter::all(), &states);
        assert_eq!(found[0].status, ConnectionStatus::Listen);
        assert_eq!(found[1].status, ConnectionStatus::None);

        assert!(tcp_states_in(&[]).is_empty());
        assert!(tcp_states_in(&pcblist(&[])).is_empty());
        // A record cut short by the buffer ends the walk.
        let full = pcblist(&[(0x1000, 1)]);
        assert!(tcp_states_in(&full[..100]).is_empty());
    }

    #[test]
    fn truncated_descriptor_table() {
        let table = file_record(3, kf::TYPE_VNODE, kf::VTYPE_VREG, "/etc/passwd");
        assert_eq!(file_records(&table[..2]).len(), 0);
        assert_eq!(file_records(&[0; 8]).len(), 0);
    }

    #[test]
    fn frequency_levels() {
        assert_eq!(freq_bounds("2400/-1 2100/-1 1800/-1 600/-1"), (600.0, 2400.0));
        assert_eq!(freq_bounds(""), (0.0, 0.0));
    }

    #[test]
    fn battery_states() {
        assert_eq!(battery_from(80, 90, Some(0)).secs_left, BatteryTime::Seconds(5400));
        assert_eq!(battery_from(80, -1, Some(1)).secs_left, BatteryTime::Unlimited);
        assert_eq!(battery_from(80, -1, None).secs_left, BatteryTime::Unknown);
        assert_eq!(battery_from(120, 0, None).percent, 100.0);
    }

    #[test]
    fn temperature_units() {
        assert_eq!(decikelvin_to_celsius(3231), 50.0);
    }

    #[test]
    fn bintime_millis() {
        let half_second = Bintime {
            sec: 2,
            frac: 1 << 63,
        };
        assert_eq!(half_second.millis(), 2500);
    }

    #[test]
    fn devstat_layout() {
        assert_eq!(std::mem::size_of::<Devstat>(), 288);
    }

    #[test]
    fn memory_accounting() {
        let pages = PageCounts {
            active: 100,
            inactive: 50,
            laundry: 5,
            wired: 20,
            cached: 0,
            free: 30,
        };
        let memory = memory_from_counts(400, &pages, 7);
        assert_eq!(memory.available, 85);
        assert_eq!(memory.used, 120);
        assert_eq!(memory.buffers, Some(7));
    }

    #[test]
    fn own_descriptors() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        let pid = std::process::id() as Pid;
        assert!(num_fds(&platform, pid).unwrap() >= 3);
        assert!(!cwd(&platform, pid).unwrap().is_empty());
        assert!(!cmdline(&platform, pid).unwrap().is_empty());
    }
}
