//! Per-process queries against live processes: our own, a synthetic missing one, and (where detectable) a zombie child.

#![cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "windows"
))]

use std::{
    collections::BTreeMap,
    net::{TcpListener, UdpSocket},
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use sysprobe::{BindingContext, ErrorKind, Pid, Platform as _, Probe};

/// Large enough to be above any real PID limit.
const MISSING_PID: Pid = 99_999_999;

fn probe() -> Probe {
    Probe::new(BindingContext::default())
}

fn own_pid() -> Pid {
    std::process::id() as Pid
}

/// Some tests compare descriptor counts of the whole test process, so every test here takes its turn.
static DESCRIPTORS: Mutex<()> = Mutex::new(());

fn descriptors_lock() -> MutexGuard<'static, ()> {
    DESCRIPTORS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn own_process_is_consistent() {
    let _lock = descriptors_lock();
    let probe = probe();
    let pid = own_pid();

    assert!(probe.pid_exists(pid).unwrap());
    assert!(probe.pids().unwrap().contains(&pid));
    assert!(!probe.proc_name(pid).unwrap().is_empty());

    let memory = probe.proc_memory_info(pid).unwrap();
    assert!(memory.rss > 0);
    assert!(memory.vms >= memory.rss);

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64();
    let created = probe.proc_create_time(pid).unwrap();
    // Creation time is derived from clock ticks on some platforms, so allow for rounding.
    assert!(created <= now + 1.0);
    assert!(created > 0.0);

    assert!(probe.proc_num_threads(pid).unwrap() >= 1);
    let times = probe.proc_cpu_times(pid).unwrap();
    assert!(times.user >= 0.0 && times.system >= 0.0);
    assert!(probe.proc_ppid(pid).unwrap() > 0);
}

#[test]
fn missing_process_is_not_found() {
    let _lock = descriptors_lock();
    let probe = probe();

    assert!(!probe.pid_exists(MISSING_PID).unwrap());
    assert_eq!(probe.proc_name(MISSING_PID).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(probe.proc_memory_info(MISSING_PID).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(probe.proc_cpu_times(MISSING_PID).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn negative_pid_is_not_found() {
    let _lock = descriptors_lock();
    let probe = probe();
    assert!(!probe.pid_exists(-1).unwrap());
    assert_eq!(probe.proc_name(-1).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn reaped_child_is_not_found() {
    let _lock = descriptors_lock();
    let probe = probe();
    let mut child = if cfg!(windows) {
        std::process::Command::new("cmd").args(["/C", "exit"]).spawn().unwrap()
    } else {
        std::process::Command::new("true").spawn().unwrap()
    };
    let pid = child.id() as Pid;
    child.wait().unwrap();

    // The PID could be reused right away, but not within this test on any sane system.
    assert_eq!(probe.proc_name(pid).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
#[cfg(not(any(target_os = "openbsd", target_os = "netbsd")))]
fn opened_files_are_reported() {
    let _lock = descriptors_lock();
    let probe = probe();
    let pid = own_pid();

    let dir = tempfile::tempdir().unwrap();
    let open_before = probe.proc_open_files(pid).unwrap().len();
    let fds_before = probe.proc_num_fds(pid).unwrap();

    let names = ["sysprobe-open-first", "sysprobe-open-second"];
    let files = names
        .iter()
        .map(|name| std::fs::File::create(dir.path().join(name)).unwrap())
        .collect::<Vec<_>>();

    // Compare by file name: temporary directories are often reached through symlinks or short names.
    let open = probe.proc_open_files(pid).unwrap();
    for name in names {
        assert!(
            open.iter().any(|file| file.path.ends_with(name)),
            "{} not among {:?}",
            name,
            open
        );
    }
    assert_eq!(open.len(), open_before + 2, "{:?}", open);
    assert_eq!(probe.proc_num_fds(pid).unwrap(), fds_before + 2);

    drop(files);
    assert_eq!(probe.proc_open_files(pid).unwrap().len(), open_before);
    assert_eq!(probe.proc_num_fds(pid).unwrap(), fds_before);
}

#[test]
fn sockets_are_reported_and_filtered() {
    let _lock = descriptors_lock();
    let probe = probe();
    let pid = own_pid();

    let filters = ["all", "inet", "tcp", "tcp4", "tcp6", "udp", "udp4", "udp6", "unix"];
    let counts = || {
        filters
            .iter()
            .map(|filter| {
                let connections = probe.proc_connections(pid, filter.parse().unwrap()).unwrap();
                (*filter, connections.len())
            })
            .collect::<BTreeMap<_, _>>()
    };
    let before = counts();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let tcp_addr = listener.local_addr().unwrap();
    let udp_addr = udp.local_addr().unwrap();
    #[cfg(unix)]
    let dir = tempfile::tempdir().unwrap();
    #[cfg(unix)]
    let _unix = std::os::unix::net::UnixListener::bind(dir.path().join("listener.sock")).unwrap();
    let unix_sockets = if cfg!(unix) { 1 } else { 0 };

    let after = counts();
    let delta = |filter: &str| after[filter] - before[filter];
    assert_eq!(delta("all"), 2 + unix_sockets, "before {:?}, after {:?}", before, after);
    assert_eq!(delta("inet"), 2);
    assert_eq!(delta("tcp"), 1);
    assert_eq!(delta("tcp4"), 1);
    assert_eq!(delta("tcp6"), 0);
    assert_eq!(delta("udp"), 1);
    assert_eq!(delta("udp4"), 1);
    assert_eq!(delta("udp6"), 0);
    assert_eq!(delta("unix"), unix_sockets);

    let find = |filter: &str, addr| {
        probe
            .proc_connections(pid, filter.parse().unwrap())
            .unwrap()
            .into_iter()
            .find(|conn| conn.local == Some(sysprobe::Address::Inet(addr)))
    };
    assert!(find("udp4", udp_addr).is_some());
    assert!(find("udp4", tcp_addr).is_none());
    let listening = find("tcp4", tcp_addr).unwrap();
    assert_eq!(listening.status, sysprobe::ConnectionStatus::Listen);
}

#[test]
#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
fn zombie_child_is_classified() {
    let _lock = descriptors_lock();
    use std::time::{Duration, Instant};

    let probe = probe();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as Pid;

    // Not waiting on the child leaves it a zombie once it exits.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe.proc_is_zombie(pid).unwrap() {
        assert!(Instant::now() < deadline, "child never became a zombie");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(probe.pid_exists(pid).unwrap());
    assert!(probe.pids().unwrap().contains(&pid));
    assert_eq!(probe.proc_status(pid).unwrap(), sysprobe::ProcessStatus::Zombie);
    assert_eq!(probe.proc_ppid(pid).unwrap(), own_pid());
    // Where the kernel drops the address space of a zombie, queries that need it say so.
    if cfg!(any(target_os = "linux", target_os = "macos")) {
        assert_eq!(probe.proc_exe(pid).unwrap_err().kind(), ErrorKind::ZombieProcess);
        assert_eq!(probe.proc_cwd(pid).unwrap_err().kind(), ErrorKind::ZombieProcess);
    }

    child.wait().unwrap();
}
