//! System-wide queries against the running kernel.

#![cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd", target_os = "windows"))]

use std::{path::Path, thread, time::Duration};

use sysprobe::{BindingContext, Platform as _, Probe};

fn probe() -> Probe {
    Probe::new(BindingContext::default())
}

#[test]
fn cpu_times_never_go_backwards() {
    let probe = probe();
    let first = probe.cpu_times().unwrap();
    thread::sleep(Duration::from_millis(100));
    let second = probe.cpu_times().unwrap();

    for value in [second.user, second.system, second.idle] {
        assert!(value >= 0.0);
    }
    assert!(second.idle >= first.idle);
    assert!(second.user >= first.user);
    assert!(second.system >= first.system);
}

#[test]
fn per_cpu_times_match_logical_count() {
    let probe = probe();
    let logical = probe.cpu_count_logical().unwrap();
    assert!(logical >= 1);
    assert!(!probe.per_cpu_times().unwrap().is_empty());
    if let Ok(cores) = probe.cpu_count_cores() {
        assert!(cores >= 1 && cores <= logical);
    }
}

#[test]
fn memory_is_consistent() {
    let probe = probe();
    let memory = probe.virtual_memory().unwrap();
    assert!(memory.total > 0);
    assert!(memory.available <= memory.total);
    assert!(memory.used <= memory.total);
    let percent = memory.percent();
    assert!((0.0..=100.0).contains(&percent));

    let swap = probe.swap_memory().unwrap();
    assert!(swap.used <= swap.total);
}

#[test]
fn boot_time_is_in_the_past() {
    let probe = probe();
    let boot_time = probe.boot_time().unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    assert!(boot_time > 0.0 && boot_time < now);
}

#[test]
fn root_partition_is_mounted() {
    let probe = probe();
    let root = if cfg!(windows) { "C:\\" } else { "/" };
    let partitions = probe.disk_partitions(true).unwrap();
    let partition = partitions
        .iter()
        .find(|p| p.mountpoint == root)
        .unwrap_or_else(|| panic!("{} not among {:?}", root, partitions));

    let opts = partition.opts.split(',').collect::<Vec<_>>();
    assert_eq!(opts.iter().filter(|opt| **opt == "ro" || **opt == "rw").count(), 1);

    let usage = probe.disk_usage(Path::new(root)).unwrap();
    assert!(usage.total > 0);
    assert!(usage.used <= usage.total);
}

#[test]
fn net_counters_never_go_backwards() {
    let probe = probe();
    let first = probe.net_io_counters().unwrap();
    let second = probe.net_io_counters().unwrap();
    for (name, before) in &first {
        if let Some(after) = second.get(name) {
            assert!(after.bytes_recv >= before.bytes_recv);
            assert!(after.packets_sent >= before.packets_sent);
        }
    }
    // `usbus*` pseudo interfaces are never reported.
    assert!(first.keys().all(|name| !name.starts_with("usbus")));
}

#[test]
#[cfg(unix)]
fn loopback_interface_is_listed() {
    let probe = probe();
    let stats = probe.net_if_stats().unwrap();
    let loopback = stats.iter().find(|(name, _)| name.starts_with("lo")).map(|(_, stats)| stats).unwrap();
    assert!(loopback.mtu > 0);
    assert!(loopback.flags.contains("loopback"));
}

#[test]
fn load_average_is_non_negative() {
    let probe = probe();
    let load = probe.load_avg().unwrap();
    assert!(load.one >= 0.0 && load.five >= 0.0 && load.fifteen >= 0.0);
}
