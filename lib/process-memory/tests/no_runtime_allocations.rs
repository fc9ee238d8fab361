//! Allocation checks for `Querier`.
//!
//! This lives in an integration test since it swaps the global allocator, which would skew every other test in the
//! crate.

use dhat::{HeapStats, Profiler};
use process_memory::{Querier, Target};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[test]
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn repeated_rss_queries_do_not_allocate() {
    let mut querier = Querier::new(Target::Current);

    let _profiler = Profiler::builder().testing().build();
    for _ in 0..3 {
        assert!(querier.resident_set_size().is_some());
    }
    let stats = HeapStats::get();

    dhat::assert_eq!(stats.total_blocks, 0);
    dhat::assert_eq!(stats.total_bytes, 0);
    dhat::assert_eq!(stats.curr_blocks, 0);
}

#[test]
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn footprint_of_own_pid_matches_current() {
    let pid = std::process::id() as i32;
    let by_pid = Querier::new(Target::Pid(pid)).footprint().unwrap();
    let current = Querier::new(Target::Current).footprint().unwrap();

    assert!(by_pid.rss > 0);
    assert_eq!(by_pid.uss.is_some(), current.uss.is_some());
    if let Some(uss) = by_pid.uss {
        assert!(uss <= by_pid.rss);
    }
}
