use libc::c_int;
use mach2::{
    kern_return::KERN_SUCCESS,
    traps::mach_task_self,
    vm::mach_vm_deallocate,
};

use super::{ffi, kern_error, HostPort, PlatformImpl};
use crate::{
    error::Result,
    platform::bsdlike::sysctl,
    types::{CpuFreq, CpuTimes},
};

fn times_from_ticks(ticks: &[u32], clock_ticks: f64) -> CpuTimes {
    let secs = |state: usize| ticks.get(state).copied().unwrap_or(0) as f64 / clock_ticks;
    CpuTimes {
        user: secs(ffi::CPU_STATE_USER),
        system: secs(ffi::CPU_STATE_SYSTEM),
        idle: secs(ffi::CPU_STATE_IDLE),
        nice: Some(secs(ffi::CPU_STATE_NICE)),
        ..Default::default()
    }
}

pub(super) fn times(platform: &PlatformImpl) -> Result<CpuTimes> {
    let info: ffi::host_cpu_load_info =
        HostPort::new().statistics(ffi::HOST_CPU_LOAD_INFO, "host_statistics(HOST_CPU_LOAD_INFO)")?;
    Ok(times_from_ticks(&info.cpu_ticks, platform.clock_ticks))
}

/// The per-processor array handed out by `host_processor_info`, released on drop.
struct ProcessorInfo {
    ptr: *mut c_int,
    len: usize,
}

impl ProcessorInfo {
    fn as_slice(&self) -> &[c_int] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: The kernel mapped `len` integers at `ptr`, and they stay mapped until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ProcessorInfo {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: The region was allocated in our task by `host_processor_info`.
        unsafe {
            mach_vm_deallocate(
                mach_task_self(),
                self.ptr as u64,
                (self.len * std::mem::size_of::<c_int>()) as u64,
            );
        }
    }
}

pub(super) fn per_cpu_times(platform: &PlatformImpl) -> Result<Vec<CpuTimes>> {
    let host = HostPort::new();
    let mut cpu_count = 0u32;
    let mut info = ProcessorInfo {
        ptr: std::ptr::null_mut(),
        len: 0,
    };
    let mut info_count = 0u32;
    // SAFETY: Every out pointer is valid for writes.
    let rc = unsafe {
        ffi::host_processor_info(
            host.0,
            ffi::PROCESSOR_CPU_LOAD_INFO,
            &mut cpu_count,
            &mut info.ptr,
            &mut info_count,
        )
    };
    info.len = info_count as usize;
    if rc != KERN_SUCCESS {
        return Err(kern_error("host_processor_info(PROCESSOR_CPU_LOAD_INFO)", rc));
    }

    let ticks = info
        .as_slice()
        .iter()
        .map(|tick| *tick as u32)
        .collect::<Vec<_>>();
    Ok(ticks
        .chunks_exact(ffi::CPU_STATE_MAX)
        .take(cpu_count as usize)
        .map(|cpu| times_from_ticks(cpu, platform.clock_ticks))
        .collect())
}

/// Frequencies from `hw.cpufrequency*`, which Apple silicon doesn't publish.
pub(super) fn freq() -> Result<CpuFreq> {
    let current = sysctl::value_by_name::<u64>("hw.cpufrequency")?;
    let min = sysctl::value_by_name::<u64>("hw.cpufrequency_min").unwrap_or(0);
    let max = sysctl::value_by_name::<u64>("hw.cpufrequency_max").unwrap_or(0);
    Ok(CpuFreq {
        current: current as f64 / 1_000_000.0,
        min: min as f64 / 1_000_000.0,
        max: max as f64 / 1_000_000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::BindingContext, platform::Platform as _};

    #[test]
    fn tick_conversion() {
        let times = times_from_ticks(&[200, 100, 1000, 50], 100.0);
        assert_eq!(times.user, 2.0);
        assert_eq!(times.system, 1.0);
        assert_eq!(times.idle, 10.0);
        assert_eq!(times.nice, Some(0.5));
        assert_eq!(times.iowait, None);
    }

    #[test]
    fn one_entry_per_logical_cpu() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        let per_cpu = per_cpu_times(&platform).unwrap();
        assert_eq!(per_cpu.len(), platform.cpu_count_logical().unwrap());
        assert!(times(&platform).unwrap().idle > 0.0);
    }
}
