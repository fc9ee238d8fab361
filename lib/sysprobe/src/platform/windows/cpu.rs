use std::{ffi::c_void, io};

use windows_sys::Win32::{
    Foundation::{ERROR_INSUFFICIENT_BUFFER, FILETIME},
    System::{
        Power::{CallNtPowerInformation, ProcessorInformation},
        SystemInformation::{GetLogicalProcessorInformationEx, RelationProcessorCore, SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX},
        Threading::{GetActiveProcessorCount, GetSystemTimes, ALL_PROCESSOR_GROUPS},
    },
};

use super::{ffi, filetime_ticks, grow_aligned, nt_error, query_system_information, ticks_to_secs, PlatformImpl};
use crate::{
    buffer::{read_record, read_records, Fill},
    error::{Error, Result},
    types::{CpuFreq, CpuStats, CpuTimes},
};

pub(super) fn times() -> Result<CpuTimes> {
    let zero = FILETIME { dwLowDateTime: 0, dwHighDateTime: 0 };
    let (mut idle, mut kernel, mut user) = (zero, zero, zero);
    // SAFETY: All three are valid for writes.
    if unsafe { GetSystemTimes(&mut idle, &mut kernel, &mut user) } == 0 {
        return Err(Error::last_os_error("GetSystemTimes"));
    }

    // Kernel time includes idle time.
    let (idle, kernel, user) = (filetime_ticks(&idle), filetime_ticks(&kernel), filetime_ticks(&user));
    Ok(CpuTimes {
        user: ticks_to_secs(user),
        system: ticks_to_secs(kernel - idle),
        idle: ticks_to_secs(idle),
        ..Default::default()
    })
}

/// Reads a per-CPU `NtQuerySystemInformation` class.
fn per_cpu<T: Copy>(platform: &PlatformImpl, class: u32, syscall: &str) -> Result<Vec<T>> {
    let initial = count_logical()? * std::mem::size_of::<T>();
    let buf = query_system_information(platform, class, syscall, initial)?;
    Ok(read_records::<T>(buf.bytes()))
}

pub(super) fn per_cpu_times(platform: &PlatformImpl) -> Result<Vec<CpuTimes>> {
    let cpus = per_cpu::<ffi::SystemProcessorPerformanceInformation>(
        platform,
        ffi::SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION,
        "NtQuerySystemInformation(SystemProcessorPerformanceInformation)",
    )?;
    Ok(cpus
        .iter()
        .map(|cpu| CpuTimes {
            user: ticks_to_secs(cpu.UserTime),
            system: ticks_to_secs(cpu.KernelTime - cpu.IdleTime),
            idle: ticks_to_secs(cpu.IdleTime),
            interrupt: Some(ticks_to_secs(cpu.InterruptTime)),
            dpc: Some(ticks_to_secs(cpu.DpcTime)),
            ..Default::default()
        })
        .collect())
}

pub(super) fn count_logical() -> Result<usize> {
    // SAFETY: `GetActiveProcessorCount` has no pointer arguments.
    match unsafe { GetActiveProcessorCount(ALL_PROCESSOR_GROUPS) } {
        0 => Err(Error::last_os_error("GetActiveProcessorCount")),
        count => Ok(count as usize),
    }
}

/// Counts the variable-length `SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX` records in `bytes`.
///
/// Each record starts with its relationship and its own size, both `u32`.
pub(super) fn count_records(bytes: &[u8]) -> usize {
    let mut count = 0;
    let mut offset = 0;
    while let Some(size) = read_record::<u32>(bytes, offset + 4) {
        if size == 0 {
            break;
        }
        count += 1;
        offset += size as usize;
    }
    count
}

pub(super) fn count_cores(platform: &PlatformImpl) -> Result<usize> {
    let syscall = "GetLogicalProcessorInformationEx";
    let buf = grow_aligned(platform.context.buffer_policy(), syscall, 4096, |buf, capacity| {
        let mut len = capacity as u32;
        // SAFETY: `buf` is valid for `len` bytes of writes, and 8-byte aligned.
        let ok = unsafe {
            GetLogicalProcessorInformationEx(
                RelationProcessorCore,
                buf as *mut SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
                &mut len,
            )
        };
        if ok == 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(ERROR_INSUFFICIENT_BUFFER as i32) {
                return Ok(Fill::TooSmall(Some(len as usize)));
            }
            return Err(Error::Os {
                syscall: syscall.to_string(),
                source: error,
            });
        }
        Ok(Fill::Done(len as usize))
    })?;

    match count_records(buf.bytes()) {
        0 => Err(Error::unsupported("counting physical cores without processor records")),
        cores => Ok(cores),
    }
}

pub(super) fn stats(platform: &PlatformImpl) -> Result<CpuStats> {
    let interrupts = per_cpu::<ffi::SystemInterruptInformation>(
        platform,
        ffi::SYSTEM_INTERRUPT_INFORMATION,
        "NtQuerySystemInformation(SystemInterruptInformation)",
    )?;
    let processors = per_cpu::<ffi::SystemProcessorPerformanceInformation>(
        platform,
        ffi::SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION,
        "NtQuerySystemInformation(SystemProcessorPerformanceInformation)",
    )?;
    let performance = query_system_information(
        platform,
        ffi::SYSTEM_PERFORMANCE_INFORMATION,
        "NtQuerySystemInformation(SystemPerformanceInformation)",
        std::mem::size_of::<ffi::SystemPerformanceInformation>(),
    )?;

    // The performance class is shorter on older releases; the counters we want are near the front.
    let mut padded = performance.bytes().to_vec();
    padded.resize(padded.len().max(std::mem::size_of::<ffi::SystemPerformanceInformation>()), 0);
    let syscalls = read_record::<ffi::SystemPerformanceInformation>(&padded, 0)
        .map(|info| info.Counters[ffi::SystemPerformanceInformation::SYSTEM_CALLS])
        .unwrap_or_default();

    Ok(CpuStats {
        ctx_switches: interrupts.iter().map(|cpu| u64::from(cpu.ContextSwitches)).sum(),
        interrupts: processors.iter().map(|cpu| u64::from(cpu.InterruptCount)).sum(),
        soft_interrupts: interrupts.iter().map(|cpu| u64::from(cpu.DpcCount)).sum(),
        syscalls: u64::from(syscalls),
    })
}

pub(super) fn freq() -> Result<CpuFreq> {
    let cpus = count_logical()?;
    let mut info = vec![ffi::ProcessorPowerInformation::default(); cpus];
    let len = (cpus * std::mem::size_of::<ffi::ProcessorPowerInformation>()) as u32;
    // SAFETY: `info` is valid for `len` bytes of writes.
    let status = unsafe {
        CallNtPowerInformation(ProcessorInformation, std::ptr::null(), 0, info.as_mut_ptr() as *mut c_void, len)
    };
    if status < 0 {
        return Err(nt_error("CallNtPowerInformation(ProcessorInformation)", status));
    }

    // Every processor reports the same clock; the first one stands for all.
    let first = info[0];
    Ok(CpuFreq {
        current: f64::from(first.CurrentMhz),
        min: 0.0,
        max: f64::from(first.MaxMhz),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_records() {
        let mut bytes = Vec::new();
        for size in [48u32, 80, 48] {
            let mut record = vec![0u8; size as usize];
            record[4..8].copy_from_slice(&size.to_ne_bytes());
            bytes.extend(record);
        }
        assert_eq!(count_records(&bytes), 3);
        assert_eq!(count_records(&bytes[..100]), 2);
        assert_eq!(count_records(&[]), 0);
    }

    #[test]
    fn system_cpu() {
        let platform = PlatformImpl::new(crate::context::BindingContext::builder().testing(true).build());
        let logical = count_logical().unwrap();
        assert_eq!(per_cpu_times(&platform).unwrap().len(), logical);
        assert!(times().unwrap().idle > 0.0);
        assert!(stats(&platform).unwrap().ctx_switches > 0);
        assert!(freq().unwrap().max > 0.0);
    }
}
