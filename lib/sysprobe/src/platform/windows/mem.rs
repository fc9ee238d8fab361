use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

use crate::{
    error::{Error, Result},
    types::{SwapMemory, VirtualMemory},
};

fn memory_status() -> Result<MEMORYSTATUSEX> {
    // SAFETY: Plain old data.
    let mut status: MEMORYSTATUSEX = unsafe { std::mem::zeroed() };
    status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
    // SAFETY: `status` is valid for writes and carries its own size.
    if unsafe { GlobalMemoryStatusEx(&mut status) } == 0 {
        return Err(Error::last_os_error("GlobalMemoryStatusEx"));
    }
    Ok(status)
}

pub(super) fn virtual_memory() -> Result<VirtualMemory> {
    let status = memory_status()?;
    Ok(VirtualMemory {
        total: status.ullTotalPhys,
        available: status.ullAvailPhys,
        used: status.ullTotalPhys.saturating_sub(status.ullAvailPhys),
        free: status.ullAvailPhys,
        ..Default::default()
    })
}

/// Swap figures from the commit limit, which counts physical memory plus every page file.
pub(super) fn swap_from(total_phys: u64, avail_phys: u64, total_commit: u64, avail_commit: u64) -> SwapMemory {
    let total = total_commit.saturating_sub(total_phys);
    let used_commit = total_commit.saturating_sub(avail_commit);
    let used_phys = total_phys.saturating_sub(avail_phys);
    let used = used_commit.saturating_sub(used_phys).min(total);
    SwapMemory {
        total,
        used,
        free: total - used,
        sin: 0,
        sout: 0,
    }
}

pub(super) fn swap_memory() -> Result<SwapMemory> {
    let status = memory_status()?;
    Ok(swap_from(
        status.ullTotalPhys,
        status.ullAvailPhys,
        status.ullTotalPageFile,
        status.ullAvailPageFile,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn swap_from_commit_charge() {
        let swap = swap_from(16 * GIB, 6 * GIB, 20 * GIB, 8 * GIB);
        assert_eq!(swap.total, 4 * GIB);
        assert_eq!(swap.used, 2 * GIB);
        assert_eq!(swap.free, 2 * GIB);
    }

    #[test]
    fn swap_without_page_file() {
        let swap = swap_from(16 * GIB, 6 * GIB, 16 * GIB, 5 * GIB);
        assert_eq!(swap, SwapMemory { total: 0, used: 0, free: 0, sin: 0, sout: 0 });
    }

    #[test]
    fn physical_memory() {
        let memory = virtual_memory().unwrap();
        assert!(memory.total > 0);
        assert_eq!(memory.used + memory.available, memory.total);
    }
}
