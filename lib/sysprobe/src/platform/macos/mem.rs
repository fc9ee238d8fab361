use super::{ffi, HostPort, PlatformImpl};
use crate::{
    error::Result,
    platform::bsdlike::sysctl,
    types::{SwapMemory, VirtualMemory},
};

/// Builds the memory record from page counts.
///
/// Speculative pages are counted as free by the kernel but are about to be used, so they're taken out of `free`.
/// Inactive pages can be reclaimed without paging anything out, so they count as available.
fn memory_from_stats(total: u64, vm: &ffi::vm_statistics64, page_size: u64) -> VirtualMemory {
    let pages = |count: u32| count as u64 * page_size;
    let active = pages(vm.active_count);
    let inactive = pages(vm.inactive_count);
    let wired = pages(vm.wire_count);
    let free = pages(vm.free_count.saturating_sub(vm.speculative_count));

    VirtualMemory {
        total,
        available: inactive + free,
        used: active + wired,
        free,
        active: Some(active),
        inactive: Some(inactive),
        wired: Some(wired),
        ..Default::default()
    }
}

fn vm_statistics() -> Result<ffi::vm_statistics64> {
    HostPort::new().statistics64(ffi::HOST_VM_INFO64, "host_statistics64(HOST_VM_INFO64)")
}

pub(super) fn virtual_memory(platform: &PlatformImpl) -> Result<VirtualMemory> {
    let total = sysctl::value_by_name::<u64>("hw.memsize")?;
    Ok(memory_from_stats(total, &vm_statistics()?, platform.page_size))
}

pub(super) fn swap_memory(platform: &PlatformImpl) -> Result<SwapMemory> {
    let usage = sysctl::value_by_name::<ffi::xsw_usage>("vm.swapusage")?;
    let vm = vm_statistics()?;
    Ok(SwapMemory {
        total: usage.xsu_total,
        used: usage.xsu_used,
        free: usage.xsu_avail,
        sin: vm.pageins * platform.page_size,
        sout: vm.pageouts * platform.page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingContext;

    #[test]
    fn page_accounting() {
        let vm = ffi::vm_statistics64 {
            free_count: 100,
            speculative_count: 20,
            active_count: 300,
            inactive_count: 50,
            wire_count: 30,
            ..Default::default()
        };
        let memory = memory_from_stats(1 << 20, &vm, 1024);
        assert_eq!(memory.free, 80 * 1024);
        assert_eq!(memory.available, 130 * 1024);
        assert_eq!(memory.used, 330 * 1024);
        assert_eq!(memory.wired, Some(30 * 1024));
    }

    #[test]
    fn live_memory() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        let memory = virtual_memory(&platform).unwrap();
        assert!(memory.total > 0);
        assert!(memory.available <= memory.total);

        let swap = swap_memory(&platform).unwrap();
        assert!(swap.used <= swap.total);
    }
}
