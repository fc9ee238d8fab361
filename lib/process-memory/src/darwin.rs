use std::{io, mem::MaybeUninit};

use libc::{
    c_int, c_void, mach_msg_type_number_t, mach_task_basic_info_data_t, proc_taskinfo, task_info, task_info_t,
    KERN_SUCCESS, MACH_TASK_BASIC_INFO, MACH_TASK_BASIC_INFO_COUNT, PROC_PIDTASKINFO,
};
use mach2::{
    kern_return::KERN_INVALID_ADDRESS,
    mach_port::mach_port_deallocate,
    port::{mach_port_t, MACH_PORT_NULL},
    traps::{mach_task_self, task_for_pid},
    vm::mach_vm_region,
    vm_types::{mach_vm_address_t, mach_vm_size_t},
};

use crate::{Footprint, Target};

const VM_REGION_TOP_INFO: c_int = 12;

const SM_COW: u8 = 1;
const SM_PRIVATE: u8 = 2;
const SM_LARGE_PAGE: u8 = 8;

#[cfg(target_arch = "aarch64")]
const SHARED_REGION_BASE: u64 = 0x1_8000_0000;
#[cfg(target_arch = "aarch64")]
const SHARED_REGION_SIZE: u64 = 0x1_0000_0000;
#[cfg(not(target_arch = "aarch64"))]
const SHARED_REGION_BASE: u64 = 0x7FFF_0000_0000;
#[cfg(not(target_arch = "aarch64"))]
const SHARED_REGION_SIZE: u64 = 0xFFE0_0000;

/// `struct vm_region_top_info` from `<mach/vm_region.h>`, which is declared under `#pragma pack(4)`.
#[repr(C, packed(4))]
#[derive(Default)]
struct VmRegionTopInfo {
    obj_id: u32,
    ref_count: u32,
    private_pages_resident: u32,
    shared_pages_resident: u32,
    share_mode: u8,
}

const VM_REGION_TOP_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<VmRegionTopInfo>() / std::mem::size_of::<c_int>()) as mach_msg_type_number_t;

/// A task port obtained from `task_for_pid`, released on drop.
struct TaskPort(mach_port_t);

impl TaskPort {
    fn for_target(target: Target) -> io::Result<Self> {
        match target {
            // SAFETY: `mach_task_self` has no preconditions.
            Target::Current => Ok(Self(unsafe { mach_task_self() })),
            Target::Pid(pid) => {
                let mut task: mach_port_t = MACH_PORT_NULL;
                // SAFETY: `task` is a valid out pointer for the duration of the call.
                let result = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
                if result != KERN_SUCCESS {
                    // `task_for_pid` doesn't set errno; a failure here is almost always a permission boundary.
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("task_for_pid failed with kern_return_t {}", result),
                    ));
                }
                Ok(Self(task))
            }
        }
    }
}

impl Drop for TaskPort {
    fn drop(&mut self) {
        // SAFETY: The port name was handed to us by `task_for_pid`. Our own task port is never deallocated.
        unsafe {
            if self.0 != mach_task_self() && self.0 != MACH_PORT_NULL {
                mach_port_deallocate(mach_task_self(), self.0);
            }
        }
    }
}

/// A memory usage querier.
pub struct Querier {
    target: Target,
    page_size: u64,
}

impl Querier {
    /// Creates a querier for the given target.
    pub fn new(target: Target) -> Self {
        // SAFETY: `sysconf` has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            target,
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }

    /// Gets the resident set size of the target process, in bytes.
    ///
    /// If the resident set size cannot be determined, `None` is returned.
    pub fn resident_set_size(&mut self) -> Option<usize> {
        match self.target {
            Target::Current => current_task_rss(),
            Target::Pid(pid) => pid_task_info(pid).ok().map(|info| info.pti_resident_size as usize),
        }
    }

    /// Gets the full memory footprint of the target process.
    ///
    /// # Errors
    ///
    /// If the process can't be inspected, an error is returned. USS requires the task port of the process, which for
    /// processes other than our own usually requires root.
    pub fn footprint(&mut self) -> io::Result<Footprint> {
        let rss = match self.target {
            Target::Current => current_task_rss()
                .map(|rss| rss as u64)
                .ok_or_else(io::Error::last_os_error)?,
            Target::Pid(pid) => pid_task_info(pid)?.pti_resident_size,
        };

        let task = TaskPort::for_target(self.target)?;
        let private_pages = count_private_pages(&task)?;

        Ok(Footprint {
            rss,
            pss: None,
            uss: Some(private_pages * self.page_size),
            swap: None,
        })
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new(Target::Current)
    }
}

fn current_task_rss() -> Option<usize> {
    // `task_info` expects a pointer to the struct and the number of integers it can write into it, which is already
    // derived for us in `MACH_TASK_BASIC_INFO_COUNT`.
    let mut basic_task_info = MaybeUninit::<mach_task_basic_info_data_t>::uninit();
    let mut basic_task_info_len = MACH_TASK_BASIC_INFO_COUNT;

    // SAFETY: We're passing a valid pointer, and struct length, for the task info output.
    let result = unsafe {
        task_info(
            libc::mach_task_self(),
            MACH_TASK_BASIC_INFO,
            basic_task_info.as_mut_ptr() as task_info_t,
            &mut basic_task_info_len as *mut mach_msg_type_number_t,
        )
    };
    match result {
        KERN_SUCCESS => {
            // SAFETY: We know the structure has been populated by `task_info` at this point.
            let basic_task_info = unsafe { basic_task_info.assume_init() };
            Some(basic_task_info.resident_size as usize)
        }
        _ => None,
    }
}

fn pid_task_info(pid: i32) -> io::Result<proc_taskinfo> {
    let mut info = MaybeUninit::<proc_taskinfo>::zeroed();
    let size = std::mem::size_of::<proc_taskinfo>() as c_int;

    // SAFETY: The buffer is sized for exactly one `proc_taskinfo`.
    let written = unsafe { libc::proc_pidinfo(pid, PROC_PIDTASKINFO, 0, info.as_mut_ptr() as *mut c_void, size) };
    if written <= 0 {
        return Err(io::Error::last_os_error());
    }
    if written < size {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short read from proc_pidinfo"));
    }

    // SAFETY: `proc_pidinfo` filled the whole struct.
    Ok(unsafe { info.assume_init() })
}

fn in_shared_region(address: u64) -> bool {
    (SHARED_REGION_BASE..SHARED_REGION_BASE + SHARED_REGION_SIZE).contains(&address)
}

/// Walks every VM region of the task, counting resident pages that no other task maps.
fn count_private_pages(task: &TaskPort) -> io::Result<u64> {
    let mut private_pages = 0u64;
    let mut address: mach_vm_address_t = 0;
    let mut size: mach_vm_size_t = 0;

    loop {
        let mut info = VmRegionTopInfo::default();
        let mut info_count = VM_REGION_TOP_INFO_COUNT;
        let mut object_name: mach_port_t = MACH_PORT_NULL;

        // SAFETY: All out pointers are valid for the duration of the call, and `info_count` matches `info`.
        let result = unsafe {
            mach_vm_region(
                task.0,
                &mut address,
                &mut size,
                VM_REGION_TOP_INFO,
                &mut info as *mut VmRegionTopInfo as *mut c_int,
                &mut info_count,
                &mut object_name,
            )
        };

        if result == KERN_INVALID_ADDRESS {
            // Walked past the last region.
            break;
        }
        if result != KERN_SUCCESS {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("mach_vm_region failed with kern_return_t {}", result),
            ));
        }

        let share_mode = info.share_mode;
        let private_resident = u64::from(info.private_pages_resident);
        let shared_resident = u64::from(info.shared_pages_resident);
        let ref_count = info.ref_count;

        // Regions of the dyld shared cache are shared by every process unless they were made private.
        if !(in_shared_region(address) && share_mode != SM_PRIVATE) {
            match share_mode {
                // Large pages are not shareable and always resident.
                SM_LARGE_PAGE | SM_PRIVATE => private_pages += private_resident + shared_resident,
                SM_COW => {
                    private_pages += private_resident;
                    // Copy-on-write pages with a single reference are ours alone.
                    if ref_count == 1 {
                        private_pages += shared_resident;
                    }
                }
                _ => {}
            }
        }

        address = address.saturating_add(size);
    }

    Ok(private_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        let mut querier = Querier::default();
        assert!(querier.resident_set_size().is_some());
    }

    #[test]
    fn own_footprint_has_uss() {
        let footprint = Querier::default().footprint().unwrap();
        assert!(footprint.rss > 0);
        assert!(footprint.uss.unwrap() > 0);
    }

    #[test]
    fn own_pid_matches_current() {
        let pid = std::process::id() as i32;
        let mut querier = Querier::new(Target::Pid(pid));
        assert!(querier.resident_set_size().unwrap() > 0);
    }
}
