//! Native API declarations that the Win32 headers don't cover.
//!
//! Layouts follow the 64-bit definitions; pointer-sized fields are `usize` or raw pointers so that 32-bit builds get the
//! matching 32-bit layout.

#![allow(non_snake_case, dead_code)]

use std::ffi::c_void;

use windows_sys::Win32::Foundation::HANDLE;

pub(super) type NTSTATUS = i32;

pub(super) const STATUS_SUCCESS: NTSTATUS = 0;
pub(super) const STATUS_BUFFER_OVERFLOW: NTSTATUS = 0x8000_0005_u32 as i32;
pub(super) const STATUS_INFO_LENGTH_MISMATCH: NTSTATUS = 0xC000_0004_u32 as i32;
pub(super) const STATUS_BUFFER_TOO_SMALL: NTSTATUS = 0xC000_0023_u32 as i32;

// `SYSTEM_INFORMATION_CLASS`
pub(super) const SYSTEM_PERFORMANCE_INFORMATION: u32 = 2;
pub(super) const SYSTEM_PROCESS_INFORMATION: u32 = 5;
pub(super) const SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION: u32 = 8;
pub(super) const SYSTEM_INTERRUPT_INFORMATION: u32 = 23;
pub(super) const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;

// `PROCESSINFOCLASS`
pub(super) const PROCESS_BASIC_INFORMATION: u32 = 0;
pub(super) const PROCESS_COMMAND_LINE_INFORMATION: u32 = 60;

/// `KTHREAD_STATE::Waiting`
pub(super) const THREAD_STATE_WAITING: u32 = 5;
/// `KWAIT_REASON::Suspended`
pub(super) const WAIT_REASON_SUSPENDED: u32 = 5;

#[link(name = "ntdll")]
extern "system" {
    pub(super) fn NtQuerySystemInformation(
        class: u32, information: *mut c_void, length: u32, return_length: *mut u32,
    ) -> NTSTATUS;

    pub(super) fn NtQueryInformationProcess(
        process: HANDLE, class: u32, information: *mut c_void, length: u32, return_length: *mut u32,
    ) -> NTSTATUS;

    pub(super) fn NtSuspendProcess(process: HANDLE) -> NTSTATUS;

    pub(super) fn NtResumeProcess(process: HANDLE) -> NTSTATUS;

    pub(super) fn RtlNtStatusToDosError(status: NTSTATUS) -> u32;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct UnicodeString {
    pub Length: u16,
    pub MaximumLength: u16,
    pub Buffer: *mut u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct SystemProcessInformation {
    pub NextEntryOffset: u32,
    pub NumberOfThreads: u32,
    pub WorkingSetPrivateSize: i64,
    pub HardFaultCount: u32,
    pub NumberOfThreadsHighWatermark: u32,
    pub CycleTime: u64,
    pub CreateTime: i64,
    pub UserTime: i64,
    pub KernelTime: i64,
    pub ImageName: UnicodeString,
    pub BasePriority: i32,
    pub UniqueProcessId: usize,
    pub InheritedFromUniqueProcessId: usize,
    pub HandleCount: u32,
    pub SessionId: u32,
    pub UniqueProcessKey: usize,
    pub PeakVirtualSize: usize,
    pub VirtualSize: usize,
    pub PageFaultCount: u32,
    pub PeakWorkingSetSize: usize,
    pub WorkingSetSize: usize,
    pub QuotaPeakPagedPoolUsage: usize,
    pub QuotaPagedPoolUsage: usize,
    pub QuotaPeakNonPagedPoolUsage: usize,
    pub QuotaNonPagedPoolUsage: usize,
    pub PagefileUsage: usize,
    pub PeakPagefileUsage: usize,
    pub PrivatePageCount: usize,
    pub ReadOperationCount: i64,
    pub WriteOperationCount: i64,
    pub OtherOperationCount: i64,
    pub ReadTransferCount: i64,
    pub WriteTransferCount: i64,
    pub OtherTransferCount: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct ClientId {
    pub UniqueProcess: usize,
    pub UniqueThread: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct SystemThreadInformation {
    pub KernelTime: i64,
    pub UserTime: i64,
    pub CreateTime: i64,
    pub WaitTime: u32,
    pub StartAddress: *mut c_void,
    pub ClientId: ClientId,
    pub Priority: i32,
    pub BasePriority: i32,
    pub ContextSwitches: u32,
    pub ThreadState: u32,
    pub WaitReason: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct SystemProcessorPerformanceInformation {
    pub IdleTime: i64,
    pub KernelTime: i64,
    pub UserTime: i64,
    pub DpcTime: i64,
    pub InterruptTime: i64,
    pub InterruptCount: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct SystemInterruptInformation {
    pub ContextSwitches: u32,
    pub DpcCount: u32,
    pub DpcRate: u32,
    pub TimeIncrement: u32,
    pub DpcBypassCount: u32,
    pub ApcBypassCount: u32,
}

/// `SYSTEM_PERFORMANCE_INFORMATION`: four transfer counters, then a long run of 32-bit counters.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct SystemPerformanceInformation {
    pub TransferCounts: [i64; 4],
    pub Counters: [u32; 248],
}

impl SystemPerformanceInformation {
    pub const CONTEXT_SWITCHES: usize = 66;
    pub const SYSTEM_CALLS: usize = 69;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct SystemHandleInformationEx {
    pub NumberOfHandles: usize,
    pub Reserved: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct SystemHandleTableEntryInfoEx {
    pub Object: *mut c_void,
    pub UniqueProcessId: usize,
    pub HandleValue: usize,
    pub GrantedAccess: u32,
    pub CreatorBackTraceIndex: u16,
    pub ObjectTypeIndex: u16,
    pub HandleAttributes: u32,
    pub Reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct ProcessBasicInformation {
    pub ExitStatus: NTSTATUS,
    pub PebBaseAddress: *mut c_void,
    pub AffinityMask: usize,
    pub BasePriority: i32,
    pub UniqueProcessId: usize,
    pub InheritedFromUniqueProcessId: usize,
}

/// Offsets into the PEB and `RTL_USER_PROCESS_PARAMETERS` of a process with our pointer width.
#[cfg(target_pointer_width = "64")]
pub(super) mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x20;
    pub const CURRENT_DIRECTORY: usize = 0x38;
    pub const ENVIRONMENT: usize = 0x80;
}

#[cfg(target_pointer_width = "32")]
pub(super) mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x10;
    pub const CURRENT_DIRECTORY: usize = 0x24;
    pub const ENVIRONMENT: usize = 0x48;
}

/// `MIB_TCPROW_OWNER_PID`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct TcpRowOwnerPid {
    pub dwState: u32,
    pub dwLocalAddr: u32,
    pub dwLocalPort: u32,
    pub dwRemoteAddr: u32,
    pub dwRemotePort: u32,
    pub dwOwningPid: u32,
}

/// `MIB_TCP6ROW_OWNER_PID`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct Tcp6RowOwnerPid {
    pub ucLocalAddr: [u8; 16],
    pub dwLocalScopeId: u32,
    pub dwLocalPort: u32,
    pub ucRemoteAddr: [u8; 16],
    pub dwRemoteScopeId: u32,
    pub dwRemotePort: u32,
    pub dwState: u32,
    pub dwOwningPid: u32,
}

/// `MIB_UDPROW_OWNER_PID`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct UdpRowOwnerPid {
    pub dwLocalAddr: u32,
    pub dwLocalPort: u32,
    pub dwOwningPid: u32,
}

/// `MIB_UDP6ROW_OWNER_PID`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct Udp6RowOwnerPid {
    pub ucLocalAddr: [u8; 16],
    pub dwLocalScopeId: u32,
    pub dwLocalPort: u32,
    pub dwOwningPid: u32,
}

/// `DISK_PERFORMANCE`
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct DiskPerformance {
    pub BytesRead: i64,
    pub BytesWritten: i64,
    pub ReadTime: i64,
    pub WriteTime: i64,
    pub IdleTime: i64,
    pub ReadCount: u32,
    pub WriteCount: u32,
    pub QueueDepth: u32,
    pub SplitCount: u32,
    pub QueryTime: i64,
    pub StorageDeviceNumber: u32,
    pub StorageManagerName: [u16; 8],
}

pub(super) const IOCTL_DISK_PERFORMANCE: u32 = 0x0007_0020;

/// `PROCESSOR_POWER_INFORMATION`
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct ProcessorPowerInformation {
    pub Number: u32,
    pub MaxMhz: u32,
    pub CurrentMhz: u32,
    pub MhzLimit: u32,
    pub MaxIdleState: u32,
    pub CurrentIdleState: u32,
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(size_of::<SystemProcessInformation>(), 0x100);
        assert_eq!(size_of::<SystemThreadInformation>(), 0x50);
        assert_eq!(size_of::<SystemProcessorPerformanceInformation>(), 48);
        assert_eq!(size_of::<SystemHandleTableEntryInfoEx>(), 40);
        assert_eq!(size_of::<ProcessBasicInformation>(), 48);
        assert_eq!(size_of::<Tcp6RowOwnerPid>(), 56);
        assert_eq!(size_of::<Udp6RowOwnerPid>(), 28);
    }
}
