//! Per-process queries.

use std::{ffi::c_void, io, mem::MaybeUninit};

use process_memory::{Querier, Target};
use windows_sys::Win32::{
    Foundation::{ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_PARAMETER, FILETIME},
    System::{
        Diagnostics::Debug::ReadProcessMemory,
        Memory::{VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_IMAGE, MEM_MAPPED},
        ProcessStatus::{GetMappedFileNameW, GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS, PROCESS_MEMORY_COUNTERS_EX},
        Threading::{
            GetExitCodeProcess, GetPriorityClass, GetProcessAffinityMask, GetProcessHandleCount, GetProcessIoCounters,
            GetProcessTimes, OpenProcess, QueryFullProcessImageNameW, SetPriorityClass, SetProcessAffinityMask,
            TerminateProcess, IO_COUNTERS, PROCESS_NAME_WIN32, PROCESS_QUERY_INFORMATION,
            PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_INFORMATION, PROCESS_SUSPEND_RESUME, PROCESS_TERMINATE,
            PROCESS_VM_READ,
        },
    },
};

use super::{
    disk, ffi, filetime_ticks, filetime_to_unix, from_wide, grow_aligned, nt_error, os_pid, query_system_information,
    sys, ticks_to_secs, utf16_bytes, HandleGuard, PlatformImpl,
};
use crate::{
    buffer::{grow_until_fits, read_record, Fill},
    classify::{check_pid, classify, ClassifyExt as _},
    error::{Error, ErrorKind, Result},
    platform::footprint_from,
    types::*,
};

/// `STILL_ACTIVE`, the exit code of a running process.
const STILL_ACTIVE: u32 = 259;

/// PID of the `System` process, which owns kernel threads.
const SYSTEM_PID: Pid = 4;

/// Exit code used for terminated processes, matching `SIGTERM`.
const TERMINATE_EXIT_CODE: u32 = 15;

/// Upper bound on how much of a remote environment block is read.
const MAX_ENVIRONMENT_BYTES: usize = 1024 * 1024;

const MAX_PATH_CHARS: usize = 32_768;

const PRIORITY_CLASSES: [u32; 6] = [
    0x0000_0040, // IDLE_PRIORITY_CLASS
    0x0000_4000, // BELOW_NORMAL_PRIORITY_CLASS
    0x0000_0020, // NORMAL_PRIORITY_CLASS
    0x0000_8000, // ABOVE_NORMAL_PRIORITY_CLASS
    0x0000_0080, // HIGH_PRIORITY_CLASS
    0x0000_0100, // REALTIME_PRIORITY_CLASS
];

/// One thread from the process snapshot.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct ThreadEntry {
    pub tid: u64,
    pub user: f64,
    pub system: f64,
    pub context_switches: u64,
    pub suspended: bool,
}

/// One process from the process snapshot.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct ProcessEntry {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub num_threads: u64,
    pub create_time: f64,
    pub cpu: ProcessCpuTimes,
    pub memory: ProcessMemory,
    pub io: IoCounters,
    pub handle_count: u64,
    pub threads: Vec<ThreadEntry>,
}

impl ProcessEntry {
    /// A process is stopped when every one of its threads is suspended.
    pub(super) fn status(&self) -> ProcessStatus {
        if !self.threads.is_empty() && self.threads.iter().all(|thread| thread.suspended) {
            ProcessStatus::Stopped
        } else {
            ProcessStatus::Running
        }
    }
}

/// Decodes a `UNICODE_STRING` whose buffer lives inside `bytes`.
fn unicode_string_in(bytes: &[u8], string: &ffi::UnicodeString) -> Option<String> {
    let start = (string.Buffer as usize).checked_sub(bytes.as_ptr() as usize)?;
    let end = start.checked_add(string.Length as usize)?;
    bytes.get(start..end).map(utf16_bytes)
}

/// Walks a `SystemProcessInformation` snapshot.
pub(super) fn parse_process_list(bytes: &[u8]) -> Vec<ProcessEntry> {
    let process_size = std::mem::size_of::<ffi::SystemProcessInformation>();
    let thread_size = std::mem::size_of::<ffi::SystemThreadInformation>();

    let mut processes = Vec::new();
    let mut offset = 0;
    while let Some(info) = read_record::<ffi::SystemProcessInformation>(bytes, offset) {
        let pid = info.UniqueProcessId as Pid;
        let threads = (0..info.NumberOfThreads as usize)
            .filter_map(|i| read_record::<ffi::SystemThreadInformation>(bytes, offset + process_size + i * thread_size))
            .map(|thread| ThreadEntry {
                tid: thread.ClientId.UniqueThread as u64,
                user: ticks_to_secs(thread.UserTime),
                system: ticks_to_secs(thread.KernelTime),
                context_switches: u64::from(thread.ContextSwitches),
                suspended: thread.ThreadState == ffi::THREAD_STATE_WAITING
                    && thread.WaitReason == ffi::WAIT_REASON_SUSPENDED,
            })
            .collect();

        let name = match pid {
            0 => "System Idle Process".to_string(),
            _ => unicode_string_in(bytes, &info.ImageName).unwrap_or_default(),
        };

        processes.push(ProcessEntry {
            pid,
            ppid: info.InheritedFromUniqueProcessId as Pid,
            name,
            num_threads: u64::from(info.NumberOfThreads),
            create_time: if info.CreateTime > 0 { filetime_to_unix(info.CreateTime) } else { 0.0 },
            cpu: ProcessCpuTimes {
                user: ticks_to_secs(info.UserTime),
                system: ticks_to_secs(info.KernelTime),
                children_user: None,
                children_system: None,
            },
            memory: ProcessMemory {
                rss: info.WorkingSetSize as u64,
                vms: info.PagefileUsage as u64,
                page_faults: Some(u64::from(info.PageFaultCount)),
                peak_rss: Some(info.PeakWorkingSetSize as u64),
                ..Default::default()
            },
            io: IoCounters {
                read_count: info.ReadOperationCount.max(0) as u64,
                write_count: info.WriteOperationCount.max(0) as u64,
                read_bytes: info.ReadTransferCount.max(0) as u64,
                write_bytes: info.WriteTransferCount.max(0) as u64,
            },
            handle_count: u64::from(info.HandleCount),
            threads,
        });

        if info.NextEntryOffset == 0 {
            break;
        }
        offset += info.NextEntryOffset as usize;
    }
    processes
}

pub(super) fn processes(platform: &PlatformImpl) -> Result<Vec<ProcessEntry>> {
    let buf = query_system_information(
        platform,
        ffi::SYSTEM_PROCESS_INFORMATION,
        "NtQuerySystemInformation(SystemProcessInformation)",
        256 * 1024,
    )?;
    Ok(parse_process_list(buf.bytes()))
}

/// The snapshot entry for `pid`.
pub(super) fn entry(platform: &PlatformImpl, pid: Pid) -> Result<ProcessEntry> {
    check_pid(pid)?;
    processes(platform)?
        .into_iter()
        .find(|process| process.pid == pid)
        .ok_or(Error::NotFound { pid })
}

fn listed(platform: &PlatformImpl, pid: Pid) -> bool {
    processes(platform)
        .map(|list| list.iter().any(|process| process.pid == pid))
        .unwrap_or(false)
}

pub(super) fn pid_exists(platform: &PlatformImpl, pid: Pid) -> bool {
    match pid {
        pid if pid < 0 => false,
        0 => true,
        pid => {
            // SAFETY: `OpenProcess` has no pointer arguments.
            let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid as u32) };
            match HandleGuard::new(handle) {
                Some(handle) => {
                    let mut code = 0u32;
                    // SAFETY: `code` is valid for writes.
                    let ok = unsafe { GetExitCodeProcess(handle.raw(), &mut code) } != 0;
                    // Exited processes stay openable while handles to them remain.
                    if ok && code != STILL_ACTIVE {
                        return false;
                    }
                    // An exit code of `STILL_ACTIVE` can also be a real exit code.
                    listed(platform, pid)
                }
                None => {
                    let error = io::Error::last_os_error();
                    if error.kind() == io::ErrorKind::PermissionDenied {
                        true
                    } else if error.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) {
                        false
                    } else {
                        listed(platform, pid)
                    }
                }
            }
        }
    }
}

/// Opens `pid` with `access`, plus the right to check whether it's still running.
pub(super) fn open(platform: &PlatformImpl, pid: Pid, access: u32) -> Result<HandleGuard> {
    let os_pid = os_pid(pid)?;
    if pid == 0 {
        // The idle process can't be opened.
        return Err(Error::PermissionDenied {
            pid,
            syscall: "OpenProcess".to_string(),
        });
    }

    // SAFETY: `OpenProcess` has no pointer arguments.
    let handle = unsafe { OpenProcess(access | PROCESS_QUERY_LIMITED_INFORMATION, 0, os_pid) };
    let Some(handle) = HandleGuard::new(handle) else {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) {
            return Err(Error::NotFound { pid });
        }
        return Err(classify(platform, pid, "OpenProcess", error));
    };

    // Handles to exited processes stay openable while anyone holds one.
    let mut code = 0u32;
    // SAFETY: `code` is valid for writes.
    if unsafe { GetExitCodeProcess(handle.raw(), &mut code) } != 0 && code != STILL_ACTIVE && !listed(platform, pid) {
        return Err(Error::NotFound { pid });
    }
    Ok(handle)
}

/// Falls back to the process snapshot when a Win32 call is refused.
fn or_snapshot<T>(
    platform: &PlatformImpl, pid: Pid, result: Result<T>, from_entry: impl FnOnce(ProcessEntry) -> T,
) -> Result<T> {
    match result {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(from_entry(entry(platform, pid)?)),
        other => other,
    }
}

fn win32_failure<T>(platform: &PlatformImpl, pid: Pid, syscall: &str) -> Result<T> {
    Err(Error::last_os_error(syscall)).classify_for(platform, pid)
}

pub(super) fn exe(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    let path = grow_until_fits::<u16, _>(platform.context.buffer_policy(), "QueryFullProcessImageNameW", 260, |buf| {
        let mut len = buf.len() as u32;
        // SAFETY: `buf` is valid for `len` characters of writes.
        if unsafe { QueryFullProcessImageNameW(handle.raw(), PROCESS_NAME_WIN32, buf.as_mut_ptr(), &mut len) } == 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(ERROR_INSUFFICIENT_BUFFER as i32) {
                return Ok(Fill::TooSmall(None));
            }
            return Err(Error::Os {
                syscall: "QueryFullProcessImageNameW".to_string(),
                source: error,
            });
        }
        Ok(Fill::Done(len as usize))
    })
    .classify_for(platform, pid)?;
    Ok(String::from_utf16_lossy(&path))
}

/// Splits a command line the way the C runtime builds `argv`.
pub(super) fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    if line.is_empty() {
        return args;
    }

    // The program name ends at the next blank, or the closing quote, and backslashes are literal in it.
    let mut chars = line.chars().peekable();
    let mut program = String::new();
    if chars.peek() == Some(&'"') {
        chars.next();
        for c in chars.by_ref() {
            if c == '"' {
                break;
            }
            program.push(c);
        }
    } else {
        while let Some(c) = chars.next_if(|c| *c != ' ' && *c != '\t') {
            program.push(c);
        }
    }
    args.push(program);

    loop {
        while chars.next_if(|c| *c == ' ' || *c == '\t').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut arg = String::new();
        let mut quoted = false;
        let mut backslashes = 0;
        while let Some(&c) = chars.peek() {
            match c {
                '\\' => {
                    backslashes += 1;
                    chars.next();
                }
                '"' => {
                    chars.next();
                    arg.extend(std::iter::repeat('\\').take(backslashes / 2));
                    if backslashes % 2 == 1 {
                        arg.push('"');
                    } else if quoted && chars.next_if_eq(&'"').is_some() {
                        arg.push('"');
                    } else {
                        quoted = !quoted;
                    }
                    backslashes = 0;
                }
                ' ' | '\t' if !quoted => break,
                _ => {
                    arg.extend(std::iter::repeat('\\').take(backslashes));
                    backslashes = 0;
                    arg.push(c);
                    chars.next();
                }
            }
        }
        arg.extend(std::iter::repeat('\\').take(backslashes));
        args.push(arg);
    }
    args
}

pub(super) fn cmdline(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let syscall = "NtQueryInformationProcess(ProcessCommandLineInformation)";
    let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    let buf = grow_aligned(platform.context.buffer_policy(), syscall, 1024, |buf, capacity| {
        let mut needed = 0u32;
        // SAFETY: `buf` is valid for `capacity` bytes of writes.
        let status = unsafe {
            ffi::NtQueryInformationProcess(
                handle.raw(),
                ffi::PROCESS_COMMAND_LINE_INFORMATION,
                buf,
                capacity as u32,
                &mut needed,
            )
        };
        match status {
            ffi::STATUS_INFO_LENGTH_MISMATCH | ffi::STATUS_BUFFER_TOO_SMALL | ffi::STATUS_BUFFER_OVERFLOW => {
                Ok(Fill::TooSmall(Some(needed as usize).filter(|n| *n > 0)))
            }
            status if status < 0 => Err(nt_error(syscall, status)),
            _ => Ok(Fill::Done(needed as usize)),
        }
    })
    .classify_for(platform, pid)?;

    let line = read_record::<ffi::UnicodeString>(buf.bytes(), 0)
        .and_then(|string| unicode_string_in(buf.bytes(), &string))
        .unwrap_or_default();
    Ok(split_command_line(&line))
}

fn read_remote(handle: &HandleGuard, address: usize, len: usize) -> Result<Vec<u8>> {
    let mut buf = crate::buffer::try_zeroed::<u8>(len)?;
    let mut read = 0usize;
    // SAFETY: `buf` is valid for `len` bytes of writes, and the source is only read through the OS.
    let ok = unsafe {
        ReadProcessMemory(handle.raw(), address as *const c_void, buf.as_mut_ptr() as *mut c_void, len, &mut read)
    };
    if ok == 0 {
        return Err(Error::last_os_error("ReadProcessMemory"));
    }
    buf.truncate(read);
    Ok(buf)
}

fn read_pointer(handle: &HandleGuard, address: usize) -> Result<usize> {
    let bytes = read_remote(handle, address, std::mem::size_of::<usize>())?;
    read_record::<usize>(&bytes, 0).ok_or_else(|| Error::Os {
        syscall: "ReadProcessMemory".to_string(),
        source: io::Error::from(io::ErrorKind::UnexpectedEof),
    })
}

/// Opens `pid` for reading, and finds its `RTL_USER_PROCESS_PARAMETERS`.
fn process_parameters(platform: &PlatformImpl, pid: Pid) -> Result<(HandleGuard, usize)> {
    let handle = open(platform, pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)?;

    let mut basic = MaybeUninit::<ffi::ProcessBasicInformation>::zeroed();
    // SAFETY: `basic` is valid for a `PROCESS_BASIC_INFORMATION` of writes.
    let status = unsafe {
        ffi::NtQueryInformationProcess(
            handle.raw(),
            ffi::PROCESS_BASIC_INFORMATION,
            basic.as_mut_ptr() as *mut c_void,
            std::mem::size_of::<ffi::ProcessBasicInformation>() as u32,
            std::ptr::null_mut(),
        )
    };
    if status < 0 {
        return Err(nt_error("NtQueryInformationProcess(ProcessBasicInformation)", status)).classify_for(platform, pid);
    }
    // SAFETY: Zero-initialized, then filled by the kernel.
    let peb = unsafe { basic.assume_init() }.PebBaseAddress as usize;
    if peb == 0 {
        return Err(Error::unsupported("reading the parameters of a process with a different pointer width"));
    }

    let params = read_pointer(&handle, peb + ffi::peb::PROCESS_PARAMETERS).classify_for(platform, pid)?;
    Ok((handle, params))
}

/// Drops the trailing separator the kernel keeps on the working directory, except on a drive root.
fn trim_dir(mut dir: String) -> String {
    if dir.len() > 3 && dir.ends_with('\\') {
        dir.pop();
    }
    dir
}

pub(super) fn cwd(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    let (handle, params) = process_parameters(platform, pid)?;
    let read = || -> Result<String> {
        let raw = read_remote(&handle, params + ffi::peb::CURRENT_DIRECTORY, std::mem::size_of::<ffi::UnicodeString>())?;
        let Some(dir) = read_record::<ffi::UnicodeString>(&raw, 0) else {
            return Ok(String::new());
        };
        let bytes = read_remote(&handle, dir.Buffer as usize, dir.Length as usize)?;
        Ok(trim_dir(utf16_bytes_full(&bytes)))
    };
    read().classify_for(platform, pid)
}

/// Decodes all of a UTF-16 buffer, NULs included.
fn utf16_bytes_full(bytes: &[u8]) -> String {
    let wide = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect::<Vec<_>>();
    String::from_utf16_lossy(&wide)
}

/// Splits a `KEY=VALUE\0...\0\0` UTF-16 environment block.
pub(super) fn split_environment(bytes: &[u8]) -> Vec<String> {
    let wide = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect::<Vec<_>>();
    wide.split(|c| *c == 0)
        .take_while(|entry| !entry.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

/// Bytes between `address` and the end of its memory region.
fn region_remaining(handle: &HandleGuard, address: usize) -> Result<usize> {
    let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
    let size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();
    // SAFETY: `info` is valid for `size` bytes of writes.
    if unsafe { VirtualQueryEx(handle.raw(), address as *const c_void, info.as_mut_ptr(), size) } == 0 {
        return Err(Error::last_os_error("VirtualQueryEx"));
    }
    // SAFETY: Filled by the call above.
    let info = unsafe { info.assume_init() };
    Ok((info.BaseAddress as usize + info.RegionSize).saturating_sub(address))
}

pub(super) fn environ(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let (handle, params) = process_parameters(platform, pid)?;
    let read = || -> Result<Vec<String>> {
        let block = read_pointer(&handle, params + ffi::peb::ENVIRONMENT)?;
        let len = region_remaining(&handle, block)?.min(MAX_ENVIRONMENT_BYTES);
        Ok(split_environment(&read_remote(&handle, block, len)?))
    };
    read().classify_for(platform, pid)
}

fn process_times(platform: &PlatformImpl, pid: Pid) -> Result<[FILETIME; 4]> {
    let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    let mut times = [FILETIME { dwLowDateTime: 0, dwHighDateTime: 0 }; 4];
    let [create, exit, kernel, user] = &mut times;
    // SAFETY: Each `FILETIME` is valid for writes.
    if unsafe { GetProcessTimes(handle.raw(), create, exit, kernel, user) } == 0 {
        return win32_failure(platform, pid, "GetProcessTimes");
    }
    Ok(times)
}

pub(super) fn create_time(platform: &PlatformImpl, pid: Pid) -> Result<f64> {
    if pid == 0 || pid == SYSTEM_PID {
        return sys::boot_time();
    }
    let result = process_times(platform, pid).map(|[create, ..]| filetime_to_unix(filetime_ticks(&create)));
    or_snapshot(platform, pid, result, |entry| entry.create_time)
}

pub(super) fn cpu_times(platform: &PlatformImpl, pid: Pid) -> Result<ProcessCpuTimes> {
    let result = process_times(platform, pid).map(|[_, _, kernel, user]| ProcessCpuTimes {
        user: ticks_to_secs(filetime_ticks(&user)),
        system: ticks_to_secs(filetime_ticks(&kernel)),
        children_user: None,
        children_system: None,
    });
    or_snapshot(platform, pid, result, |entry| entry.cpu)
}

pub(super) fn memory_info(platform: &PlatformImpl, pid: Pid) -> Result<ProcessMemory> {
    let query = || -> Result<ProcessMemory> {
        let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut counters = MaybeUninit::<PROCESS_MEMORY_COUNTERS_EX>::zeroed();
        let len = std::mem::size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32;
        // SAFETY: The buffer is sized for one `PROCESS_MEMORY_COUNTERS_EX`, which extends `PROCESS_MEMORY_COUNTERS`.
        let ok = unsafe {
            GetProcessMemoryInfo(handle.raw(), counters.as_mut_ptr() as *mut PROCESS_MEMORY_COUNTERS, len)
        };
        if ok == 0 {
            return win32_failure(platform, pid, "GetProcessMemoryInfo");
        }
        // SAFETY: Filled by the call above.
        let counters = unsafe { counters.assume_init() };
        Ok(ProcessMemory {
            rss: counters.WorkingSetSize as u64,
            vms: counters.PrivateUsage as u64,
            page_faults: Some(u64::from(counters.PageFaultCount)),
            peak_rss: Some(counters.PeakWorkingSetSize as u64),
            ..Default::default()
        })
    };
    or_snapshot(platform, pid, query(), |entry| entry.memory)
}

pub(super) fn memory_full_info(platform: &PlatformImpl, pid: Pid) -> Result<MemoryFootprint> {
    check_pid(pid)?;
    Querier::new(Target::Pid(pid))
        .footprint()
        .map_err(|source| classify(platform, pid, "QueryWorkingSet", source))
        .and_then(footprint_from)
}

/// `rwx`-style permissions for a page protection value.
pub(super) fn protection_perms(protect: u32) -> &'static str {
    match protect & 0xff {
        0x02 => "r--",
        0x04 => "rw-",
        0x08 => "rw-c",
        0x10 => "--x",
        0x20 => "r-x",
        0x40 => "rwx",
        0x80 => "rwxc",
        _ => "---",
    }
}

fn mapped_file_name(handle: &HandleGuard, address: *const c_void) -> Option<String> {
    let mut buf = vec![0u16; MAX_PATH_CHARS];
    // SAFETY: `buf` is valid for its length in characters.
    let len = unsafe { GetMappedFileNameW(handle.raw(), address, buf.as_mut_ptr(), buf.len() as u32) };
    (len > 0).then(|| from_wide(&buf[..len as usize]))
}

pub(super) fn memory_maps(platform: &PlatformImpl, pid: Pid) -> Result<Vec<MemoryMap>> {
    let handle = open(platform, pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)?;
    let devices = disk::dos_devices();
    let size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();

    let mut maps = Vec::new();
    let mut address = 0usize;
    loop {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
        // SAFETY: `info` is valid for `size` bytes of writes.
        if unsafe { VirtualQueryEx(handle.raw(), address as *const c_void, info.as_mut_ptr(), size) } == 0 {
            // The walk ends with `ERROR_INVALID_PARAMETER` past the last region.
            if address == 0 {
                return win32_failure(platform, pid, "VirtualQueryEx");
            }
            break;
        }
        // SAFETY: Filled by the call above.
        let info = unsafe { info.assume_init() };
        let base = info.BaseAddress as usize;

        if info.State == MEM_COMMIT && (info.Type == MEM_IMAGE || info.Type == MEM_MAPPED) {
            if let Some(path) = mapped_file_name(&handle, info.BaseAddress) {
                maps.push(MemoryMap {
                    address: format!("{:#x}", base),
                    perms: protection_perms(info.Protect).to_string(),
                    path: disk::to_dos_path(&path, &devices),
                    size: info.RegionSize as u64,
                    rss: info.RegionSize as u64,
                    ..Default::default()
                });
            }
        }

        match base.checked_add(info.RegionSize) {
            Some(next) if next > address => address = next,
            _ => break,
        }
    }
    Ok(maps)
}

pub(super) fn io_counters(platform: &PlatformImpl, pid: Pid) -> Result<IoCounters> {
    let query = || -> Result<IoCounters> {
        let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut counters = MaybeUninit::<IO_COUNTERS>::zeroed();
        // SAFETY: `counters` is valid for writes.
        if unsafe { GetProcessIoCounters(handle.raw(), counters.as_mut_ptr()) } == 0 {
            return win32_failure(platform, pid, "GetProcessIoCounters");
        }
        // SAFETY: Filled by the call above.
        let counters = unsafe { counters.assume_init() };
        Ok(IoCounters {
            read_count: counters.ReadOperationCount,
            write_count: counters.WriteOperationCount,
            read_bytes: counters.ReadTransferCount,
            write_bytes: counters.WriteTransferCount,
        })
    };
    or_snapshot(platform, pid, query(), |entry| entry.io)
}

pub(super) fn num_handles(platform: &PlatformImpl, pid: Pid) -> Result<u64> {
    let query = || -> Result<u64> {
        let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut count = 0u32;
        // SAFETY: `count` is valid for writes.
        if unsafe { GetProcessHandleCount(handle.raw(), &mut count) } == 0 {
            return win32_failure(platform, pid, "GetProcessHandleCount");
        }
        Ok(u64::from(count))
    };
    or_snapshot(platform, pid, query(), |entry| entry.handle_count)
}

pub(super) fn priority_class(platform: &PlatformImpl, pid: Pid) -> Result<i32> {
    let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    // SAFETY: `GetPriorityClass` has no pointer arguments.
    match unsafe { GetPriorityClass(handle.raw()) } {
        0 => win32_failure(platform, pid, "GetPriorityClass"),
        class => Ok(class as i32),
    }
}

fn invalid_input(syscall: &str, detail: String) -> Error {
    Error::Os {
        syscall: syscall.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, detail),
    }
}

pub(super) fn set_priority_class(platform: &PlatformImpl, pid: Pid, value: i32) -> Result<()> {
    let class = value as u32;
    if !PRIORITY_CLASSES.contains(&class) {
        return Err(invalid_input("SetPriorityClass", format!("{:#x} is not a priority class", value)));
    }
    let handle = open(platform, pid, PROCESS_SET_INFORMATION)?;
    // SAFETY: `SetPriorityClass` has no pointer arguments.
    if unsafe { SetPriorityClass(handle.raw(), class) } == 0 {
        return win32_failure(platform, pid, "SetPriorityClass");
    }
    Ok(())
}

fn mask_to_cpus(mask: usize) -> Vec<usize> {
    (0..usize::BITS as usize).filter(|cpu| mask & (1 << cpu) != 0).collect()
}

/// Builds an affinity mask, rejecting CPUs the system doesn't have.
fn cpus_to_mask(cpus: &[usize], system_mask: usize) -> Option<usize> {
    let mut mask = 0usize;
    for cpu in cpus {
        let bit = 1usize.checked_shl(u32::try_from(*cpu).ok()?)?;
        if system_mask & bit == 0 {
            return None;
        }
        mask |= bit;
    }
    (mask != 0).then_some(mask)
}

fn affinity_masks(platform: &PlatformImpl, pid: Pid, handle: &HandleGuard) -> Result<(usize, usize)> {
    let (mut process, mut system) = (0usize, 0usize);
    // SAFETY: Both masks are valid for writes.
    if unsafe { GetProcessAffinityMask(handle.raw(), &mut process, &mut system) } == 0 {
        return win32_failure(platform, pid, "GetProcessAffinityMask");
    }
    Ok((process, system))
}

pub(super) fn cpu_affinity(platform: &PlatformImpl, pid: Pid) -> Result<Vec<usize>> {
    let handle = open(platform, pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
    let (process, _) = affinity_masks(platform, pid, &handle)?;
    Ok(mask_to_cpus(process))
}

pub(super) fn set_cpu_affinity(platform: &PlatformImpl, pid: Pid, cpus: &[usize]) -> Result<()> {
    let handle = open(platform, pid, PROCESS_SET_INFORMATION)?;
    let (_, system) = affinity_masks(platform, pid, &handle)?;
    let mask = cpus_to_mask(cpus, system)
        .ok_or_else(|| invalid_input("SetProcessAffinityMask", format!("invalid CPU set {:?}", cpus)))?;
    // SAFETY: `SetProcessAffinityMask` has no pointer arguments.
    if unsafe { SetProcessAffinityMask(handle.raw(), mask) } == 0 {
        return win32_failure(platform, pid, "SetProcessAffinityMask");
    }
    Ok(())
}

pub(super) fn terminate(platform: &PlatformImpl, pid: Pid) -> Result<()> {
    let handle = open(platform, pid, PROCESS_TERMINATE)?;
    // SAFETY: `TerminateProcess` has no pointer arguments.
    if unsafe { TerminateProcess(handle.raw(), TERMINATE_EXIT_CODE) } == 0 {
        return win32_failure(platform, pid, "TerminateProcess");
    }
    Ok(())
}

pub(super) fn suspend(platform: &PlatformImpl, pid: Pid) -> Result<()> {
    let handle = open(platform, pid, PROCESS_SUSPEND_RESUME)?;
    // SAFETY: The handle is open with suspend rights.
    let status = unsafe { ffi::NtSuspendProcess(handle.raw()) };
    if status < 0 {
        return Err(nt_error("NtSuspendProcess", status)).classify_for(platform, pid);
    }
    Ok(())
}

pub(super) fn resume(platform: &PlatformImpl, pid: Pid) -> Result<()> {
    let handle = open(platform, pid, PROCESS_SUSPEND_RESUME)?;
    // SAFETY: The handle is open with resume rights.
    let status = unsafe { ffi::NtResumeProcess(handle.raw()) };
    if status < 0 {
        return Err(nt_error("NtResumeProcess", status)).classify_for(platform, pid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_bytes(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn command_lines() {
        assert_eq!(
            split_command_line(r#""C:\Program Files\app.exe" -a "b c" d\"e "f\\" g"#),
            vec![r"C:\Program Files\app.exe", "-a", "b c", r#"d"e"#, r"f\", "g"]
        );
        assert_eq!(split_command_line(r"C:\app.exe  x\\y"), vec![r"C:\app.exe", r"x\\y"]);
        assert_eq!(split_command_line(r#"app "a""b" """#), vec!["app", r#"a"b"#, ""]);
        assert!(split_command_line("").is_empty());
    }

    #[test]
    fn environment_blocks() {
        let mut block = wide_bytes("A=1\0=C:=C:\\\0PATH=x\0\0");
        block.extend_from_slice(&wide_bytes("STALE=1\0"));
        assert_eq!(split_environment(&block), vec!["A=1", "=C:=C:\\", "PATH=x"]);
    }

    #[test]
    fn working_directories() {
        assert_eq!(trim_dir(r"C:\Users\me\".to_string()), r"C:\Users\me");
        assert_eq!(trim_dir(r"C:\".to_string()), r"C:\");
    }

    #[test]
    fn affinity_masks_round_trip_through_cpu_lists() {
        assert_eq!(mask_to_cpus(0b1011), vec![0, 1, 3]);
        assert_eq!(cpus_to_mask(&[0, 3], 0b1111), Some(0b1001));
        assert_eq!(cpus_to_mask(&[4], 0b1111), None);
        assert_eq!(cpus_to_mask(&[], 0b1111), None);
        assert_eq!(cpus_to_mask(&[200], usize::MAX), None);
    }

    #[test]
    fn page_protections() {
        assert_eq!(protection_perms(0x04), "rw-");
        assert_eq!(protection_perms(0x20 | 0x100), "r-x");
        assert_eq!(protection_perms(0x01), "---");
    }

    #[test]
    fn process_snapshot() {
        let process_size = std::mem::size_of::<ffi::SystemProcessInformation>();
        let thread_size = std::mem::size_of::<ffi::SystemThreadInformation>();
        let second = process_size + thread_size;
        let name_offset = second + process_size;
        let name = wide_bytes("app.exe");

        let mut bytes = vec![0u8; name_offset + name.len()];
        bytes[name_offset..].copy_from_slice(&name);
        let base = bytes.as_ptr() as usize;

        // SAFETY: Both structs are plain old data.
        let mut idle: ffi::SystemProcessInformation = unsafe { std::mem::zeroed() };
        idle.NextEntryOffset = second as u32;
        idle.NumberOfThreads = 1;
        let mut thread: ffi::SystemThreadInformation = unsafe { std::mem::zeroed() };
        thread.ClientId.UniqueThread = 8;
        thread.UserTime = 20_000_000;
        thread.ContextSwitches = 3;
        thread.ThreadState = ffi::THREAD_STATE_WAITING;
        thread.WaitReason = ffi::WAIT_REASON_SUSPENDED;

        let mut app: ffi::SystemProcessInformation = unsafe { std::mem::zeroed() };
        app.UniqueProcessId = 42;
        app.InheritedFromUniqueProcessId = 7;
        app.WorkingSetSize = 4096;
        app.ImageName = ffi::UnicodeString {
            Length: name.len() as u16,
            MaximumLength: name.len() as u16,
            Buffer: (base + name_offset) as *mut u16,
        };

        // SAFETY: Each write is in bounds of `bytes`, and unaligned writes have no alignment requirement.
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut ffi::SystemProcessInformation, idle);
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(process_size) as *mut ffi::SystemThreadInformation, thread);
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(second) as *mut ffi::SystemProcessInformation, app);
        }

        let processes = parse_process_list(&bytes);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].name, "System Idle Process");
        assert_eq!(processes[0].threads[0].tid, 8);
        assert_eq!(processes[0].threads[0].user, 2.0);
        assert_eq!(processes[0].status(), ProcessStatus::Stopped);
        assert_eq!(processes[1].pid, 42);
        assert_eq!(processes[1].ppid, 7);
        assert_eq!(processes[1].name, "app.exe");
        assert_eq!(processes[1].memory.rss, 4096);
        assert_eq!(processes[1].status(), ProcessStatus::Running);
    }
}
