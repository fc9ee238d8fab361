//! Open files, found by walking the system handle table.
//!
//! Every handle the process owns is duplicated into our process and asked for its path. `GetFinalPathNameByHandleW`
//! (and `GetFileType`) can block forever on some pipe handles, so each handle is queried on a native worker thread
//! with a deadline, and a worker that overruns is terminated.

use std::{ffi::c_void, ptr};

use windows_sys::Win32::{
    Foundation::{DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_OBJECT_0},
    Storage::FileSystem::{
        GetFileInformationByHandle, GetFileType, GetFinalPathNameByHandleW, BY_HANDLE_FILE_INFORMATION,
        FILE_ATTRIBUTE_DIRECTORY, FILE_NAME_NORMALIZED, FILE_TYPE_DISK,
    },
    System::Threading::{CreateThread, GetCurrentProcess, TerminateThread, WaitForSingleObject, PROCESS_DUP_HANDLE},
};

use super::{ffi, from_wide, proc, query_system_information, HandleGuard, PlatformImpl};
use crate::{
    bounded::timed_out,
    buffer::read_record,
    error::Result,
    types::{OpenFile, Pid},
};

const PATH_CHARS: usize = 32_768;

/// Values of the handles `pid` owns, from a `SystemExtendedHandleInformation` table.
pub(super) fn handles_of(bytes: &[u8], pid: Pid) -> Vec<usize> {
    let Some(header) = read_record::<ffi::SystemHandleInformationEx>(bytes, 0) else {
        return Vec::new();
    };
    let start = std::mem::size_of::<ffi::SystemHandleInformationEx>();
    let size = std::mem::size_of::<ffi::SystemHandleTableEntryInfoEx>();
    (0..header.NumberOfHandles)
        .map_while(|i| read_record::<ffi::SystemHandleTableEntryInfoEx>(bytes, start + i * size))
        .filter(|entry| entry.UniqueProcessId == pid as usize)
        .map(|entry| entry.HandleValue)
        .collect()
}

/// Turns `\\?\C:\x` into `C:\x` and `\\?\UNC\host\share` into `\\host\share`.
pub(super) fn strip_path_prefix(path: &str) -> String {
    if let Some(rest) = path.strip_prefix(r"\\?\UNC\") {
        return format!(r"\\{}", rest);
    }
    path.strip_prefix(r"\\?\").unwrap_or(path).to_string()
}

/// State shared with a worker thread. Owned by the worker's caller until the worker is abandoned.
struct PathQuery {
    handle: HANDLE,
    path: Vec<u16>,
    len: u32,
}

unsafe extern "system" fn query_path(param: *mut c_void) -> u32 {
    // SAFETY: `param` is the `PathQuery` handed to `CreateThread`, alive until this thread is done or terminated.
    let query = &mut *(param as *mut PathQuery);

    if GetFileType(query.handle) != FILE_TYPE_DISK {
        return 0;
    }
    let mut info = std::mem::zeroed::<BY_HANDLE_FILE_INFORMATION>();
    if GetFileInformationByHandle(query.handle, &mut info) != 0 && info.dwFileAttributes & FILE_ATTRIBUTE_DIRECTORY != 0
    {
        return 0;
    }
    let len = GetFinalPathNameByHandleW(
        query.handle,
        query.path.as_mut_ptr(),
        query.path.len() as u32,
        FILE_NAME_NORMALIZED,
    );
    if (len as usize) < query.path.len() {
        query.len = len;
    }
    0
}

/// Resolves the path of a duplicated handle, or `None` for anything that isn't a regular file on disk.
fn path_of(platform: &PlatformImpl, handle: &HandleGuard) -> Result<Option<String>> {
    let query = Box::into_raw(Box::new(PathQuery {
        handle: handle.raw(),
        path: vec![0; PATH_CHARS],
        len: 0,
    }));

    // SAFETY: `query_path` matches `LPTHREAD_START_ROUTINE`, and `query` outlives the thread unless it's leaked below.
    let thread = unsafe {
        CreateThread(ptr::null(), 0, Some(query_path), query as *const c_void, 0, ptr::null_mut())
    };
    let Some(thread) = HandleGuard::new(thread) else {
        // SAFETY: No thread was started, so the box is still ours.
        drop(unsafe { Box::from_raw(query) });
        return Err(crate::error::Error::last_os_error("CreateThread"));
    };

    let timeout = platform.context.hanging_call_timeout().as_millis().min(u128::from(u32::MAX - 1)) as u32;
    // SAFETY: `thread` is a valid thread handle.
    if unsafe { WaitForSingleObject(thread.raw(), timeout) } != WAIT_OBJECT_0 {
        // SAFETY: The thread is stuck in a kernel call on a handle only it uses.
        unsafe { TerminateThread(thread.raw(), 1) };
        // The thread may die holding a borrow of `query`, so it's leaked rather than freed.
        return Err(timed_out("GetFinalPathNameByHandleW"));
    }

    // SAFETY: The worker has exited, so the box is ours again.
    let query = unsafe { Box::from_raw(query) };
    if query.len == 0 {
        return Ok(None);
    }
    Ok(Some(strip_path_prefix(&from_wide(&query.path[..query.len as usize]))))
}

pub(super) fn open_files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<OpenFile>> {
    let process = proc::open(platform, pid, PROCESS_DUP_HANDLE)?;
    let table = query_system_information(
        platform,
        ffi::SYSTEM_EXTENDED_HANDLE_INFORMATION,
        "NtQuerySystemInformation(SystemExtendedHandleInformation)",
        1024 * 1024,
    )?;

    let mut files = Vec::new();
    for value in handles_of(table.bytes(), pid) {
        let mut duplicate: HANDLE = ptr::null_mut();
        // SAFETY: `duplicate` is valid for writes; `value` is only interpreted by the kernel.
        let ok = unsafe {
            DuplicateHandle(
                process.raw(),
                value as HANDLE,
                GetCurrentProcess(),
                &mut duplicate,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        // Handles close all the time, and some refuse duplication.
        let Some(duplicate) = HandleGuard::new(duplicate).filter(|_| ok != 0) else {
            continue;
        };

        match path_of(platform, &duplicate) {
            Ok(Some(path)) => files.push(OpenFile { path, fd: -1 }),
            Ok(None) => {}
            Err(e) => platform.swallowed("open file handle", &e),
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_prefixes() {
        assert_eq!(strip_path_prefix(r"\\?\C:\Windows\notepad.exe"), r"C:\Windows\notepad.exe");
        assert_eq!(strip_path_prefix(r"\\?\UNC\host\share\f.txt"), r"\\host\share\f.txt");
        assert_eq!(strip_path_prefix(r"C:\plain"), r"C:\plain");
    }

    #[test]
    fn handle_table_filtering() {
        let header = std::mem::size_of::<ffi::SystemHandleInformationEx>();
        let size = std::mem::size_of::<ffi::SystemHandleTableEntryInfoEx>();
        let mut bytes = vec![0u8; header + 3 * size];

        let mut head: ffi::SystemHandleInformationEx = unsafe { std::mem::zeroed() };
        head.NumberOfHandles = 3;
        // SAFETY: Unaligned writes of plain old data, in bounds.
        unsafe {
            ptr::write_unaligned(bytes.as_mut_ptr() as *mut ffi::SystemHandleInformationEx, head);
            for (i, (pid, value)) in [(10usize, 4usize), (11, 8), (10, 12)].into_iter().enumerate() {
                let mut entry: ffi::SystemHandleTableEntryInfoEx = std::mem::zeroed();
                entry.UniqueProcessId = pid;
                entry.HandleValue = value;
                ptr::write_unaligned(
                    bytes.as_mut_ptr().add(header + i * size) as *mut ffi::SystemHandleTableEntryInfoEx,
                    entry,
                );
            }
        }

        assert_eq!(handles_of(&bytes, 10), vec![4, 12]);
        assert!(handles_of(&bytes, 99).is_empty());
        // A count larger than the buffer stops at the end of the buffer.
        assert_eq!(handles_of(&bytes[..header + size], 10), vec![4]);
    }

    #[test]
    fn own_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held.txt");
        let _file = std::fs::File::create(&path).unwrap();

        let platform = PlatformImpl::new(crate::context::BindingContext::builder().testing(true).build());
        let files = open_files(&platform, std::process::id() as Pid).unwrap();
        assert!(files.iter().any(|f| f.path.to_lowercase().ends_with("held.txt")));
    }
}
