//! `sysctl(3)` wrappers.

use std::{io, mem::MaybeUninit};

use libc::{c_int, c_uint, c_void};

use crate::{
    buffer::{grow_until_fits, BufferPolicy, Fill},
    error::{Error, Result},
};

/// Reads a variable-length node as raw bytes.
///
/// The size is asked for first, then the node is read with room to spare, growing the buffer if the table got larger
/// in between (`ENOMEM`).
pub(crate) fn read_bytes(policy: &BufferPolicy, mib: &[c_int], syscall: &str) -> Result<Vec<u8>> {
    let mut needed = 0usize;
    // SAFETY: A null `oldp` only asks for the size, which is written to `needed`.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as c_uint,
            std::ptr::null_mut(),
            &mut needed,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        return Err(Error::last_os_error(syscall));
    }

    grow_until_fits::<u8, _>(policy, syscall, needed, |buf| {
        let mut len = buf.len();
        // SAFETY: `buf` is valid for `len` bytes of writes.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr() as *mut c_int,
                mib.len() as c_uint,
                buf.as_mut_ptr() as *mut c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc == -1 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::ENOMEM) {
                return Ok(Fill::TooSmall(None));
            }
            return Err(Error::Os {
                syscall: syscall.to_string(),
                source: error,
            });
        }
        Ok(Fill::Done(len))
    })
}

/// Reads a fixed-size node.
///
/// `T` must be plain old data. Nodes shorter than `T` leave the remaining bytes zeroed.
pub(crate) fn value<T: Copy>(mib: &[c_int], syscall: &str) -> Result<T> {
    let mut value = MaybeUninit::<T>::zeroed();
    let mut len = std::mem::size_of::<T>();
    // SAFETY: `value` is valid for `len` bytes of writes.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as c_uint,
            value.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        return Err(Error::last_os_error(syscall));
    }
    // SAFETY: The value was zeroed before the kernel wrote into it, and `T` is plain old data.
    Ok(unsafe { value.assume_init() })
}

/// Reads a fixed-size node by name.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
pub(crate) fn value_by_name<T: Copy>(name: &str) -> Result<T> {
    let c_name = std::ffi::CString::new(name).map_err(|_| Error::Os {
        syscall: "sysctlbyname".to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"),
    })?;

    let mut value = MaybeUninit::<T>::zeroed();
    let mut len = std::mem::size_of::<T>();
    // SAFETY: `c_name` is NUL terminated and `value` is valid for `len` bytes of writes.
    let rc = unsafe {
        libc::sysctlbyname(
            c_name.as_ptr(),
            value.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        let error = io::Error::last_os_error();
        // Nodes that don't exist on this kernel or hardware.
        if error.raw_os_error() == Some(libc::ENOENT) {
            return Err(Error::unsupported(name));
        }
        return Err(Error::Os {
            syscall: format!("sysctlbyname({})", name),
            source: error,
        });
    }
    // SAFETY: As above.
    Ok(unsafe { value.assume_init() })
}

/// Upper bound on MIB components (`CTL_MAXNAME`).
#[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
const MAX_MIB_LEN: usize = 24;

/// Translates a node name into its numeric MIB, for nodes that are read as variable-length tables.
#[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
pub(crate) fn mib_by_name(name: &str) -> Result<Vec<c_int>> {
    let c_name = std::ffi::CString::new(name).map_err(|_| Error::Os {
        syscall: "sysctlnametomib".to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"),
    })?;

    let mut mib = [0 as c_int; MAX_MIB_LEN];
    let mut len = mib.len();
    // SAFETY: `c_name` is NUL terminated and `mib` has room for `len` components.
    if unsafe { libc::sysctlnametomib(c_name.as_ptr(), mib.as_mut_ptr(), &mut len) } == -1 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ENOENT) {
            return Err(Error::unsupported(name));
        }
        return Err(Error::Os {
            syscall: format!("sysctlnametomib({})", name),
            source: error,
        });
    }
    Ok(mib[..len].to_vec())
}

/// Boot time from `kern.boottime`, as seconds since the Unix epoch.
pub(crate) fn boot_time() -> Result<f64> {
    let boottime: libc::timeval = value(&[libc::CTL_KERN, libc::KERN_BOOTTIME], "sysctl(kern.boottime)")?;
    Ok(boottime.tv_sec as f64 + boottime.tv_usec as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_time_is_plausible() {
        let boot_time = boot_time().unwrap();
        assert!(boot_time > 1_000_000_000.0);
    }

    #[test]
    fn ostype_reads_as_bytes() {
        let bytes = read_bytes(&BufferPolicy::default(), &[libc::CTL_KERN, libc::KERN_OSTYPE], "sysctl(kern.ostype)").unwrap();
        assert!(bytes.ends_with(b"\0"));
        assert!(bytes.len() > 1);
    }
}
