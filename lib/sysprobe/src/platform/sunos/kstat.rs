//! `libkstat` bindings and a guard around a kstat chain.

#![allow(non_camel_case_types, dead_code)]

use std::{
    ffi::{c_void, CStr},
    io,
};

use libc::{c_char, c_int, c_uint, c_uchar};

use crate::{
    error::{Error, Result},
    platform::posix::c_chars_to_string,
};

const KSTAT_STRLEN: usize = 31;

pub(super) const KSTAT_TYPE_NAMED: u8 = 1;
pub(super) const KSTAT_TYPE_IO: u8 = 3;

const KSTAT_DATA_CHAR: u8 = 0;
const KSTAT_DATA_INT32: u8 = 1;
const KSTAT_DATA_UINT32: u8 = 2;
const KSTAT_DATA_INT64: u8 = 3;
const KSTAT_DATA_UINT64: u8 = 4;

#[repr(C)]
pub(super) struct kstat_t {
    pub ks_crtime: i64,
    pub ks_next: *mut kstat_t,
    pub ks_kid: c_int,
    pub ks_module: [c_char; KSTAT_STRLEN],
    pub ks_resv: c_uchar,
    pub ks_instance: c_int,
    pub ks_name: [c_char; KSTAT_STRLEN],
    pub ks_type: c_uchar,
    pub ks_class: [c_char; KSTAT_STRLEN],
    pub ks_flags: c_uchar,
    pub ks_data: *mut c_void,
    pub ks_ndata: c_uint,
    pub ks_data_size: usize,
    pub ks_snaptime: i64,
    pub ks_update: *mut c_void,
    pub ks_private: *mut c_void,
    pub ks_snapshot: *mut c_void,
    pub ks_lock: *mut c_void,
}

#[repr(C)]
pub(super) struct kstat_ctl_t {
    pub kc_chain_id: c_int,
    pub kc_chain: *mut kstat_t,
    pub kc_kd: c_int,
}

/// `kstat_named_t`: a name, a type tag, and a 16-byte value union.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct kstat_named_t {
    pub name: [c_char; KSTAT_STRLEN],
    pub data_type: c_uchar,
    pub value: [u64; 2],
}

/// `kstat_io_t`
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct kstat_io_t {
    pub nread: u64,
    pub nwritten: u64,
    pub reads: c_uint,
    pub writes: c_uint,
    pub wtime: i64,
    pub wlentime: i64,
    pub wlastupdate: i64,
    pub rtime: i64,
    pub rlentime: i64,
    pub rlastupdate: i64,
    pub wcnt: c_uint,
    pub rcnt: c_uint,
}

#[link(name = "kstat")]
extern "C" {
    fn kstat_open() -> *mut kstat_ctl_t;
    fn kstat_close(kc: *mut kstat_ctl_t) -> c_int;
    fn kstat_read(kc: *mut kstat_ctl_t, ksp: *mut kstat_t, buf: *mut c_void) -> c_int;
}

/// Decodes a named value as an unsigned integer; signed values below zero and character data read as `None`.
pub(super) fn named_value(named: &kstat_named_t) -> Option<u64> {
    let word = named.value[0];
    // 32-bit members sit at the start of the union, whatever the byte order.
    let bytes = word.to_ne_bytes();
    let half = [bytes[0], bytes[1], bytes[2], bytes[3]];
    match named.data_type {
        KSTAT_DATA_INT32 => u64::try_from(i32::from_ne_bytes(half)).ok(),
        KSTAT_DATA_UINT32 => Some(u64::from(u32::from_ne_bytes(half))),
        KSTAT_DATA_INT64 => u64::try_from(word as i64).ok(),
        KSTAT_DATA_UINT64 => Some(word),
        _ => None,
    }
}

/// An open kstat chain, closed on drop.
pub(super) struct KstatGuard {
    kc: *mut kstat_ctl_t,
}

/// Identity of one kstat in the chain.
pub(super) struct KstatRef<'a> {
    ksp: *mut kstat_t,
    _owner: &'a KstatGuard,
}

impl KstatGuard {
    pub(super) fn open() -> Result<Self> {
        // SAFETY: `kstat_open` has no arguments.
        let kc = unsafe { kstat_open() };
        if kc.is_null() {
            return Err(Error::last_os_error("kstat_open"));
        }
        Ok(Self { kc })
    }

    /// Every kstat in the chain.
    pub(super) fn iter(&self) -> impl Iterator<Item = KstatRef<'_>> {
        // SAFETY: The chain head is valid while the control structure is open.
        let mut next = unsafe { (*self.kc).kc_chain };
        std::iter::from_fn(move || {
            if next.is_null() {
                return None;
            }
            let ksp = next;
            // SAFETY: Chain entries stay valid until the control structure is closed.
            next = unsafe { (*ksp).ks_next };
            Some(KstatRef { ksp, _owner: self })
        })
    }

    /// Kstats matching a module, and a name when one is given.
    pub(super) fn find<'a>(&'a self, module: &'a str, name: Option<&'a str>) -> impl Iterator<Item = KstatRef<'a>> {
        self.iter()
            .filter(move |ks| ks.module() == module && name.map_or(true, |name| ks.name() == name))
    }

    /// Snapshots a kstat's data, returning it as raw bytes.
    pub(super) fn read(&self, ks: &KstatRef<'_>) -> Result<Vec<u8>> {
        // SAFETY: `ksp` is in the chain of `kc`; a null buffer asks libkstat to use the kstat's own data area.
        if unsafe { kstat_read(self.kc, ks.ksp, std::ptr::null_mut()) } == -1 {
            let source = io::Error::last_os_error();
            return Err(Error::Os {
                syscall: format!("kstat_read({}:{}:{})", ks.module(), ks.instance(), ks.name()),
                source,
            });
        }
        // SAFETY: After a successful read, `ks_data` holds `ks_data_size` bytes.
        let (data, size) = unsafe { ((*ks.ksp).ks_data, (*ks.ksp).ks_data_size) };
        if data.is_null() {
            return Ok(Vec::new());
        }
        // SAFETY: As above.
        Ok(unsafe { std::slice::from_raw_parts(data as *const u8, size) }.to_vec())
    }

    /// Snapshots a named kstat into name/value pairs.
    pub(super) fn read_named(&self, ks: &KstatRef<'_>) -> Result<Vec<(String, Option<u64>)>> {
        let bytes = self.read(ks)?;
        Ok(crate::buffer::read_records::<kstat_named_t>(&bytes)
            .iter()
            .map(|named| (c_chars_to_string(&named.name), named_value(named)))
            .collect())
    }

    /// The value of one named statistic.
    pub(super) fn named(&self, ks: &KstatRef<'_>, key: &str) -> Result<Option<u64>> {
        Ok(self
            .read_named(ks)?
            .into_iter()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| value))
    }

    /// The value of a string-typed named statistic.
    pub(super) fn named_string(&self, ks: &KstatRef<'_>, key: &str) -> Result<Option<String>> {
        let bytes = self.read(ks)?;
        Ok(crate::buffer::read_records::<kstat_named_t>(&bytes)
            .iter()
            .find(|named| c_chars_to_string(&named.name) == key && named.data_type == KSTAT_DATA_CHAR)
            .map(|named| {
                let raw = named.value.iter().flat_map(|word| word.to_ne_bytes()).collect::<Vec<_>>();
                CStr::from_bytes_until_nul(&raw)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&raw).into_owned())
            }))
    }
}

impl Drop for KstatGuard {
    fn drop(&mut self) {
        // SAFETY: `kc` came from `kstat_open` and is closed exactly once.
        unsafe { kstat_close(self.kc) };
    }
}

impl KstatRef<'_> {
    fn header(&self) -> &kstat_t {
        // SAFETY: The entry lives as long as the guard this borrows.
        unsafe { &*self.ksp }
    }

    pub(super) fn module(&self) -> String {
        c_chars_to_string(&self.header().ks_module)
    }

    pub(super) fn name(&self) -> String {
        c_chars_to_string(&self.header().ks_name)
    }

    pub(super) fn class(&self) -> String {
        c_chars_to_string(&self.header().ks_class)
    }

    pub(super) fn instance(&self) -> i32 {
        self.header().ks_instance
    }

    pub(super) fn kind(&self) -> u8 {
        self.header().ks_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(data_type: u8, word: u64) -> kstat_named_t {
        kstat_named_t {
            name: [0; KSTAT_STRLEN],
            data_type,
            value: [word, 0],
        }
    }

    fn named32(data_type: u8, bytes: [u8; 4]) -> kstat_named_t {
        let mut word = [0u8; 8];
        word[..4].copy_from_slice(&bytes);
        named(data_type, u64::from_ne_bytes(word))
    }

    #[test]
    fn named_values() {
        assert_eq!(named_value(&named(KSTAT_DATA_UINT64, 1 << 40)), Some(1 << 40));
        assert_eq!(named_value(&named32(KSTAT_DATA_UINT32, 7u32.to_ne_bytes())), Some(7));
        assert_eq!(named_value(&named32(KSTAT_DATA_INT32, (-1i32).to_ne_bytes())), None);
        assert_eq!(named_value(&named(KSTAT_DATA_CHAR, 1)), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn layouts() {
        assert_eq!(std::mem::size_of::<kstat_named_t>(), 48);
        assert_eq!(std::mem::size_of::<kstat_io_t>(), 80);
    }

    #[test]
    fn system_misc() {
        let kstat = KstatGuard::open().unwrap();
        let misc = kstat.find("unix", Some("system_misc")).next().unwrap();
        assert!(kstat.named(&misc, "boot_time").unwrap().unwrap() > 0);
    }
}
