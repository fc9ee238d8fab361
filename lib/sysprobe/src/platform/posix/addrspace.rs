//! Reading argument and environment vectors out of another process's address space (`/proc/<pid>/as`).

use std::{fs::File, os::unix::fs::FileExt};

use crate::error::{Error, Result};

/// Upper bound on how far a single string is chased through the address space.
const MAX_STRING_LEN: usize = 128 * 1024;

/// Upper bound on environment entries, since the vector is only NULL terminated.
const MAX_ENV_ENTRIES: usize = 8 * 1024;

/// Positioned reads, so fixtures can stand in for a real address space.
pub(crate) trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

/// A process address space, read at virtual addresses.
pub(crate) struct AddressSpace<R> {
    reader: R,
    pointer_size: usize,
}

fn pread_error(address: u64, source: std::io::Error) -> Error {
    Error::Os {
        syscall: format!("pread(as, {:#x})", address),
        source,
    }
}

impl<R: ReadAt> AddressSpace<R> {
    /// `pointer_size` is the target's, 4 or 8 bytes.
    pub(crate) fn new(reader: R, pointer_size: usize) -> Self {
        Self {
            reader,
            pointer_size: if pointer_size == 4 { 4 } else { 8 },
        }
    }

    fn read_exact_at(&self, buf: &mut [u8], address: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let n = self.reader.read_at(&mut buf[done..], at).map_err(|e| pread_error(at, e))?;
            if n == 0 {
                return Err(pread_error(at, std::io::ErrorKind::UnexpectedEof.into()));
            }
            done += n;
        }
        Ok(())
    }

    fn pointer(&self, address: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact_at(&mut raw[..self.pointer_size], address)?;
        Ok(if self.pointer_size == 4 {
            u64::from(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
        } else {
            u64::from_ne_bytes(raw)
        })
    }

    /// A NUL-terminated string, read in chunks.
    fn string(&self, address: u64) -> Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        while out.len() < MAX_STRING_LEN {
            let at = address + out.len() as u64;
            let n = self.reader.read_at(&mut chunk, at).map_err(|e| pread_error(at, e))?;
            if n == 0 {
                break;
            }
            if let Some(end) = chunk[..n].iter().position(|b| *b == 0) {
                out.extend_from_slice(&chunk[..end]);
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Strings from a pointer vector: `count` of them, or up to the first NULL.
    fn strings(&self, vector: u64, count: Option<usize>) -> Result<Vec<String>> {
        let limit = count.unwrap_or(MAX_ENV_ENTRIES);
        let mut strings = Vec::new();
        for i in 0..limit {
            let pointer = self.pointer(vector + (i * self.pointer_size) as u64)?;
            if pointer == 0 {
                break;
            }
            strings.push(self.string(pointer)?);
        }
        Ok(strings)
    }

    /// The `argc` strings of an argument vector.
    pub(crate) fn argv(&self, vector: u64, argc: usize) -> Result<Vec<String>> {
        self.strings(vector, Some(argc))
    }

    /// The strings of a NULL terminated environment vector.
    pub(crate) fn envp(&self, vector: u64) -> Result<Vec<String>> {
        self.strings(vector, None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// A sparse fake address space.
    struct Fake(BTreeMap<u64, Vec<u8>>);

    impl ReadAt for Fake {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            for (start, bytes) in &self.0 {
                let end = start + bytes.len() as u64;
                if (*start..end).contains(&offset) {
                    let from = (offset - start) as usize;
                    let n = buf.len().min(bytes.len() - from);
                    buf[..n].copy_from_slice(&bytes[from..from + n]);
                    return Ok(n);
                }
            }
            Err(std::io::ErrorKind::InvalidInput.into())
        }
    }

    #[test]
    fn vectors_from_a_32_bit_process() {
        let mut space = BTreeMap::new();
        let mut vector = Vec::new();
        for pointer in [0x2000u32, 0x2010, 0] {
            vector.extend_from_slice(&pointer.to_ne_bytes());
        }
        space.insert(0x1000, vector);
        space.insert(0x2000, b"ls\0".to_vec());
        space.insert(0x2010, b"-l\0".to_vec());

        let space = AddressSpace::new(Fake(space), 4);
        assert_eq!(space.argv(0x1000, 2).unwrap(), vec!["ls", "-l"]);
        assert_eq!(space.argv(0x1000, 1).unwrap(), vec!["ls"]);
        assert_eq!(space.envp(0x1000).unwrap(), vec!["ls", "-l"]);
    }

    #[test]
    fn vectors_from_a_64_bit_process() {
        let mut space = BTreeMap::new();
        let mut vector = Vec::new();
        for pointer in [0x5000u64, 0] {
            vector.extend_from_slice(&pointer.to_ne_bytes());
        }
        space.insert(0x4000, vector);
        space.insert(0x5000, b"HOME=/root\0junk".to_vec());

        let space = AddressSpace::new(Fake(space), 8);
        assert_eq!(space.envp(0x4000).unwrap(), vec!["HOME=/root"]);
        assert!(space.argv(0x4000, 0).unwrap().is_empty());
    }

    #[test]
    fn unmapped_vectors_fail() {
        let space = AddressSpace::new(Fake(BTreeMap::new()), 8);
        assert!(space.argv(0x9000, 1).is_err());
    }
}
