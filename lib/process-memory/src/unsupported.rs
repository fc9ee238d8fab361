use std::io;

use crate::{Footprint, Target};

/// A memory usage querier.
///
/// This platform has no supported memory footprint source, so every query fails with `Unsupported`.
pub struct Querier {
    _target: Target,
}

impl Querier {
    /// Creates a querier for the given target.
    pub fn new(target: Target) -> Self {
        Self { _target: target }
    }

    /// Always returns `None` on this platform.
    pub fn resident_set_size(&mut self) -> Option<usize> {
        None
    }

    /// Always fails on this platform.
    pub fn footprint(&mut self) -> io::Result<Footprint> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "memory footprint is not supported on this platform",
        ))
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new(Target::Current)
    }
}
