//! Fallback for operating systems without a backend: every query fails with [`Error::Unsupported`][crate::Error].

use super::Platform;
use crate::context::BindingContext;

/// A probe that can't answer anything.
pub struct PlatformImpl {
    _context: BindingContext,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        Self { _context: context }
    }
}

impl Platform for PlatformImpl {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn everything_is_unsupported() {
        let probe = PlatformImpl::new(BindingContext::default());
        assert_eq!(probe.boot_time().unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(probe.proc_name(1).unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
