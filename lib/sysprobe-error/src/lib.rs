//! Generic error handling for the outer layers of `sysprobe`.
//!
//! The binding layer itself reports failures through its own typed error (see `sysprobe::Error`), since callers need to
//! distinguish between a process that vanished, a permission boundary, and so on. Everything above it (configuration
//! loading, logging bootstrap, the CLI) only needs to attach context and print a readable chain, which is what this
//! crate provides.
use std::fmt::{Display, Write as _};

pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: We wrap `anyhow::Context` so the extension methods don't overlap with `snafu::ResultExt` in modules that use
// both.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// Renders an error and its entire cause chain on a single line.
///
/// Each cause is separated by `": "`, outermost first. Multi-line output from `{:?}` tends to break line-oriented log
/// formats, so this is the preferred way to log a fatal error.
pub fn render_chain(error: &GenericError) -> String {
    let mut rendered = String::new();
    for (idx, cause) in error.chain().enumerate() {
        if idx > 0 {
            rendered.push_str(": ");
        }
        let _ = write!(rendered, "{}", cause);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn chain_renders_on_one_line() {
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        let error = result
            .error_context("Failed to open configuration.")
            .unwrap_err()
            .context("Failed to bootstrap.");

        assert_eq!(
            render_chain(&error),
            "Failed to bootstrap.: Failed to open configuration.: no such file"
        );
    }

    #[test]
    fn lazy_context_only_evaluated_on_error() {
        let mut evaluated = false;
        let result: Result<u32, io::Error> = Ok(42);
        let value = result
            .with_error_context(|| {
                evaluated = true;
                "unused"
            })
            .unwrap();

        assert_eq!(value, 42);
        assert!(!evaluated);
    }

    #[test]
    fn macro_forms() {
        let literal = generic_error!("plain message");
        assert_eq!(literal.to_string(), "plain message");

        let formatted = generic_error!("pid {} vanished", 7);
        assert_eq!(formatted.to_string(), "pid 7 vanished");
    }
}
