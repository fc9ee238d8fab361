//! Application bootstrap primitives.
//!
//! This crate provides the pieces a binary needs before it issues its first query: logging initialization and a way to
//! bail out cleanly when bootstrap fails.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
