//! Low-level process and system information.
//!
//! This crate is the OS-facing layer of a process/system monitoring library. Each query is a single synchronous round
//! trip to the kernel that returns a plain-data record, or an [`Error`] whose [`kind`][Error::kind] says how to react.
//!
//! ## Usage
//!
//! A [`Probe`] is built from an immutable [`BindingContext`], and answers queries through the [`Platform`] trait:
//!
//! ```no_run
//! use sysprobe::{BindingContext, Platform as _, Probe};
//!
//! let probe = Probe::new(BindingContext::default());
//! let memory = probe.virtual_memory()?;
//! println!("{:.1}% of memory in use", memory.percent());
//! # Ok::<(), sysprobe::Error>(())
//! ```
//!
//! ## Platforms
//!
//! Linux and Android, macOS, FreeBSD, OpenBSD, NetBSD, Windows, Solaris and illumos, AIX, Haiku and Cygwin each have a
//! backend. Queries a backend can't answer fail with [`ErrorKind::Unsupported`]; on any other OS, every query does.

pub mod buffer;
pub mod bounded;
mod classify;
mod context;
mod error;
mod filter;
pub mod loadavg;
mod platform;
pub mod types;

pub use self::{
    classify::check_pid,
    context::{BindingContext, BindingContextBuilder},
    error::{Error, ErrorKind, Result},
    filter::{AddressFamilies, ConnectionFilter, SocketTypes},
    platform::{Platform, PlatformImpl as Probe},
    types::*,
};
