//! World-stop coordination for the Gazer snapshot engine.
//!
//! This crate owns the three mechanisms that make pausing a live process
//! survivable:
//!
//! - **Safe reads** ([`try_read`]): a memory copy whose SIGSEGV is turned
//!   into a `false` return instead of a crash, via a recovery point armed
//!   around the copy and a handler that checks the faulting PC against the
//!   copy routine's instruction range.
//! - **Signal handling** ([`signal`]): a process-wide singleton holding the
//!   published instruction range, the recovery buffer, and the previously
//!   installed SIGSEGV action (faults outside the range chain to it).
//! - **The world stop** ([`stop_the_world`]): pins the calling thread,
//!   serializes snapshots behind one mutex, installs the handler, invokes
//!   the host runtime's halt primitive through a version-selected binding,
//!   runs the body, and unwinds all of it in reverse order.
//!
//! # Platform Support
//!
//! | Platform       | Mechanism                          |
//! |----------------|------------------------------------|
//! | Linux x86_64   | SIGSEGV via sigaction + sigsetjmp  |
//! | Linux aarch64  | SIGSEGV via sigaction + sigsetjmp  |
//! | macOS aarch64  | SIGSEGV/SIGBUS via sigaction       |
//!
//! Anything else is refused by [`platform_supported`] before any side
//! effect.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod platform;
pub mod safe_read;
pub mod signal;
pub mod stw;

pub use platform::platform_supported;
pub use safe_read::{relocation_base, try_read};
pub use stw::{WorldError, stop_the_world};
