//! Host-runtime introspection for the Gazer snapshot engine.
//!
//! The host runtime is observed, never typed: a coroutine descriptor, the
//! moduledata record, and the memory statistics block are all opaque
//! addresses read at offsets the runtime config declares. This keeps the
//! engine portable across runtime revisions by updating the config, not the
//! code.
//!
//! All observation goes through the [`ReadMemory`] seam. [`LiveMemory`]
//! reads the current process through the signal-protected safe read;
//! [`TableMemory`] serves canned address ranges and exists for tests and
//! tooling.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boottime;
pub mod coroutine;
pub mod memory;
pub mod moduledata;

pub use boottime::{BootTimeError, boot_time};
pub use coroutine::{Coroutine, CoroutineIter, IterError, SCAN_BIT, Status};
pub use memory::{LiveMemory, ReadMemory, TableMemory};
pub use moduledata::Moduledata;
