//! Gazer snapshot engine.
//!
//! An in-process heap snapshotter: on request it stops every other thread
//! of the host program, walks all paused coroutines, records their call
//! stacks, and traverses the live objects reachable from declared roots —
//! producing one self-describing binary blob an external decoder turns
//! back into a typed heap graph.
//!
//! # Architecture
//!
//! The pipeline runs under a single world stop, leaves first:
//!
//! - [`out_buf::OutBuf`]: fixed-capacity output arena, framed per
//!   [`framing`]
//! - [`queue::TraversalQueue`]: pending memory regions, deduplicated on
//!   `(address, type)`
//! - [`unwinder::Unwinder`]: frame-pointer stack walk with per-ABI CFA
//!   adjustment
//! - [`machine::StackMachine`]: the bytecode interpreter driving typed
//!   extraction
//! - [`snapshotter::Snapshotter`]: orchestration; [`snapshot`] is the
//!   public entry
//!
//! # Guarantees
//!
//! The pause is bounded: output capacity is fixed, the interpreter has a
//! hard iteration cap, stacks cap at 512 frames, and nothing allocates
//! once the world is stopped. Observed memory is never written. A bad
//! pointer costs a zeroed slot in the blob, never a crash.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fifo;
pub mod framing;
pub mod hash;
pub mod machine;
pub mod out_buf;
pub mod queue;
pub mod resolver;
pub mod snapshotter;
pub mod unwinder;

pub use framing::{
    FAILED_DEREFERENCE_BIT, FrameHeader, GoroutineHeader, QueueEntry, SnapshotHeader, Statistics,
};
pub use hash::murmur2;
pub use machine::{MachineCtx, StackMachine};
pub use out_buf::OutBuf;
pub use queue::TraversalQueue;
pub use resolver::RuntimeTypeResolver;
pub use snapshotter::{
    DEFAULT_CAPACITY, SnapshotError, SnapshotResponse, Snapshotter, capture, snapshot,
};
pub use unwinder::{MAX_STACK_FRAMES, Unwinder};
