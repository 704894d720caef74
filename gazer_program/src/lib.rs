//! Gazer snapshot programs.
//!
//! A snapshot program is the compiled artifact the snapshot engine consumes:
//! a flat bytecode vector with per-type traversal routines, a table of type
//! descriptors, a program-counter classifier that maps stack PCs to program
//! entry points, a list of static roots, and a [`RuntimeConfig`] describing
//! the host runtime's opaque structures by offset.
//!
//! Key components:
//!
//! - [`RuntimeConfig`] - flat offset/address description of the host runtime
//! - [`SnapshotProgram`] - the complete program, as fetched and decoded
//! - [`Opcode`] - enumeration of all traversal operations
//! - [`OpDecoder`] - bounds-checked operand decoding
//! - [`ProgramBuilder`] - high-level API for bytecode construction
//!
//! The engine itself lives in `gazer_snapshot`; this crate is pure data and
//! performs no memory observation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod config;
pub mod decoder;
pub mod opcode;
pub mod types;
pub mod wire;

pub use builder::{Label, ProgramBuilder};
pub use config::{ConfigError, RuntimeConfig, RuntimeVersion};
pub use decoder::OpDecoder;
pub use opcode::Opcode;
pub use types::{
    ContextCapture, ContextImpl, PcClassifier, SnapshotProgram, StaticVariable, TypeInfo,
};
pub use wire::WireError;
