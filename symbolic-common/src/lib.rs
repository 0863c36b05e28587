//! Common functionality for the `symbolic` crash symbolication crates.
//!
//! This crate exposes a set of key types:
//!
//!  - [`Arch`] and [`CpuFamily`]: CPU architectures and their register conventions.
//!  - [`Name`] and [`Language`]: symbol names tagged with their source language.
//!  - [`join_path`]: platform-aware joining of source file paths.
//!  - [`InstructionInfo`]: heuristics to derive call sites from return addresses.
//!  - [`ErrorKind`]: the coarse error taxonomy every crate maps its errors onto.
//!  - [`StringTable`], [`VarintReader`] and [`RangeClaims`]: encoding primitives shared by the
//!    binary cache formats.
//!
//! # Features
//!
//! - `serde` (optional): Implements `serde::Deserialize` and `serde::Serialize` for value types.

#![warn(missing_docs)]

mod arch;
mod binary;
mod error;
mod heuristics;
mod name;
mod path;

pub use crate::arch::*;
pub use crate::binary::*;
pub use crate::error::*;
pub use crate::heuristics::*;
pub use crate::name::*;
pub use crate::path::*;

pub use debugid::*;
pub use uuid::Uuid;
