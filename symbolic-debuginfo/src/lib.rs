//! A normalized view of debug information in object files.
//!
//! Cache builders never read container formats themselves. They consume any type implementing
//! [`ObjectLike`], which exposes:
//!
//!  - identification: architecture, code and debug identifiers, container format,
//!  - the public symbol table as [`Symbol`]s and a sorted [`SymbolMap`],
//!  - a [`DebugSession`] yielding [`Function`] trees with inlinees and [`LineInfo`] records,
//!  - normalized stack unwinding information as [`UnwindTable`]s.
//!
//! Parsers for ELF, Mach-O, PE, PDB and Breakpad files plug in by implementing the trait.
//! [`OwnedObject`] implements it for data assembled in memory, and [`FunctionBuilder`] turns flat
//! inlinee records into the function trees the trait expects.
//!
//! # Features
//!
//! - `serde` (optional): Implements `serde::Serialize` and `serde::Deserialize` for
//!   [`ObjectKind`] and [`FileFormat`].

#![warn(missing_docs)]

mod base;
mod function_builder;
mod owned;
mod unwind;

pub use crate::base::*;
pub use crate::function_builder::FunctionBuilder;
pub use crate::owned::*;
pub use crate::unwind::*;
