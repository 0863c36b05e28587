//! Provides minidump support.
//!
//! The entry point is [`processor::process`], which reads a minidump, walks the stack of every
//! thread and returns a [`processor::ProcessState`]. Call frame information for the loaded
//! modules is supplied through a [`processor::FrameInfoMap`]; without it, the stack walker falls
//! back to frame pointers and stack scanning.

#![warn(missing_docs)]

pub mod processor;
