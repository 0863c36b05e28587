//! Stack unwinding rules in Breakpad's postfix notation.
//!
//! The CFI cache stores the rules for every code range as short postfix programs such as
//! `.cfa: $rsp 8 + .ra: .cfa -8 + ^`. This crate parses those programs into [`Rule`]s and
//! evaluates them against the registers and stack memory of a callee frame to recover the
//! caller's registers.
//!
//! ```
//! use std::collections::BTreeMap;
//! use symbolic_unwind::{Evaluator, LittleEndian, MemoryRegion, Register};
//! use symbolic_unwind::parsing::rules_complete;
//!
//! let rules = rules_complete::<u64>(".cfa: $rsp 8 + .ra: .cfa -8 + ^").unwrap();
//!
//! let stack = 0x1234u64.to_le_bytes();
//! let mut registers = BTreeMap::new();
//! registers.insert(Register::from_name("$rsp"), 0x7000);
//!
//! let evaluator = Evaluator::new(LittleEndian)
//!     .memory(MemoryRegion { base_addr: 0x7000, contents: &stack })
//!     .registers(registers);
//!
//! let caller = evaluator.evaluate_rules(&rules).unwrap();
//! assert_eq!(caller[&Register::cfa()], 0x7008);
//! assert_eq!(caller[&Register::ra()], 0x1234);
//! ```

#![warn(missing_docs)]

mod base;
mod evaluator;

pub use base::*;
pub use evaluator::*;
