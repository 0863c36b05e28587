//! Exposes a C-ABI for symbolic.
//!
//! Errors never cross the boundary as panics. Every function records failures in a thread-local
//! slot that is read with `symbolic_err_get_last_code` and `symbolic_err_get_last_message`, and
//! returns a zero value: a null pointer, `0`, `false` or an empty string.

#![allow(clippy::missing_safety_doc)]

#[macro_use]
mod utils;

mod cfi;
mod core;
mod minidump;
mod symcache;

pub use crate::cfi::*;
pub use crate::core::*;
pub use crate::minidump::*;
pub use crate::symcache::*;

#[cfg(test)]
mod tests {
    const HEADER: &str = include_str!("../include/symbolic.h");

    const SOURCES: [&str; 4] = [
        include_str!("cfi.rs"),
        include_str!("core.rs"),
        include_str!("minidump.rs"),
        include_str!("symcache.rs"),
    ];

    /// Returns the names of all functions declared in the header.
    fn declared_functions() -> Vec<&'static str> {
        HEADER
            .lines()
            .filter(|line| !line.trim_start().starts_with('*'))
            .filter_map(|line| {
                let start = line.find("symbolic_")?;
                let end = start + line[start..].find('(')?;
                Some(&line[start..end])
            })
            .collect()
    }

    #[test]
    fn test_header_matches_exports() {
        let declared = declared_functions();
        assert!(declared.contains(&"symbolic_normalize_debug_id"));

        for name in &declared {
            let definition = format!("fn {name}(");
            assert!(
                SOURCES.iter().any(|source| source.contains(&definition)),
                "{name} is declared in symbolic.h but not exported"
            );
        }

        for source in SOURCES {
            for line in source.lines() {
                let Some(rest) = line.trim_start().strip_prefix("unsafe fn symbolic_") else {
                    continue;
                };
                let Some(end) = rest.find('(') else {
                    continue;
                };
                let name = format!("symbolic_{}", &rest[..end]);
                assert!(declared.contains(&name.as_str()), "{name} is missing in symbolic.h");
            }
        }
    }
}
