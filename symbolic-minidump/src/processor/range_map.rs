use std::ops::Range;

use super::types::CodeModule;

/// A structure containing a set of disjoint ranges with attached contents.
#[derive(Clone, Debug)]
pub(crate) struct RangeMap<A, E> {
    inner: Vec<(Range<A>, E)>,
}

impl<A: Ord + Copy, E> RangeMap<A, E> {
    /// Insert a range into the map.
    ///
    /// The range must be non-empty and disjoint from all ranges that are already present.
    /// Returns true if the insertion was successful.
    pub fn insert(&mut self, range: Range<A>, contents: E) -> bool {
        if range.start >= range.end {
            return false;
        }

        if let Some(i) = self.free_slot(&range) {
            self.inner.insert(i, (range, contents));
            true
        } else {
            false
        }
    }

    /// Returns the position in the inner vector where the given range could be inserted, if that is possible.
    fn free_slot(&self, range: &Range<A>) -> Option<usize> {
        let index = match self.inner.binary_search_by_key(&range.end, |r| r.0.end) {
            Ok(_) => return None,
            Err(index) => index,
        };

        if index > 0 {
            let before = &self.inner[index - 1];
            if before.0.end > range.start {
                return None;
            }
        }

        match self.inner.get(index) {
            Some(after) if after.0.start < range.end => None,
            _ => Some(index),
        }
    }

    /// Retrieves the range covering the given address and the associated contents.
    pub fn get(&self, address: A) -> Option<&(Range<A>, E)> {
        let entry = match self
            .inner
            .binary_search_by_key(&address, |range| range.0.end)
        {
            // This means inner(index).end == address => address might be covered by the next one
            Ok(index) => self.inner.get(index + 1)?,
            // This means that inner(index).end > address => this could be the one
            Err(index) => self.inner.get(index)?,
        };

        (entry.0.start <= address).then_some(entry)
    }

    /// Retrieves the contents associated with the given address.
    pub fn get_contents(&self, address: A) -> Option<&E> {
        self.get(address).map(|(_, contents)| contents)
    }
}

impl<A, E> Default for RangeMap<A, E> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

/// The loaded modules of a process, sorted by base address.
#[derive(Clone, Debug, Default)]
pub(crate) struct ModuleMap {
    modules: Vec<CodeModule>,
    ranges: RangeMap<u64, usize>,
}

impl ModuleMap {
    pub fn new(mut modules: Vec<CodeModule>) -> Self {
        modules.sort_by_key(|module| (module.base_address(), module.size()));

        let mut ranges = RangeMap::default();
        for (index, module) in modules.iter().enumerate() {
            let range = module.base_address()..module.end_address();
            if !ranges.insert(range, index) {
                tracing::debug!(
                    base_address = %format_args!("{:#x}", module.base_address()),
                    code_file = module.code_file(),
                    "skipping overlapping or empty module for address lookups"
                );
            }
        }

        Self { modules, ranges }
    }

    /// Returns the module whose image covers the address.
    pub fn find(&self, address: u64) -> Option<&CodeModule> {
        let index = *self.ranges.get_contents(address)?;
        self.modules.get(index)
    }

    pub fn modules(&self) -> &[CodeModule] {
        &self.modules
    }

    pub fn into_modules(self) -> Vec<CodeModule> {
        self.modules
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn range_map_simple() {
        let mut map = RangeMap::default();

        assert!(map.insert(10u8..20, "Middle"));
        assert!(map.insert(0..10, "Low"));
        assert!(!map.insert(15..25, "Overlapping"));
        assert!(!map.insert(30..30, "Empty"));
        assert!(map.insert(20..30, "High"));

        assert_eq!(map.get_contents(0), Some(&"Low"));
        assert_eq!(map.get_contents(9), Some(&"Low"));
        assert_eq!(map.get_contents(10), Some(&"Middle"));
        assert_eq!(map.get_contents(20), Some(&"High"));
        assert_eq!(map.get_contents(29), Some(&"High"));
        assert_eq!(map.get_contents(30), None);
    }

    #[test]
    fn module_map_lookup() {
        let map = ModuleMap::new(vec![
            CodeModule::new(0x2000, 0x1000).with_code_file("b.so"),
            CodeModule::new(0x1000, 0x1000).with_code_file("a.so"),
            CodeModule::new(0x1800, 0x100).with_code_file("overlap.so"),
        ]);

        assert_eq!(map.modules().len(), 3);
        assert_eq!(map.modules()[0].code_file(), "a.so");
        assert_eq!(map.find(0x1800).map(|m| m.code_file()), Some("a.so"));
        assert_eq!(map.find(0x2fff).map(|m| m.code_file()), Some("b.so"));
        assert!(map.find(0x3000).is_none());
        assert!(map.find(0xfff).is_none());
    }

    proptest! {
        #[test]
        fn proptest_range_map_disjoint(ranges in prop::collection::vec((0u32..1000, 1u32..50), 0..50)) {
            let mut map = RangeMap::default();
            let mut inserted = Vec::new();

            for (start, len) in ranges {
                let range = start..start + len;
                if map.insert(range.clone(), range.clone()) {
                    inserted.push(range);
                }
            }

            for address in 0..1050 {
                let expected = inserted.iter().find(|r| r.contains(&address));
                prop_assert_eq!(map.get_contents(address), expected);
            }
        }
    }
}
