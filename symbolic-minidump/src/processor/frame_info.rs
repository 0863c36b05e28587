use std::collections::btree_map;
use std::collections::BTreeMap;

use symbolic_cfi::CfiCache;

use super::types::CodeModuleId;

/// Container for call frame information (CFI) of [`CodeModule`](super::CodeModule)s.
///
/// This information is required by the stackwalker in case framepointers are
/// missing in the raw stacktraces. Caches are keyed by the module's debug identifier. Since
/// [`CodeModuleId`] normalizes its input, identifiers spelled in different letter case or form
/// refer to the same entry.
///
/// The map is populated before processing and only read during stack walking.
///
/// ```
/// use symbolic_cfi::CfiCache;
/// use symbolic_minidump::processor::{CodeModuleId, FrameInfoMap};
/// use symbolic_testutils::unwind_object;
///
/// let cache = CfiCache::from_object(&unwind_object()).unwrap();
/// let id: CodeModuleId = "dfb8e43a-f242-3d73-a453-aeb6a777ef75-a".parse().unwrap();
///
/// let mut frame_infos = FrameInfoMap::new();
/// frame_infos.register(id, cache);
///
/// let same: CodeModuleId = "DFB8E43AF2423D73A453AEB6A777EF75a".parse().unwrap();
/// assert!(frame_infos.contains(&same));
/// ```
#[derive(Debug, Default)]
pub struct FrameInfoMap {
    caches: BTreeMap<CodeModuleId, CfiCache<'static>>,
}

impl FrameInfoMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the CFI cache of the module with the given identifier.
    ///
    /// Returns the cache previously registered for that identifier, if any.
    pub fn register(
        &mut self,
        id: CodeModuleId,
        cache: CfiCache<'static>,
    ) -> Option<CfiCache<'static>> {
        self.caches.insert(id, cache)
    }

    /// Returns whether a cache is registered for the given identifier.
    pub fn contains(&self, id: &CodeModuleId) -> bool {
        self.caches.contains_key(id)
    }

    /// Returns the cache registered for the given identifier.
    pub fn get(&self, id: &CodeModuleId) -> Option<&CfiCache<'static>> {
        self.caches.get(id)
    }

    /// Returns the number of registered caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Returns whether no cache is registered.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Iterates over all registered caches in identifier order.
    pub fn iter(&self) -> btree_map::Iter<'_, CodeModuleId, CfiCache<'static>> {
        self.caches.iter()
    }
}

impl Extend<(CodeModuleId, CfiCache<'static>)> for FrameInfoMap {
    fn extend<I: IntoIterator<Item = (CodeModuleId, CfiCache<'static>)>>(&mut self, iter: I) {
        self.caches.extend(iter)
    }
}

impl FromIterator<(CodeModuleId, CfiCache<'static>)> for FrameInfoMap {
    fn from_iter<I: IntoIterator<Item = (CodeModuleId, CfiCache<'static>)>>(iter: I) -> Self {
        Self {
            caches: iter.into_iter().collect(),
        }
    }
}
