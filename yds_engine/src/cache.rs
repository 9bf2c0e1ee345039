//! Process-local cache of running data, versioned against the module
//! version counters in main SHM.

use parking_lot::RwLock;
use std::collections::HashMap;
use yds_data::tree::DataNode;

struct Entry {
    data: Vec<DataNode>,
    version: u32,
}

/// One connection's running-data cache. The cache lock is always taken
/// after the module data lock, never before.
#[derive(Default)]
pub struct ModCache {
    inner: RwLock<HashMap<String, Entry>>,
}

impl ModCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached data of `module` if it is still at `version`. A stale entry
    /// is dropped so the caller reads the file and refreshes.
    pub fn get_current(&self, module: &str, version: u32) -> Option<Vec<DataNode>> {
        {
            let map = self.inner.read();
            match map.get(module) {
                Some(e) if e.version == version => return Some(e.data.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.inner.write().remove(module);
        None
    }

    /// Store fresh data for `module`.
    pub fn update(&self, module: &str, data: Vec<DataNode>, version: u32) {
        self.inner
            .write()
            .insert(module.to_string(), Entry { data, version });
    }

    /// Drop one module's entry.
    pub fn remove(&self, module: &str) {
        self.inner.write().remove(module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_coherence() {
        let cache = ModCache::new();
        assert!(cache.get_current("m", 1).is_none());

        cache.update("m", vec![DataNode::leaf("x", "1")], 1);
        assert!(cache.get_current("m", 1).is_some());

        // A newer committed version invalidates the entry.
        assert!(cache.get_current("m", 2).is_none());
        assert!(cache.get_current("m", 1).is_none());
    }
}
