use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::error::EngineError;
use crate::synth::TableDefinition;

/// (logical table id, physical table name)
pub type RegistryKey = (i32, String);

/// Process-local cache of synthesized definitions.
///
/// The physical name is part of the key, so a cutover to another generation
/// misses the cache on its own. Field and settings changes go through
/// [`DynamicTableRegistry::invalidate`].
pub struct DynamicTableRegistry {
    entries: Mutex<LruCache<RegistryKey, Arc<TableDefinition>>>,
}

impl DynamicTableRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, table_id: i32, db_table_name: &str) -> Option<Arc<TableDefinition>> {
        self.entries
            .lock()
            .get(&(table_id, db_table_name.to_string()))
            .cloned()
    }

    /// Returns the cached definition or builds, stores and returns a new one.
    /// `use_cache = false` always rebuilds and replaces the stored entry.
    pub fn get_or_build<F>(
        &self,
        table_id: i32,
        db_table_name: &str,
        use_cache: bool,
        build: F,
    ) -> Result<Arc<TableDefinition>, EngineError>
    where
        F: FnOnce() -> Result<TableDefinition, EngineError>,
    {
        if use_cache {
            if let Some(definition) = self.get(table_id, db_table_name) {
                return Ok(definition);
            }
        }

        // Synthesis is pure, so building outside the lock only risks duplicate work.
        debug!("Synthesizing definition for table {} ({})", table_id, db_table_name);
        let definition = Arc::new(build()?);
        self.entries
            .lock()
            .put((table_id, db_table_name.to_string()), definition.clone());
        Ok(definition)
    }

    /// Drops every cached generation of `table_id`.
    pub fn invalidate(&self, table_id: i32) {
        let mut entries = self.entries.lock();
        let stale: Vec<RegistryKey> = entries
            .iter()
            .filter(|((id, _), _)| *id == table_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
        debug!("Invalidated cached definitions for table {}", table_id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
