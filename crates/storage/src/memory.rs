use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::error::StorageResult;
use super::{PersistentStore, namespaced_key};

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespace: String,
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // A panic while holding the lock cannot leave a half-written JSON value behind.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PersistentStore for MemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn write(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.entries()
            .insert(namespaced_key(&self.namespace, key), value.clone());
        Ok(())
    }

    fn read(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self
            .entries()
            .get(&namespaced_key(&self.namespace, key))
            .cloned())
    }
}
