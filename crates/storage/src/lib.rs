pub mod error;
pub mod file;
pub mod ids;
pub mod memory;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use file::JsonFileStore;
pub use ids::MessageId;
pub use memory::MemoryStore;

/// Namespace used when callers do not configure one.
pub const DEFAULT_NAMESPACE: &str = "breezechats";

/// Joins a namespace and a key into the persisted key form, `namespace:key`.
pub fn namespaced_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

/// Namespaced key/value persistence with JSON values.
///
/// Backends implement the fallible `write`/`read` pair. Callers in the chat core go
/// through `save`/`load`, which never fail: errors are logged and downgraded to a
/// `false` return or the caller-supplied default.
pub trait PersistentStore: Send + Sync {
    fn namespace(&self) -> &str;

    fn write(&self, key: &str, value: &Value) -> StorageResult<()>;

    fn read(&self, key: &str) -> StorageResult<Option<Value>>;

    fn save(&self, key: &str, value: &Value) -> bool {
        match self.write(key, value) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    key = %namespaced_key(self.namespace(), key),
                    error = %error,
                    "persistent write failed; keeping value in memory only"
                );
                false
            }
        }
    }

    fn load(&self, key: &str, default: Value) -> Value {
        match self.read(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(error) => {
                tracing::warn!(
                    key = %namespaced_key(self.namespace(), key),
                    error = %error,
                    "persistent read failed; using default"
                );
                default
            }
        }
    }
}

/// Typed helpers layered over [`PersistentStore`].
pub trait PersistentStoreExt: PersistentStore {
    fn save_json<T>(&self, key: &str, value: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(value) => self.save(key, &value),
            Err(error) => {
                tracing::warn!(
                    key = %namespaced_key(self.namespace(), key),
                    error = %error,
                    "failed to encode value for persistence"
                );
                false
            }
        }
    }

    fn load_json<T>(&self, key: &str, default: T) -> T
    where
        T: DeserializeOwned,
    {
        let value = match self.read(key) {
            Ok(Some(value)) => value,
            Ok(None) => return default,
            Err(error) => {
                tracing::warn!(
                    key = %namespaced_key(self.namespace(), key),
                    error = %error,
                    "persistent read failed; using default"
                );
                return default;
            }
        };

        match serde_json::from_value(value) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(
                    key = %namespaced_key(self.namespace(), key),
                    error = %error,
                    "persisted value has an unexpected shape; using default"
                );
                default
            }
        }
    }
}

impl<S> PersistentStoreExt for S where S: PersistentStore + ?Sized {}
