use std::path::{Path, PathBuf};

use serde_json::Value;
use snafu::ResultExt;

use super::error::{
    CreateDirectorySnafu, DecodeValueSnafu, EncodeValueSnafu, ReadFileSnafu,
    RenameTempFileSnafu, StorageResult, WriteFileSnafu,
};
use super::{PersistentStore, namespaced_key};

/// Directory-backed store keeping one pretty-printed JSON document per namespaced key.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    namespace: String,
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File backing `key`; characters outside `[A-Za-z0-9._-]` map to `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let file_stem = namespaced_key(&self.namespace, key)
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();

        self.directory.join(format!("{file_stem}.json"))
    }
}

impl PersistentStore for JsonFileStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn write(&self, key: &str, value: &Value) -> StorageResult<()> {
        std::fs::create_dir_all(&self.directory).context(CreateDirectorySnafu {
            stage: "create-store-directory",
            path: self.directory.clone(),
        })?;

        let content = serde_json::to_string_pretty(value).context(EncodeValueSnafu {
            stage: "encode-store-value",
            key: key.to_string(),
        })?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-store-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "rename-temporary-store-file",
            from: temp_path,
            to: path.clone(),
        })?;

        tracing::trace!(path = ?path, "persisted store value");
        Ok(())
    }

    fn read(&self, key: &str) -> StorageResult<Option<Value>> {
        let path = self.path_for(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(source).context(ReadFileSnafu {
                    stage: "read-store-file",
                    path,
                });
            }
        };

        let value = serde_json::from_str(&content).context(DecodeValueSnafu {
            stage: "decode-store-file",
            key: key.to_string(),
        })?;
        Ok(Some(value))
    }
}
