use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use breeze_llm::DEFAULT_MODEL_ID;
use breeze_storage::{DEFAULT_NAMESPACE, JsonFileStore, PersistentStore};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a concise, helpful assistant. Keep responses brief and useful.";
pub const SETTINGS_DIRECTORY_NAME: &str = "breeze";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Environment variables with this prefix override file values (`BREEZE_SYSTEM_PROMPT`).
pub const ENV_PREFIX: &str = "BREEZE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Model to load instead of the last persisted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default = "default_model_id")]
    pub default_model_id: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Transcript directory; the platform data directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model_id: None,
            default_model_id: default_model_id(),
            system_prompt: default_system_prompt(),
            namespace: default_namespace(),
            data_dir: None,
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.model_id = self
            .model_id
            .map(|model_id| model_id.trim().to_string())
            .filter(|model_id| !model_id.is_empty());
        self.default_model_id = if self.default_model_id.trim().is_empty() {
            default_model_id()
        } else {
            self.default_model_id.trim().to_string()
        };
        self.system_prompt = self.system_prompt.trim().to_string();
        self.namespace = if self.namespace.trim().is_empty() {
            default_namespace()
        } else {
            self.namespace.trim().to_string()
        };
        self
    }

    pub fn data_directory(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".breeze"))
        })
    }

    /// File-backed store for this namespace under [`ChatSettings::data_directory`].
    pub fn open_store(&self) -> Arc<dyn PersistentStore> {
        Arc::new(JsonFileStore::new(
            self.data_directory(),
            self.namespace.clone(),
        ))
    }
}

/// Settings snapshot shared by readers, swapped atomically on update.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".breeze"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> SettingsResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> SettingsResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));

            assert_eq!(*store.settings(), ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn file_values_merge_over_defaults_and_env_wins() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "model_id": "  Llama-3.2-1B  ", "namespace": "work" }"#,
            )?;
            jail.set_env("BREEZE_NAMESPACE", "override");

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));
            let settings = store.settings();

            assert_eq!(settings.model_id.as_deref(), Some("Llama-3.2-1B"));
            assert_eq!(settings.namespace, "override");
            assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
            assert_eq!(settings.default_model_id, DEFAULT_MODEL_ID);
            Ok(())
        });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn load_reads_the_platform_config_path() {
        Jail::expect_with(|jail| {
            let directory = jail.directory().to_path_buf();
            jail.set_env("XDG_CONFIG_HOME", directory.display());
            jail.create_dir(SETTINGS_DIRECTORY_NAME)?;
            jail.create_file(
                format!("{SETTINGS_DIRECTORY_NAME}/{SETTINGS_FILE_NAME}"),
                r#"{ "default_model_id": "Phi-3.5-mini-instruct-q4f16_1-MLC" }"#,
            )?;

            let store = SettingsStore::load();

            assert_eq!(
                store.config_path(),
                jail.directory().join(SETTINGS_DIRECTORY_NAME).join(SETTINGS_FILE_NAME)
            );
            assert_eq!(
                store.settings().default_model_id,
                "Phi-3.5-mini-instruct-q4f16_1-MLC"
            );
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(SETTINGS_FILE_NAME, "{ not json")?;

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));

            assert_eq!(*store.settings(), ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn update_persists_normalized_settings() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join(SETTINGS_FILE_NAME);
            let store = SettingsStore::new(path.clone());

            store
                .update(ChatSettings {
                    model_id: Some("   ".to_string()),
                    namespace: String::new(),
                    system_prompt: "  Be brief.  ".to_string(),
                    ..ChatSettings::default()
                })
                .expect("settings should persist");

            let expected = ChatSettings {
                system_prompt: "Be brief.".to_string(),
                ..ChatSettings::default()
            };
            assert_eq!(*store.settings(), expected);
            assert!(!path.with_extension("json.tmp").exists());

            let reloaded = SettingsStore::new(path);
            assert_eq!(*reloaded.settings(), expected);
            Ok(())
        });
    }

    #[test]
    fn explicit_data_dir_backs_the_store() {
        let directory = tempfile::tempdir().expect("tempdir should be created");
        let settings = ChatSettings {
            data_dir: Some(directory.path().to_path_buf()),
            namespace: "work".to_string(),
            ..ChatSettings::default()
        };

        let store = settings.open_store();

        assert_eq!(settings.data_directory(), directory.path());
        assert_eq!(store.namespace(), "work");
    }
}
