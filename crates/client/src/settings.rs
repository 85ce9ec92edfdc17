use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use vault_history::{HistorySettings, write_file_atomically};
use vault_stream::{
    DEFAULT_HEALTH_PATH, DEFAULT_SEARCH_PATH, DEFAULT_SELECT_PATH, HealthConfig,
    HttpTransportConfig,
};

use super::error::{
    InvalidValueSnafu, SerializeConfigSnafu, SettingsError, UnknownKeySnafu, WriteFileSnafu,
};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "vault-search";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const ENV_PREFIX: &str = "VAULT_SEARCH_";

const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEALTH_BACKOFF_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_select_path")]
    pub select_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_backoff_initial_ms")]
    pub health_backoff_initial_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    #[serde(default)]
    pub include_online: bool,
    #[serde(default = "default_show_history")]
    pub show_history: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            search_path: default_search_path(),
            select_path: default_select_path(),
            health_path: default_health_path(),
            health_interval_secs: default_health_interval_secs(),
            health_backoff_initial_ms: default_health_backoff_initial_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            history_path: default_history_path(),
            include_online: false,
            show_history: default_show_history(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = non_empty_or(self.endpoint, default_endpoint);
        self.search_path = non_empty_or(self.search_path, default_search_path);
        self.select_path = non_empty_or(self.select_path, default_select_path);
        self.health_path = non_empty_or(self.health_path, default_health_path);

        if self.health_interval_secs == 0 {
            self.health_interval_secs = default_health_interval_secs();
        }
        if self.health_backoff_initial_ms == 0 {
            self.health_backoff_initial_ms = default_health_backoff_initial_ms();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        if self.history_path.as_os_str().is_empty() {
            self.history_path = default_history_path();
        }

        self
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            endpoint: self.endpoint.clone(),
            search_path: self.search_path.clone(),
            select_path: self.select_path.clone(),
            health_path: self.health_path.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        let interval = Duration::from_secs(self.health_interval_secs);
        HealthConfig {
            interval,
            initial_backoff: Duration::from_millis(self.health_backoff_initial_ms).min(interval),
        }
    }

    /// Returns a copy with the field named `key` set from `raw`.
    ///
    /// `raw` is read as JSON when it parses (`true`, `30`), otherwise as a
    /// plain string.
    pub fn with_value(self, key: &str, raw: &str) -> Result<Self, SettingsError> {
        let mut fields = serde_json::to_value(&self).context(SerializeConfigSnafu {
            stage: "serialize-settings-fields",
        })?;
        let slot = fields
            .get_mut(key)
            .context(UnknownKeySnafu {
                stage: "set-setting",
                key,
            })?;
        *slot = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        let updated: Self = serde_json::from_value(fields).context(InvalidValueSnafu {
            stage: "set-setting",
            key,
        })?;
        Ok(updated.normalized())
    }

    /// Display preferences for the history repository.
    ///
    /// These settings are authoritative: the `settings` block of the history
    /// file mirrors them on every flush and is not read back.
    pub fn history_settings(&self) -> HistorySettings {
        HistorySettings {
            include_online: self.include_online,
            show_history: self.show_history,
        }
    }
}

/// Current client settings, backed by a JSON file and `VAULT_SEARCH_*`
/// environment overrides.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".vault-search"))
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

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        write_file_atomically(&self.config_path, &content).context(WriteFileSnafu {
            stage: "replace-settings-file",
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

fn non_empty_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_search_path() -> String {
    DEFAULT_SEARCH_PATH.to_string()
}

fn default_select_path() -> String {
    DEFAULT_SELECT_PATH.to_string()
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_health_backoff_initial_ms() -> u64 {
    DEFAULT_HEALTH_BACKOFF_MS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".vault-search"))
        .join(HISTORY_FILE_NAME)
}

fn default_show_history() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_restores_blank_and_zero_fields() {
        let settings = ClientSettings {
            endpoint: "   ".to_string(),
            search_path: " /custom/stream ".to_string(),
            health_interval_secs: 0,
            request_timeout_secs: 0,
            history_path: PathBuf::new(),
            ..ClientSettings::default()
        }
        .normalized();

        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.search_path, "/custom/stream");
        assert_eq!(settings.health_interval_secs, DEFAULT_HEALTH_INTERVAL_SECS);
        assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert!(settings.history_path.ends_with(HISTORY_FILE_NAME));
    }

    #[test]
    fn health_backoff_never_exceeds_interval() {
        let settings = ClientSettings {
            health_interval_secs: 2,
            health_backoff_initial_ms: 10_000,
            ..ClientSettings::default()
        };
        let config = settings.health_config();
        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());
        assert_eq!(store.settings().endpoint, DEFAULT_ENDPOINT);

        store
            .update(ClientSettings {
                endpoint: " http://search.internal:9000/api ".to_string(),
                include_online: true,
                history_path: dir.path().join("history.json"),
                ..ClientSettings::default()
            })
            .expect("settings persist");
        assert_eq!(store.settings().endpoint, "http://search.internal:9000/api");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().endpoint, "http://search.internal:9000/api");
        assert!(reloaded.settings().history_settings().include_online);
        assert_eq!(
            reloaded.settings().transport_config().search_path,
            DEFAULT_SEARCH_PATH
        );
    }

    #[test]
    fn single_fields_are_set_from_command_line_text() {
        let settings = ClientSettings::default()
            .with_value("endpoint", "http://search.internal:9000/api")
            .expect("string field sets")
            .with_value("include_online", "true")
            .expect("bool field sets")
            .with_value("health_interval_secs", "0")
            .expect("numeric field sets");

        assert_eq!(settings.endpoint, "http://search.internal:9000/api");
        assert!(settings.include_online);
        assert_eq!(settings.health_interval_secs, DEFAULT_HEALTH_INTERVAL_SECS);

        assert!(matches!(
            ClientSettings::default().with_value("colour", "blue"),
            Err(SettingsError::UnknownKey { .. })
        ));
        assert!(matches!(
            ClientSettings::default().with_value("request_timeout_secs", "soon"),
            Err(SettingsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn unparseable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"health_interval_secs": "soon"}"#).expect("fixture written");

        let store = SettingsStore::new(path);
        assert_eq!(store.settings().health_interval_secs, DEFAULT_HEALTH_INTERVAL_SECS);
    }
}
