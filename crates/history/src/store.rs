use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use vault_protocol::SearchRecord;

use super::error::{
    AtomicWriteError, CreateParentDirSnafu, HistoryResult, ParseHistoryFileSnafu,
    ReadHistoryFileSnafu, RenameTempFileSnafu, SerializeHistorySnafu, WriteHistoryFileSnafu,
    WriteTempFileSnafu,
};

/// Display preferences persisted next to the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySettings {
    #[serde(default)]
    pub include_online: bool,
    #[serde(default = "default_show_history")]
    pub show_history: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            include_online: false,
            show_history: default_show_history(),
        }
    }
}

fn default_show_history() -> bool {
    true
}

/// Durable history document: `{records, settings}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedHistory {
    #[serde(default)]
    pub records: Vec<SearchRecord>,
    #[serde(default)]
    pub settings: HistorySettings,
}

/// Persistence port for the history repository.
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> HistoryResult<PersistedHistory>;
    fn save(&self, history: &PersistedHistory) -> HistoryResult<()>;
}

/// Stores the history document as pretty JSON, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryStore {
    path: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileHistoryStore {
    fn load(&self) -> HistoryResult<PersistedHistory> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = ?self.path, "history file not found, starting empty");
                return Ok(PersistedHistory::default());
            }
            Err(source) => {
                return Err(source).context(ReadHistoryFileSnafu {
                    stage: "read-history-file",
                    path: self.path.clone(),
                });
            }
        };

        if contents.trim().is_empty() {
            return Ok(PersistedHistory::default());
        }

        serde_json::from_str(&contents).context(ParseHistoryFileSnafu {
            stage: "parse-history-file",
            path: self.path.clone(),
        })
    }

    fn save(&self, history: &PersistedHistory) -> HistoryResult<()> {
        let content = serde_json::to_string_pretty(history).context(SerializeHistorySnafu {
            stage: "serialize-history-json",
        })?;
        write_file_atomically(&self.path, &content).context(WriteHistoryFileSnafu {
            stage: "replace-history-file",
        })?;

        tracing::debug!(
            path = ?self.path,
            record_count = history.records.len(),
            "saved search history"
        );
        Ok(())
    }
}

/// Writes `contents` to `<path>.tmp` and renames it over `path`, creating the
/// parent directory first. Readers see either the old or the new file.
pub fn write_file_atomically(path: &Path, contents: &str) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateParentDirSnafu { path: parent })?;
    }

    let temp_path = temp_path_for(path);
    std::fs::write(&temp_path, contents).context(WriteTempFileSnafu { path: &temp_path })?;
    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        from: &temp_path,
        to: path,
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut file_name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    file_name.push(".tmp");
    path.with_file_name(file_name)
}

/// Keeps the history document in memory; used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    document: Mutex<PersistedHistory>,
}

impl MemoryHistoryStore {
    pub fn new(document: PersistedHistory) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    pub fn snapshot(&self) -> PersistedHistory {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> HistoryResult<PersistedHistory> {
        Ok(self.snapshot())
    }

    fn save(&self, history: &PersistedHistory) -> HistoryResult<()> {
        *self
            .document
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = history.clone();
        Ok(())
    }
}
