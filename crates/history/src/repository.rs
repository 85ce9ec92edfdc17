use std::sync::Arc;

use snafu::{OptionExt, ensure};
use vault_protocol::{
    RecordComment, RestoredView, SearchRecord, current_unix_millis, normalize_query,
};

use super::error::{
    DisambiguationStaleSnafu, EmptyCommentSnafu, HistoryResult, NotFoundSnafu,
};
use super::store::{HistorySettings, HistoryStore, PersistedHistory};

/// Entries kept in memory for the running session.
pub const LIVE_HISTORY_LIMIT: usize = 20;
/// Entries written to durable storage.
pub const PERSISTED_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// Id under which the record was stored.
    pub id: String,
    /// True when an entry with the same normalized query was replaced.
    pub replaced: bool,
    pub evicted: Vec<String>,
    /// The entry as stored, after id and comment reconciliation.
    pub record: SearchRecord,
}

/// Ordered, bounded, de-duplicated search history, newest first.
///
/// Entries are keyed by normalized query: a repeated search replaces its
/// previous entry and moves to the front. Ids are unique at all times.
pub struct HistoryRepository {
    entries: Vec<SearchRecord>,
    settings: HistorySettings,
    store: Option<Arc<dyn HistoryStore>>,
}

impl Default for HistoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRepository {
    /// Creates an empty repository without durable storage.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            settings: HistorySettings::default(),
            store: None,
        }
    }

    /// Loads the persisted document and keeps the store for `flush`.
    pub fn init(store: Arc<dyn HistoryStore>) -> HistoryResult<Self> {
        let document = store.load()?;
        let mut repository = Self {
            entries: Vec::new(),
            settings: document.settings,
            store: Some(store),
        };

        // Upsert from oldest to newest so stored order and invariants survive
        // hand-edited or duplicated files.
        for record in document.records.into_iter().rev() {
            repository.upsert(record);
        }

        tracing::debug!(
            record_count = repository.entries.len(),
            "search history loaded"
        );
        Ok(repository)
    }

    pub fn list(&self) -> &[SearchRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SearchRecord> {
        self.entries.iter().find(|record| record.id == id)
    }

    pub fn settings(&self) -> HistorySettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: HistorySettings) {
        self.settings = settings;
    }

    /// Stores `record` as the newest entry.
    ///
    /// An entry with the same normalized query is taken out first; its
    /// comments carry over when `record` has none.
    pub fn upsert(&mut self, mut record: SearchRecord) -> UpsertOutcome {
        let key = normalize_query(&record.query);
        let previous = self
            .entries
            .iter()
            .position(|entry| normalize_query(&entry.query) == key)
            .map(|index| self.entries.remove(index));

        record.id = self.unique_id(record.id);
        if let Some(previous) = &previous {
            record.timestamp = record.timestamp.max(previous.timestamp);
            if record.comments.is_empty() {
                record.comments = previous.comments.clone();
            }
            tracing::debug!(
                replaced_id = %previous.id,
                id = %record.id,
                query = %record.query,
                "replacing history entry for repeated query"
            );
        }

        let stored = record.clone();
        self.entries.insert(0, record);
        let evicted = self.evict_overflow();
        UpsertOutcome {
            id: stored.id.clone(),
            replaced: previous.is_some(),
            evicted,
            record: stored,
        }
    }

    /// Removes by id; returns `false` when nothing matched.
    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|record| record.id != id);
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The newest entries that go to durable storage.
    pub fn persisted_subset(&self) -> &[SearchRecord] {
        let end = self.entries.len().min(PERSISTED_HISTORY_LIMIT);
        &self.entries[..end]
    }

    pub fn snapshot(&self) -> PersistedHistory {
        PersistedHistory {
            records: self.persisted_subset().to_vec(),
            settings: self.settings,
        }
    }

    /// Writes the persisted subset through the store; no-op without one.
    pub fn flush(&self) -> HistoryResult<()> {
        match &self.store {
            Some(store) => store.save(&self.snapshot()),
            None => Ok(()),
        }
    }

    /// Rebuilds the display state a record was saved with.
    ///
    /// Records from a candidate selection that were stored before display
    /// state was captured cannot be rebuilt locally and fail with
    /// `DisambiguationStale`; the caller re-runs the selection instead.
    pub fn restore(&self, id: &str) -> HistoryResult<RestoredView> {
        let record = self.get(id).context(NotFoundSnafu {
            stage: "restore-record",
            id,
        })?;

        if !record.has_display_state()
            && let Some(selected_product) = &record.selected_product
        {
            return DisambiguationStaleSnafu {
                stage: "restore-record",
                id,
                query: record.query.clone(),
                selected_product: selected_product.clone(),
            }
            .fail();
        }

        Ok(record.restored_view())
    }

    pub fn add_comment(&mut self, id: &str, text: &str) -> HistoryResult<RecordComment> {
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            EmptyCommentSnafu {
                stage: "add-comment",
            }
        );

        let record = self.get_mut(id, "add-comment")?;
        let comment = RecordComment {
            text: text.to_string(),
            timestamp: current_unix_millis(),
        };
        record.comments.push(comment.clone());
        Ok(comment)
    }

    /// Removes the comment at `index`; `false` when out of range.
    pub fn remove_comment(&mut self, id: &str, index: usize) -> HistoryResult<bool> {
        let record = self.get_mut(id, "remove-comment")?;
        if index >= record.comments.len() {
            return Ok(false);
        }
        record.comments.remove(index);
        Ok(true)
    }

    fn get_mut(&mut self, id: &str, stage: &'static str) -> HistoryResult<&mut SearchRecord> {
        self.entries
            .iter_mut()
            .find(|record| record.id == id)
            .context(NotFoundSnafu { stage, id })
    }

    fn evict_overflow(&mut self) -> Vec<String> {
        if self.entries.len() <= LIVE_HISTORY_LIMIT {
            return Vec::new();
        }

        let evicted = self
            .entries
            .split_off(LIVE_HISTORY_LIMIT)
            .into_iter()
            .map(|record| record.id)
            .collect::<Vec<_>>();
        tracing::debug!(evicted = ?evicted, "evicted oldest history entries");
        evicted
    }

    /// Returns `id`, suffixed when another entry already holds it.
    fn unique_id(&self, id: String) -> String {
        let taken = |candidate: &str| self.entries.iter().any(|entry| entry.id == candidate);

        if !taken(&id) {
            return id;
        }

        (2..)
            .map(|suffix| format!("{id}-{suffix}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or(id)
    }
}
