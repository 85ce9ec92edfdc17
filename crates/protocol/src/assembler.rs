use std::time::Instant;

use serde_json::Value;

use super::chunk::{Candidate, Chunk, DocumentGroups, SearchMetadata};
use super::record::{
    DisambiguationPrompt, ResponseType, SearchRecord, count_citations, current_unix_millis,
    synthesize_record_id,
};

pub const DEFAULT_NO_RESULTS_MESSAGE: &str = "No results found";
pub const DEFAULT_FAILURE_MESSAGE: &str = "search failed";
pub const SEARCH_STARTED_STAGE: &str = "Searching...";

/// Shape a search has resolved to so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Content,
    Single,
    Multiple,
    NoResults,
}

impl Resolution {
    fn is_structured(self) -> bool {
        matches!(self, Self::Single | Self::Multiple)
    }

    fn response_type(self) -> ResponseType {
        match self {
            Self::Content => ResponseType::Content,
            Self::Single => ResponseType::SingleResult,
            Self::Multiple => ResponseType::MultipleResults,
            Self::NoResults => ResponseType::NoResults,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblerState {
    #[default]
    Idle,
    Streaming,
    Resolved(Resolution),
    Terminal,
}

/// Final outcome of one assembled search.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    /// A finished record that belongs in history.
    Record(SearchRecord),
    /// The search stopped at a candidate list; nothing is stored.
    Disambiguation(DisambiguationPrompt),
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyStep {
    Continue,
    /// The chunk arrived after the terminal chunk and was dropped.
    Ignored,
    Finished(AssemblyOutcome),
}

/// Folds the ordered chunks of one search into a single outcome.
///
/// Precedence: a structured result beats free text, `content_complete` beats
/// accumulated `content_chunk`s, and an unresolved candidate list is never
/// turned into a record.
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    query: String,
    selection: Option<String>,
    state: AssemblerState,
    text: String,
    product: Option<Value>,
    candidates: Vec<Candidate>,
    no_results_message: Option<String>,
    document_groups: DocumentGroups,
    result_metadata: Option<SearchMetadata>,
    stage_message: Option<String>,
    started_at: Instant,
}

impl ResponseAssembler {
    /// Creates an assembler for the query exactly as the user submitted it.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            selection: None,
            state: AssemblerState::Idle,
            text: String::new(),
            product: None,
            candidates: Vec::new(),
            no_results_message: None,
            document_groups: DocumentGroups::new(),
            result_metadata: None,
            stage_message: None,
            started_at: Instant::now(),
        }
    }

    /// Creates an assembler for the follow-up search that answers a
    /// disambiguation prompt.
    pub fn for_selection(query: impl Into<String>, selected: impl Into<String>) -> Self {
        let mut assembler = Self::new(query);
        assembler.selection = Some(selected.into());
        assembler
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match self.state {
            AssemblerState::Resolved(resolution) => Some(resolution),
            AssemblerState::Idle | AssemblerState::Streaming | AssemblerState::Terminal => None,
        }
    }

    /// Latest progress label; not part of the final record.
    pub fn current_stage(&self) -> Option<&str> {
        self.stage_message.as_deref()
    }

    /// Text accumulated so far, for live display while streaming.
    pub fn buffered_text(&self) -> &str {
        &self.text
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn document_groups(&self) -> &DocumentGroups {
        &self.document_groups
    }

    pub fn is_terminal(&self) -> bool {
        self.state == AssemblerState::Terminal
    }

    pub fn feed(&mut self, chunk: Chunk) -> AssemblyStep {
        if self.is_terminal() {
            tracing::debug!(
                query = %self.query,
                kind = chunk.kind(),
                "dropping chunk received after terminal chunk"
            );
            return AssemblyStep::Ignored;
        }

        if self.state == AssemblerState::Idle {
            self.state = AssemblerState::Streaming;
        }

        match chunk {
            Chunk::SearchStarted => {
                self.stage_message = Some(SEARCH_STARTED_STAGE.to_string());
            }
            Chunk::StageUpdate { message } => {
                self.stage_message = Some(message);
            }
            Chunk::ContentChunk { content } => self.append_content(&content),
            Chunk::ContentComplete { content } => self.replace_content(content),
            Chunk::DocumentGroups { groups } => self.merge_document_groups(groups),
            Chunk::SingleResult { data, metadata } => {
                self.text.clear();
                self.candidates.clear();
                self.no_results_message = None;
                self.product = Some(data);
                self.result_metadata = metadata;
                self.state = AssemblerState::Resolved(Resolution::Single);
            }
            Chunk::MultipleResults { products, metadata } => {
                self.text.clear();
                self.product = None;
                self.no_results_message = None;
                self.candidates = products;
                self.result_metadata = metadata;
                self.state = AssemblerState::Resolved(Resolution::Multiple);
            }
            Chunk::NoResults { message } => {
                self.text.clear();
                self.product = None;
                self.candidates.clear();
                self.no_results_message = Some(
                    message
                        .filter(|message| !message.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_NO_RESULTS_MESSAGE.to_string()),
                );
                self.state = AssemblerState::Resolved(Resolution::NoResults);
            }
            Chunk::SearchComplete {
                processing_time,
                document_groups,
                content,
                metadata,
            } => {
                let outcome = self.complete(processing_time, document_groups, content, metadata);
                return AssemblyStep::Finished(outcome);
            }
            Chunk::Error { message } => {
                self.state = AssemblerState::Terminal;
                let message = message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
                return AssemblyStep::Finished(AssemblyOutcome::Failed { message });
            }
            Chunk::Unknown { kind, .. } => {
                tracing::debug!(query = %self.query, kind = %kind, "ignoring unknown chunk type");
            }
        }

        AssemblyStep::Continue
    }

    fn append_content(&mut self, content: &str) {
        match self.resolution() {
            None | Some(Resolution::Content) => {
                self.text.push_str(content);
                self.state = AssemblerState::Resolved(Resolution::Content);
            }
            Some(resolution) => {
                tracing::debug!(
                    query = %self.query,
                    resolution = ?resolution,
                    "ignoring content fragment after non-content resolution"
                );
            }
        }
    }

    fn replace_content(&mut self, content: String) {
        if let Some(resolution) = self.resolution()
            && resolution.is_structured()
        {
            tracing::debug!(
                query = %self.query,
                resolution = ?resolution,
                "structured result outranks content_complete"
            );
            return;
        }

        self.text = content;
        self.no_results_message = None;
        self.state = AssemblerState::Resolved(Resolution::Content);
    }

    fn merge_document_groups(&mut self, groups: DocumentGroups) {
        for (group, refs) in groups {
            self.document_groups.entry(group).or_default().extend(refs);
        }
    }

    fn complete(
        &mut self,
        processing_time: Option<f64>,
        document_groups: Option<DocumentGroups>,
        content: Option<String>,
        metadata: Option<SearchMetadata>,
    ) -> AssemblyOutcome {
        if let Some(groups) = document_groups {
            self.merge_document_groups(groups);
        }

        if let Some(content) = content.filter(|content| !content.is_empty()) {
            self.replace_content(content);
        }

        let resolution = match self.resolution() {
            Some(Resolution::Content) if self.text.is_empty() => Resolution::NoResults,
            Some(resolution) => resolution,
            None => Resolution::NoResults,
        };
        self.state = AssemblerState::Terminal;

        let metadata = metadata.unwrap_or_default();
        if resolution == Resolution::Multiple && !metadata.has_selected_product() {
            tracing::debug!(
                query = %self.query,
                candidate_count = self.candidates.len(),
                "search stopped at disambiguation; not producing a record"
            );
            return AssemblyOutcome::Disambiguation(DisambiguationPrompt {
                query: self.query.clone(),
                candidates: std::mem::take(&mut self.candidates),
                document_groups: self.document_groups.clone(),
                metadata: Some(metadata),
            });
        }

        AssemblyOutcome::Record(self.build_record(resolution, processing_time, &metadata))
    }

    fn build_record(
        &mut self,
        resolution: Resolution,
        processing_time: Option<f64>,
        metadata: &SearchMetadata,
    ) -> SearchRecord {
        let now = current_unix_millis();
        let elapsed_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let processing_time_ms = processing_time
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64)
            .unwrap_or(elapsed_ms);

        let response_content = match resolution {
            Resolution::Content => std::mem::take(&mut self.text),
            Resolution::NoResults => self
                .no_results_message
                .take()
                .unwrap_or_else(|| DEFAULT_NO_RESULTS_MESSAGE.to_string()),
            Resolution::Single | Resolution::Multiple => String::new(),
        };
        let product_data = match resolution {
            Resolution::Single => self.product.take(),
            Resolution::Content | Resolution::Multiple | Resolution::NoResults => None,
        };
        let product_list = match resolution {
            Resolution::Multiple => std::mem::take(&mut self.candidates),
            Resolution::Content | Resolution::Single | Resolution::NoResults => Vec::new(),
        };

        let selected_product = self
            .selection
            .clone()
            .or_else(|| metadata.selected_product_label())
            .or_else(|| {
                self.result_metadata
                    .as_ref()
                    .and_then(SearchMetadata::selected_product_label)
            });

        SearchRecord {
            id: metadata
                .search_id()
                .unwrap_or_else(|| synthesize_record_id(now)),
            query: self.query.clone(),
            response_type: Some(resolution.response_type()),
            response_content,
            product_data,
            product_list,
            citations_count: count_citations(&self.document_groups),
            document_groups: std::mem::take(&mut self.document_groups),
            selected_product,
            processing_time_ms,
            timestamp: now,
            success: true,
            comments: Vec::new(),
        }
    }
}
