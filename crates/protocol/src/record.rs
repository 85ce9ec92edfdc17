use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chunk::{Candidate, DocumentGroups, SearchMetadata};

/// Which shape a finished search resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Content,
    SingleResult,
    MultipleResults,
    NoResults,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::SingleResult => "single_result",
            Self::MultipleResults => "multiple_results",
            Self::NoResults => "no_results",
        }
    }
}

/// User note attached to a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordComment {
    pub text: String,
    pub timestamp: u64,
}

/// Persisted, displayable outcome of one logical search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub id: String,
    pub query: String,
    // Rows written before display-state capture carry no response type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    #[serde(default)]
    pub response_content: String,
    #[serde(default)]
    pub product_data: Option<Value>,
    #[serde(default)]
    pub product_list: Vec<Candidate>,
    #[serde(default)]
    pub document_groups: DocumentGroups,
    #[serde(default)]
    pub selected_product: Option<String>,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub citations_count: usize,
    #[serde(default)]
    pub comments: Vec<RecordComment>,
}

impl SearchRecord {
    /// Response type with legacy rows treated as plain content.
    pub fn resolved_type(&self) -> ResponseType {
        self.response_type.unwrap_or(ResponseType::Content)
    }

    /// False for rows saved before the display state was captured alongside
    /// the answer.
    pub fn has_display_state(&self) -> bool {
        self.response_type.is_some()
    }

    /// Rebuilds the exact view this record was produced with.
    pub fn restored_view(&self) -> RestoredView {
        RestoredView {
            record_id: self.id.clone(),
            query: self.query.clone(),
            response_type: self.resolved_type(),
            response_content: self.response_content.clone(),
            product_data: self.product_data.clone(),
            product_list: self.product_list.clone(),
            document_groups: self.document_groups.clone(),
            selected_product: self.selected_product.clone(),
        }
    }
}

fn default_success() -> bool {
    true
}

/// Display state reconstructed from a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredView {
    pub record_id: String,
    pub query: String,
    pub response_type: ResponseType,
    pub response_content: String,
    pub product_data: Option<Value>,
    pub product_list: Vec<Candidate>,
    pub document_groups: DocumentGroups,
    pub selected_product: Option<String>,
}

/// Candidate list from a search that stopped at a disambiguation step.
///
/// Never stored; the caller renders it and follows up with a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct DisambiguationPrompt {
    pub query: String,
    pub candidates: Vec<Candidate>,
    pub document_groups: DocumentGroups,
    pub metadata: Option<SearchMetadata>,
}

/// Total number of document refs across all citation groups.
pub fn count_citations(groups: &DocumentGroups) -> usize {
    groups.values().map(Vec::len).sum()
}

/// Lower-cased, trimmed query used for history de-duplication.
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Client-side record id for completions that did not carry one.
pub fn synthesize_record_id(unix_millis: u64) -> String {
    format!("search_{unix_millis}")
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn legacy_rows_deserialize_without_display_state() {
        let record: SearchRecord = serde_json::from_value(json!({
            "id": "search_1",
            "query": "Hydraulic pump",
            "responseContent": "",
            "selectedProduct": "HP-200",
            "timestamp": 10
        }))
        .expect("legacy row decodes");

        assert!(!record.has_display_state());
        assert_eq!(record.resolved_type(), ResponseType::Content);
        assert!(record.success);
        assert!(record.comments.is_empty());
    }

    #[test]
    fn records_serialize_with_camel_case_fields() {
        let record = SearchRecord {
            id: "search_2".to_string(),
            query: "pump".to_string(),
            response_type: Some(ResponseType::SingleResult),
            response_content: String::new(),
            product_data: Some(json!({"name": "HP-200"})),
            product_list: Vec::new(),
            document_groups: DocumentGroups::new(),
            selected_product: Some("HP-200".to_string()),
            processing_time_ms: 1200,
            timestamp: 20,
            success: true,
            citations_count: 0,
            comments: Vec::new(),
        };

        let value = serde_json::to_value(&record).expect("record serializes");
        assert_eq!(value["responseType"], json!("single_result"));
        assert_eq!(value["productData"]["name"], json!("HP-200"));
        assert_eq!(value["selectedProduct"], json!("HP-200"));
        assert_eq!(value["processingTimeMs"], json!(1200));
    }

    #[test]
    fn normalized_queries_ignore_case_and_padding() {
        assert_eq!(normalize_query("  Hydraulic PUMP "), "hydraulic pump");
        assert_eq!(synthesize_record_id(42), "search_42");
    }
}
