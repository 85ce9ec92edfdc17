use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};

use super::error::{InvalidJsonSnafu, InvalidPayloadSnafu, MissingTypeSnafu, ProtocolResult};

/// Citation groups keyed by group label (usually a source collection).
pub type DocumentGroups = BTreeMap<String, Vec<DocumentRef>>;

/// Wire names of every chunk variant this client understands.
pub const KNOWN_CHUNK_TYPES: [&str; 10] = [
    "search_started",
    "stage_update",
    "content_chunk",
    "content_complete",
    "document_groups",
    "single_result",
    "multiple_results",
    "no_results",
    "search_complete",
    "error",
];

/// One supporting document reference.
///
/// The backend owns the shape of a reference, so the raw object is kept and
/// only the commonly displayed fields get accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(pub Value);

impl DocumentRef {
    pub fn title(&self) -> Option<&str> {
        self.string_field(&["title", "name", "filename"])
    }

    pub fn source(&self) -> Option<&str> {
        self.string_field(&["source", "url", "path"])
    }

    fn string_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.0.get(*key).and_then(Value::as_str))
    }
}

/// Free-form metadata attached to result and completion chunks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchMetadata(pub Map<String, Value>);

impl SearchMetadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// True when the backend marked this completion as the answer to a
    /// candidate selection rather than a disambiguation step.
    pub fn has_selected_product(&self) -> bool {
        match self.0.get("selected_product") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(raw)) => !raw.trim().is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }

    /// Display label of the selected product, when the flag carries one.
    pub fn selected_product_label(&self) -> Option<String> {
        if !self.has_selected_product() {
            return None;
        }

        match self.0.get("selected_product")? {
            Value::Bool(_) => None,
            value => Some(Candidate(value.clone()).label()),
        }
    }

    /// Server-assigned search id, if the completion carried one.
    pub fn search_id(&self) -> Option<String> {
        match self.0.get("search_id").or_else(|| self.0.get("id"))? {
            Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

/// One candidate offered by a `multiple_results` chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub Value);

impl Candidate {
    const LABEL_KEYS: [&'static str; 6] = ["name", "product_name", "title", "model", "label", "id"];

    /// Human-readable label, also used as the `selected_candidate` sent back
    /// to the backend.
    pub fn label(&self) -> String {
        match &self.0 {
            Value::String(raw) => raw.clone(),
            Value::Number(number) => number.to_string(),
            Value::Object(fields) => Self::LABEL_KEYS
                .iter()
                .find_map(|key| match fields.get(*key) {
                    Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw.clone()),
                    Some(Value::Number(number)) => Some(number.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| self.0.to_string()),
            other => other.to_string(),
        }
    }
}

impl From<&str> for Candidate {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

/// One event of the search stream, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    SearchStarted,
    StageUpdate {
        #[serde(default)]
        message: String,
    },
    ContentChunk {
        #[serde(default)]
        content: String,
    },
    ContentComplete {
        #[serde(default)]
        content: String,
    },
    DocumentGroups {
        #[serde(default)]
        groups: DocumentGroups,
    },
    SingleResult {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<SearchMetadata>,
    },
    MultipleResults {
        #[serde(default)]
        products: Vec<Candidate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<SearchMetadata>,
    },
    NoResults {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SearchComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processing_time: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_groups: Option<DocumentGroups>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<SearchMetadata>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A `type` this client does not know yet, passed through untouched.
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl Chunk {
    /// Decodes one JSON frame.
    pub fn from_json(frame: &str) -> ProtocolResult<Self> {
        let value = serde_json::from_str::<Value>(frame).context(InvalidJsonSnafu {
            stage: "decode-frame-json",
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .context(MissingTypeSnafu {
                stage: "decode-frame-type",
            })?
            .to_string();

        match kind.as_str() {
            "search_complete" | "error" => return Ok(Self::decode_terminal(&kind, &value)),
            known if KNOWN_CHUNK_TYPES.contains(&known) => {}
            _ => {
                return Ok(Self::Unknown {
                    kind,
                    payload: value,
                });
            }
        }

        serde_json::from_value(value).context(InvalidPayloadSnafu {
            stage: "decode-frame-payload",
            kind,
        })
    }

    /// Terminal frames always decode: a malformed optional field is dropped
    /// instead of the whole frame.
    fn decode_terminal(kind: &str, frame: &Value) -> Self {
        if kind == "error" {
            return Self::Error {
                message: lenient_field(frame, kind, "message"),
            };
        }

        Self::SearchComplete {
            processing_time: lenient_field(frame, kind, "processing_time"),
            document_groups: lenient_field(frame, kind, "document_groups"),
            content: lenient_field(frame, kind, "content"),
            metadata: lenient_field(frame, kind, "metadata"),
        }
    }

    /// Wire name of this chunk.
    pub fn kind(&self) -> &str {
        match self {
            Self::SearchStarted => "search_started",
            Self::StageUpdate { .. } => "stage_update",
            Self::ContentChunk { .. } => "content_chunk",
            Self::ContentComplete { .. } => "content_complete",
            Self::DocumentGroups { .. } => "document_groups",
            Self::SingleResult { .. } => "single_result",
            Self::MultipleResults { .. } => "multiple_results",
            Self::NoResults { .. } => "no_results",
            Self::SearchComplete { .. } => "search_complete",
            Self::Error { .. } => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// `search_complete` and `error` close a search.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SearchComplete { .. } | Self::Error { .. })
    }
}

fn lenient_field<T: DeserializeOwned>(frame: &Value, kind: &str, field: &str) -> Option<T> {
    let raw = frame.get(field).filter(|raw| !raw.is_null())?;
    match T::deserialize(raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                kind,
                field,
                error = %error,
                "dropping malformed field of terminal frame"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ProtocolError;

    #[test]
    fn decodes_known_frames_by_type() {
        let chunk = Chunk::from_json(r#"{"type":"content_chunk","content":"Hel"}"#)
            .expect("content chunk decodes");
        assert_eq!(
            chunk,
            Chunk::ContentChunk {
                content: "Hel".to_string()
            }
        );

        let chunk = Chunk::from_json(r#"{"type":"search_started","query":"pump"}"#)
            .expect("extra fields are ignored");
        assert_eq!(chunk, Chunk::SearchStarted);

        let chunk = Chunk::from_json(
            r#"{"type":"multiple_results","products":["A-100",{"name":"B-200"}]}"#,
        )
        .expect("candidate list decodes");
        let Chunk::MultipleResults { products, metadata } = chunk else {
            panic!("expected multiple_results");
        };
        assert_eq!(metadata, None);
        assert_eq!(
            products.iter().map(Candidate::label).collect::<Vec<_>>(),
            vec!["A-100".to_string(), "B-200".to_string()]
        );
    }

    #[test]
    fn unknown_types_pass_through_with_payload() {
        let chunk = Chunk::from_json(r#"{"type":"token_usage","total":42}"#)
            .expect("unknown type is not an error");

        assert_eq!(chunk.kind(), "token_usage");
        assert!(!chunk.is_terminal());
        let Chunk::Unknown { payload, .. } = chunk else {
            panic!("expected unknown passthrough");
        };
        assert_eq!(payload["total"], json!(42));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(
            Chunk::from_json("keep-alive"),
            Err(ProtocolError::InvalidJson { .. })
        ));
        assert!(matches!(
            Chunk::from_json(r#"{"content":"x"}"#),
            Err(ProtocolError::MissingType { .. })
        ));
        assert!(matches!(
            Chunk::from_json(r#"{"type":"single_result"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn terminal_frames_survive_malformed_optional_fields() {
        let chunk = Chunk::from_json(
            r#"{"type":"search_complete","processing_time":"2.31","content":"done","metadata":{"search_id":"s-1"}}"#,
        )
        .expect("completion still decodes");
        let Chunk::SearchComplete {
            processing_time,
            document_groups,
            content,
            metadata,
        } = chunk
        else {
            panic!("expected search_complete");
        };
        assert_eq!(processing_time, None);
        assert_eq!(document_groups, None);
        assert_eq!(content.as_deref(), Some("done"));
        assert_eq!(
            metadata.and_then(|metadata| metadata.search_id()).as_deref(),
            Some("s-1")
        );

        let chunk = Chunk::from_json(r#"{"type":"error","message":{"code":503}}"#)
            .expect("error frame still decodes");
        assert_eq!(chunk, Chunk::Error { message: None });
        assert!(chunk.is_terminal());
    }

    #[test]
    fn selected_product_flag_accepts_strings_and_true() {
        let flagged = |value: Value| {
            let mut fields = Map::new();
            fields.insert("selected_product".to_string(), value);
            SearchMetadata(fields)
        };

        assert!(flagged(json!("A-100")).has_selected_product());
        assert_eq!(
            flagged(json!("A-100")).selected_product_label().as_deref(),
            Some("A-100")
        );
        assert!(flagged(json!(true)).has_selected_product());
        assert_eq!(flagged(json!(true)).selected_product_label(), None);
        assert!(!flagged(json!(false)).has_selected_product());
        assert!(!flagged(json!("  ")).has_selected_product());
        assert!(!flagged(Value::Null).has_selected_product());
        assert!(!SearchMetadata::default().has_selected_product());
    }

    #[test]
    fn search_id_reads_strings_and_numbers() {
        let metadata: SearchMetadata =
            serde_json::from_value(json!({"search_id": 981})).expect("metadata decodes");
        assert_eq!(metadata.search_id().as_deref(), Some("981"));

        let metadata: SearchMetadata =
            serde_json::from_value(json!({"id": "srv-7"})).expect("metadata decodes");
        assert_eq!(metadata.search_id().as_deref(), Some("srv-7"));
    }
}
