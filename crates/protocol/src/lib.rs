#![deny(unsafe_code)]

//! Wire vocabulary of the search stream and the state machine that folds a
//! stream into one displayable record.

pub mod assembler;
pub mod chunk;
pub mod error;
pub mod record;

pub use assembler::{
    AssemblerState, AssemblyOutcome, AssemblyStep, DEFAULT_FAILURE_MESSAGE,
    DEFAULT_NO_RESULTS_MESSAGE, Resolution, ResponseAssembler, SEARCH_STARTED_STAGE,
};
pub use chunk::{Candidate, Chunk, DocumentGroups, DocumentRef, KNOWN_CHUNK_TYPES, SearchMetadata};
pub use error::{ProtocolError, ProtocolResult};
pub use record::{
    DisambiguationPrompt, RecordComment, ResponseType, RestoredView, SearchRecord,
    count_citations, current_unix_millis, normalize_query, synthesize_record_id,
};
