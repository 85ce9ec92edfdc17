use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryError {
    #[snafu(display("history record '{id}' was not found"))]
    NotFound { stage: &'static str, id: String },
    #[snafu(display(
        "history record '{id}' for '{query}' predates display-state capture; re-run selection of '{selected_product}'"
    ))]
    DisambiguationStale {
        stage: &'static str,
        id: String,
        query: String,
        selected_product: String,
    },
    #[snafu(display("comment text is empty"))]
    EmptyComment { stage: &'static str },
    #[snafu(display("failed to read history file at {path:?} on `{stage}`: {source}"))]
    ReadHistoryFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse history file at {path:?} on `{stage}`: {source}"))]
    ParseHistoryFile {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("failed to serialize history on `{stage}`: {source}"))]
    SerializeHistory {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to save history on `{stage}`: {source}"))]
    WriteHistoryFile {
        stage: &'static str,
        source: AtomicWriteError,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Failure of one step of a temp-file-then-rename write.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AtomicWriteError {
    #[snafu(display("failed to create directory {path:?}: {source}"))]
    CreateParentDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write temporary file {path:?}: {source}"))]
    WriteTempFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move {from:?} over {to:?}: {source}"))]
    RenameTempFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
