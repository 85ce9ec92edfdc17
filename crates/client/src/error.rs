use std::path::PathBuf;

use snafu::Snafu;
use vault_history::{AtomicWriteError, HistoryError};
use vault_stream::StreamError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("a search for '{active_query}' is still running; cancel it first"))]
    Concurrency {
        stage: &'static str,
        active_query: String,
    },
    #[snafu(display("search query is empty"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("connection failed on `{stage}`: {source}"))]
    Connection {
        stage: &'static str,
        source: StreamError,
    },
    #[snafu(display("connection lost on `{stage}`: {message}"))]
    ConnectionLost {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("search failed: {message}"))]
    SearchFailed {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("history operation failed on `{stage}`: {source}"))]
    History {
        stage: &'static str,
        source: HistoryError,
    },
    #[snafu(display("record '{id}' could not be regenerated: {reason}"))]
    RestoreIncomplete {
        stage: &'static str,
        id: String,
        reason: &'static str,
    },
    #[snafu(display("search task stopped without a result on `{stage}`"))]
    WorkerDropped { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting '{key}'"))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("invalid value for setting '{key}' on `{stage}`: {source}"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        source: AtomicWriteError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("{source}"))]
    Session { source: SessionError },
    #[snafu(display("history operation failed on `{stage}`: {source}"), context(name(CliHistorySnafu)))]
    History {
        stage: &'static str,
        source: HistoryError,
    },
    #[snafu(display("settings operation failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to set up transport on `{stage}`: {source}"))]
    SetupTransport {
        stage: &'static str,
        source: StreamError,
    },
    #[snafu(display("failed to read replay trace at {path:?}: {source}"))]
    ReadReplay {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to render output on `{stage}`: {source}"))]
    RenderOutput {
        stage: &'static str,
        source: serde_json::Error,
    },
}

impl From<SessionError> for CliError {
    fn from(source: SessionError) -> Self {
        Self::Session { source }
    }
}

pub type CliResult<T> = Result<T, CliError>;
