use snafu::Snafu;

use super::consumer::StreamTarget;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("search stream {target:?} is still open; cancel it before opening another"))]
    AlreadyOpen {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("search request has an empty query"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("search endpoint returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("replay transport has no scripted response left"))]
    ReplayExhausted { stage: &'static str },
    #[snafu(display("replayed transport failure: {message}"))]
    ReplayFailure {
        stage: &'static str,
        message: String,
    },
}

pub type StreamResult<T> = Result<T, StreamError>;
