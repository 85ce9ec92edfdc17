use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("stream frame is not valid JSON on `{stage}`: {source}"))]
    InvalidJson {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stream frame has no string `type` field"))]
    MissingType { stage: &'static str },
    #[snafu(display("stream frame of type '{kind}' has an invalid payload: {source}"))]
    InvalidPayload {
        stage: &'static str,
        kind: String,
        source: serde_json::Error,
    },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
