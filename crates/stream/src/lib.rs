#![deny(unsafe_code)]

//! Connection layer for the search event stream: transports, framing, the
//! single-slot stream consumer and the background health probe.

pub mod consumer;
pub mod decoder;
pub mod error;
pub mod health;
pub mod http;
pub mod transport;

pub use consumer::{
    CancelHandle, ChunkStream, StreamConsumer, StreamEvent, StreamEventPayload, StreamHandle,
    StreamTarget, StreamWorker,
};
pub use decoder::FrameDecoder;
pub use error::{StreamError, StreamResult};
pub use health::{DEFAULT_PROBE_BACKOFF, DEFAULT_PROBE_INTERVAL, HealthConfig, HealthMonitor};
pub use http::{
    DEFAULT_HEALTH_PATH, DEFAULT_SEARCH_PATH, DEFAULT_SELECT_PATH, HttpTransport,
    HttpTransportConfig,
};
pub use transport::{
    BoxFuture, ByteStream, ReplayScript, ReplayTransport, SearchRequest, SearchTransport,
};
