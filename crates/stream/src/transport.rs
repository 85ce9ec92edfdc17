use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use tokio::sync::mpsc;

use super::error::{ReplayExhaustedSnafu, StreamError, StreamResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = BoxStream<'static, StreamResult<Vec<u8>>>;

/// Payload sent to the search backend.
///
/// A request carrying `selected_candidate` is the follow-up to a
/// disambiguation prompt and is routed to the selection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_candidate: Option<String>,
    pub include_online: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            selected_candidate: None,
            include_online: false,
        }
    }

    pub fn selection(query: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self {
            selected_candidate: Some(candidate.into()),
            ..Self::new(query)
        }
    }

    pub fn with_include_online(mut self, include_online: bool) -> Self {
        self.include_online = include_online;
        self
    }

    pub fn is_selection(&self) -> bool {
        self.selected_candidate.is_some()
    }
}

/// Byte-level access to the search backend.
pub trait SearchTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Opens one search and returns its raw response body.
    fn open<'a>(&'a self, request: &'a SearchRequest) -> BoxFuture<'a, StreamResult<ByteStream>>;

    /// Lightweight liveness check.
    fn probe<'a>(&'a self) -> BoxFuture<'a, StreamResult<bool>>;
}

/// One scripted backend response for [`ReplayTransport`].
#[derive(Debug)]
pub enum ReplayScript {
    /// Body chunks delivered in order, then end of body.
    Body(Vec<String>),
    /// Body chunks delivered in order, then the connection stays open.
    Hold(Vec<String>),
    /// Body chunks arrive as the paired sender pushes them; dropping the
    /// sender ends the body.
    Live(mpsc::UnboundedReceiver<String>),
    /// Opening the stream fails with this message.
    Fail(String),
}

/// Offline transport that replays recorded stream bodies.
///
/// Each `open` consumes the next script in FIFO order; requests are kept so
/// callers can inspect what would have been sent.
#[derive(Debug)]
pub struct ReplayTransport {
    scripts: Mutex<VecDeque<ReplayScript>>,
    requests: Mutex<Vec<SearchRequest>>,
    healthy: AtomicBool,
}

impl Default for ReplayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Builds a transport that answers one search with a recorded NDJSON
    /// trace, one frame per line.
    pub fn from_ndjson(trace: &str) -> Self {
        let transport = Self::new();
        transport.push_script(ReplayScript::Body(
            trace.lines().map(|line| format!("{line}\n")).collect(),
        ));
        transport
    }

    pub fn push_script(&self, script: ReplayScript) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
    }

    /// Queues a response whose frames each arrive as a separate chunk.
    pub fn push_frames<I, S>(&self, frames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let body = frames
            .into_iter()
            .map(|frame| format!("{}\n", frame.into()))
            .collect();
        self.push_script(ReplayScript::Body(body));
    }

    /// Queues a response that stays open until the returned sender pushes
    /// more chunks or is dropped.
    pub fn push_live(&self) -> mpsc::UnboundedSender<String> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        self.push_script(ReplayScript::Live(chunk_rx));
        chunk_tx
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_script(&self, request: &SearchRequest) -> Option<ReplayScript> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

fn body_stream(chunks: Vec<String>) -> impl futures::Stream<Item = StreamResult<Vec<u8>>> {
    stream::iter(chunks.into_iter().map(|chunk| Ok(chunk.into_bytes())))
}

fn live_stream(
    chunk_rx: mpsc::UnboundedReceiver<String>,
) -> impl futures::Stream<Item = StreamResult<Vec<u8>>> {
    stream::unfold(chunk_rx, |mut chunk_rx| async move {
        let chunk = chunk_rx.recv().await?;
        Some((Ok(chunk.into_bytes()), chunk_rx))
    })
}

impl SearchTransport for ReplayTransport {
    fn name(&self) -> &str {
        "replay"
    }

    fn open<'a>(&'a self, request: &'a SearchRequest) -> BoxFuture<'a, StreamResult<ByteStream>> {
        Box::pin(async move {
            match self.next_script(request) {
                Some(ReplayScript::Body(chunks)) => Ok(body_stream(chunks).boxed()),
                Some(ReplayScript::Hold(chunks)) => {
                    Ok(body_stream(chunks).chain(stream::pending()).boxed())
                }
                Some(ReplayScript::Live(chunk_rx)) => Ok(live_stream(chunk_rx).boxed()),
                Some(ReplayScript::Fail(message)) => Err(StreamError::ReplayFailure {
                    stage: "replay-open",
                    message,
                }),
                None => ReplayExhaustedSnafu {
                    stage: "replay-open",
                }
                .fail(),
            }
        })
    }

    fn probe<'a>(&'a self) -> BoxFuture<'a, StreamResult<bool>> {
        Box::pin(async move { Ok(self.healthy.load(Ordering::SeqCst)) })
    }
}
