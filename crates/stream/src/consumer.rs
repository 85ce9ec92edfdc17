use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use snafu::ensure;
use tokio::sync::{mpsc, watch};
use vault_protocol::Chunk;

use super::decoder::FrameDecoder;
use super::error::{AlreadyOpenSnafu, EmptyQuerySnafu, StreamResult};
use super::transport::{SearchRequest, SearchTransport};

pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Identifier for one opened search stream.
///
/// A fresh target is minted on every `open`, so events from a stale stream
/// can never be mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

/// Decoded stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventPayload {
    Chunk(Chunk),
    /// The transport failed to open or broke mid-stream.
    Failed(String),
    /// The response body ended.
    Ended,
}

impl StreamEventPayload {
    fn closes_stream(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Ended)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

struct StreamControl {
    cancel_tx: watch::Sender<bool>,
    open: AtomicBool,
}

/// Cloneable cancellation handle for one stream.
#[derive(Clone)]
pub struct CancelHandle {
    target: StreamTarget,
    control: Arc<StreamControl>,
}

impl CancelHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Stops delivery and aborts the transport. Returns `false` when the
    /// stream was already cancelled.
    pub fn cancel(&self) -> bool {
        self.control.open.store(false, Ordering::SeqCst);
        !self.control.cancel_tx.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.control.cancel_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.control.open.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancelHandle")
            .field("target", &self.target)
            .field("open", &self.is_open())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Receiving side of one search stream.
///
/// Events arrive strictly in transport order. Once cancelled, nothing more
/// is delivered even if frames are already queued.
pub struct ChunkStream {
    handle: CancelHandle,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_rx: watch::Receiver<bool>,
}

/// A freshly opened stream plus the worker future that feeds it. The caller
/// decides where the worker runs.
pub struct StreamHandle {
    pub stream: ChunkStream,
    pub worker: StreamWorker,
}

impl ChunkStream {
    pub fn target(&self) -> StreamTarget {
        self.handle.target
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&mut self) -> bool {
        let cancelled = self.handle.cancel();
        self.events.close();
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.is_cancelled() {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel_rx.wait_for(|cancelled| *cancelled) => None,
            event = self.events.recv() => event,
        };

        // Cancellation may land while an event is in hand; it must not escape.
        if self.is_cancelled() {
            self.events.close();
            return None;
        }

        match &event {
            Some(event) if !event.payload.closes_stream() => {}
            _ => self.handle.control.open.store(false, Ordering::SeqCst),
        }
        event
    }

    /// Hands every event to `handler` in arrival order until the handler
    /// breaks, the stream ends, or the stream is cancelled.
    pub async fn dispatch<F, B>(&mut self, mut handler: F) -> Option<B>
    where
        F: FnMut(StreamEvent) -> ControlFlow<B>,
    {
        while let Some(event) = self.recv().await {
            if let ControlFlow::Break(value) = handler(event) {
                return Some(value);
            }
        }
        None
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Owns the connection slot for one logical search session.
///
/// Only one stream may be open at a time; a second `open` fails until the
/// previous stream is cancelled, finished, or dropped.
pub struct StreamConsumer {
    transport: Arc<dyn SearchTransport>,
    next_target: u64,
    active: Option<CancelHandle>,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn SearchTransport>) -> Self {
        Self {
            transport,
            next_target: 1,
            active: None,
        }
    }

    pub fn transport(&self) -> Arc<dyn SearchTransport> {
        self.transport.clone()
    }

    pub fn is_open(&self) -> bool {
        self.active.as_ref().is_some_and(CancelHandle::is_open)
    }

    pub fn open(&mut self, request: SearchRequest) -> StreamResult<StreamHandle> {
        if let Some(active) = &self.active
            && active.is_open()
        {
            return AlreadyOpenSnafu {
                stage: "consumer-open",
                target: active.target(),
            }
            .fail();
        }
        ensure!(
            !request.query.trim().is_empty(),
            EmptyQuerySnafu {
                stage: "consumer-open",
            }
        );

        let target = StreamTarget(self.next_target);
        // Reserve the next target immediately so a retry never reuses one.
        self.next_target = self.next_target.saturating_add(1);

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        self.active = Some(stream.cancel_handle());

        tracing::debug!(
            target = ?target,
            transport = self.transport.name(),
            selection = request.is_selection(),
            "opening search stream"
        );
        let worker: StreamWorker = Box::pin(run_stream_worker(
            self.transport.clone(),
            request,
            target,
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { stream, worker })
    }

    /// Cancels the given stream; idempotent.
    pub fn cancel(&mut self, handle: &CancelHandle) -> bool {
        let cancelled = handle.cancel();
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.target() == handle.target())
        {
            self.active = None;
        }
        cancelled
    }
}

fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ChunkStream,
    watch::Receiver<bool>,
) {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = CancelHandle {
        target,
        control: Arc::new(StreamControl {
            cancel_tx,
            open: AtomicBool::new(true),
        }),
    };
    let stream = ChunkStream {
        handle,
        events,
        cancel_rx: cancel_rx.clone(),
    };
    (event_tx, stream, cancel_rx)
}

fn emit(
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    target: StreamTarget,
    payload: StreamEventPayload,
) -> bool {
    event_tx.send(StreamEvent { target, payload }).is_ok()
}

/// Decodes frames and forwards them; returns `false` once the reader is gone.
fn forward_frames(
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    target: StreamTarget,
    frames: Vec<String>,
) -> bool {
    for frame in frames {
        match Chunk::from_json(&frame) {
            Ok(chunk) => {
                if !emit(event_tx, target, StreamEventPayload::Chunk(chunk)) {
                    return false;
                }
            }
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    error = %error,
                    frame_len = frame.len(),
                    "dropping malformed stream frame"
                );
            }
        }
    }
    true
}

async fn run_stream_worker(
    transport: Arc<dyn SearchTransport>,
    request: SearchRequest,
    target: StreamTarget,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
            tracing::debug!(target = ?target, "search stream cancelled before it opened");
            return;
        }
        opened = transport.open(&request) => opened,
    };

    let mut body = match opened {
        Ok(body) => body,
        Err(error) => {
            tracing::error!(
                target = ?target,
                transport = transport.name(),
                query = %request.query,
                error = %error,
                "failed to open search stream"
            );
            emit(&event_tx, target, StreamEventPayload::Failed(error.to_string()));
            return;
        }
    };

    let mut decoder = FrameDecoder::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                // Dropping the body aborts the underlying connection.
                tracing::debug!(target = ?target, "search stream cancelled");
                return;
            }
            next = body.next() => match next {
                Some(Ok(bytes)) => {
                    if !forward_frames(&event_tx, target, decoder.push(&bytes)) {
                        return;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        target = ?target,
                        error = %error,
                        "search stream broke mid-body"
                    );
                    emit(&event_tx, target, StreamEventPayload::Failed(error.to_string()));
                    return;
                }
                None => break,
            }
        }
    }

    if forward_frames(&event_tx, target, decoder.finish()) {
        emit(&event_tx, target, StreamEventPayload::Ended);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{ReplayScript, ReplayTransport};
    use crate::StreamError;

    fn consumer_with(transport: &Arc<ReplayTransport>) -> StreamConsumer {
        StreamConsumer::new(transport.clone())
    }

    async fn collect(stream: &mut ChunkStream) -> Vec<StreamEventPayload> {
        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn delivers_chunks_in_order_and_skips_malformed_frames() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_frames([
            r#"{"type":"search_started"}"#,
            "not json at all",
            r#"{"type":"content_chunk","content":"Hel"}"#,
            r#"{"type":"custom_marker","value":1}"#,
            r#"{"type":"content_chunk","content":"lo"}"#,
            r#"{"type":"search_complete"}"#,
        ]);

        let mut consumer = consumer_with(&transport);
        let StreamHandle { mut stream, worker } = consumer
            .open(SearchRequest::new("greeting"))
            .expect("stream opens");
        tokio::spawn(worker);

        let kinds = collect(&mut stream)
            .await
            .into_iter()
            .map(|payload| match payload {
                StreamEventPayload::Chunk(chunk) => chunk.kind().to_string(),
                StreamEventPayload::Failed(message) => format!("failed: {message}"),
                StreamEventPayload::Ended => "ended".to_string(),
            })
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            vec![
                "search_started",
                "content_chunk",
                "custom_marker",
                "content_chunk",
                "search_complete",
                "ended",
            ]
        );
        assert!(!consumer.is_open());
    }

    #[tokio::test]
    async fn second_open_fails_while_first_is_open() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_script(ReplayScript::Hold(Vec::new()));
        transport.push_frames([r#"{"type":"search_complete"}"#]);

        let mut consumer = consumer_with(&transport);
        let first = consumer
            .open(SearchRequest::new("first"))
            .expect("first stream opens");

        assert!(matches!(
            consumer.open(SearchRequest::new("second")),
            Err(StreamError::AlreadyOpen { .. })
        ));

        let handle = first.stream.cancel_handle();
        assert!(consumer.cancel(&handle));
        assert!(!consumer.cancel(&handle));

        let second = consumer.open(SearchRequest::new("second"));
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn cancel_stops_delivery_of_queued_chunks() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_script(ReplayScript::Hold(vec![
            "{\"type\":\"content_chunk\",\"content\":\"a\"}\n".to_string(),
            "{\"type\":\"content_chunk\",\"content\":\"b\"}\n".to_string(),
        ]));

        let mut consumer = consumer_with(&transport);
        let StreamHandle { mut stream, worker } = consumer
            .open(SearchRequest::new("pump"))
            .expect("stream opens");
        let worker = tokio::spawn(worker);

        let first = stream.recv().await.expect("first chunk arrives");
        assert!(matches!(first.payload, StreamEventPayload::Chunk(_)));

        // Give the worker time to queue the second chunk before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let handle = stream.cancel_handle();
        assert!(handle.cancel());

        assert_eq!(stream.recv().await, None);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops after cancel")
            .expect("worker does not panic");
    }

    #[tokio::test]
    async fn dispatch_stops_when_handler_breaks() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_frames([
            r#"{"type":"stage_update","message":"Reading"}"#,
            r#"{"type":"error","message":"boom"}"#,
            r#"{"type":"content_chunk","content":"late"}"#,
        ]);

        let mut consumer = consumer_with(&transport);
        let StreamHandle { mut stream, worker } = consumer
            .open(SearchRequest::new("pump"))
            .expect("stream opens");
        tokio::spawn(worker);

        let mut seen = 0;
        let terminal = stream
            .dispatch(|event| match event.payload {
                StreamEventPayload::Chunk(chunk) if chunk.is_terminal() => {
                    ControlFlow::Break(chunk)
                }
                _ => {
                    seen += 1;
                    ControlFlow::Continue(())
                }
            })
            .await;

        assert_eq!(seen, 1);
        assert_eq!(
            terminal,
            Some(Chunk::Error {
                message: Some("boom".to_string())
            })
        );
    }

    #[tokio::test]
    async fn open_failure_is_reported_as_failed_event() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_script(ReplayScript::Fail("connection refused".to_string()));

        let mut consumer = consumer_with(&transport);
        let StreamHandle { mut stream, worker } = consumer
            .open(SearchRequest::new("pump"))
            .expect("open is lazy");
        tokio::spawn(worker);

        let payloads = collect(&mut stream).await;
        assert_eq!(payloads.len(), 1);
        assert!(matches!(
            &payloads[0],
            StreamEventPayload::Failed(message) if message.contains("connection refused")
        ));
    }

    #[test]
    fn empty_queries_are_rejected() {
        let transport = Arc::new(ReplayTransport::new());
        let mut consumer = consumer_with(&transport);
        assert!(matches!(
            consumer.open(SearchRequest::new("   ")),
            Err(StreamError::EmptyQuery { .. })
        ));
    }
}
