use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;
use vault_history::{HistoryError, HistoryRepository};
use vault_protocol::{
    AssemblyOutcome, AssemblyStep, Chunk, DisambiguationPrompt, ResponseAssembler, RestoredView,
    SearchRecord,
};
use vault_stream::{
    CancelHandle, ChunkStream, SearchRequest, SearchTransport, StreamConsumer,
    StreamEventPayload, StreamHandle, StreamTarget,
};

use super::error::{
    ConcurrencySnafu, ConnectionLostSnafu, ConnectionSnafu, EmptyQuerySnafu, HistorySnafu,
    RestoreIncompleteSnafu, SearchFailedSnafu, SessionResult, WorkerDroppedSnafu,
};

/// How a search run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// The record as stored in history.
    Saved(SearchRecord),
    /// The backend asked for a candidate; nothing was stored.
    Disambiguation(DisambiguationPrompt),
    Cancelled,
}

/// Live progress of a running search, outside the final record.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchProgress {
    Stage(String),
    /// Full text buffered so far.
    Content(String),
    Chunk(Chunk),
}

pub trait SearchObserver: Send + Sync {
    fn on_progress(&self, target: StreamTarget, progress: SearchProgress);
}

impl<F> SearchObserver for F
where
    F: Fn(StreamTarget, SearchProgress) + Send + Sync,
{
    fn on_progress(&self, target: StreamTarget, progress: SearchProgress) {
        self(target, progress)
    }
}

struct ActiveSearch {
    target: StreamTarget,
    query: String,
    cancel: CancelHandle,
}

struct SessionInner {
    consumer: Mutex<StreamConsumer>,
    active: Mutex<Option<ActiveSearch>>,
    history: Mutex<HistoryRepository>,
    observer: Mutex<Option<Arc<dyn SearchObserver>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs searches one at a time and files finished ones into history.
///
/// The session guards a single search slot. Completion and cancellation
/// both resolve under that guard, so a cancelled search can never reach
/// the history.
#[derive(Clone)]
pub struct SearchSession {
    inner: Arc<SessionInner>,
}

/// Result future of one search run.
pub struct PendingSearch {
    target: StreamTarget,
    inner: Arc<SessionInner>,
    result: oneshot::Receiver<SessionResult<SearchOutcome>>,
}

impl PendingSearch {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Cancels this run if it is still the active one.
    pub fn cancel(&self) -> bool {
        self.inner.cancel_target(Some(self.target))
    }
}

impl Future for PendingSearch {
    type Output = SessionResult<SearchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                WorkerDroppedSnafu {
                    stage: "await-search-result",
                }
                .fail()
            })
        })
    }
}

impl SearchSession {
    pub fn new(transport: Arc<dyn SearchTransport>, history: HistoryRepository) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                consumer: Mutex::new(StreamConsumer::new(transport)),
                active: Mutex::new(None),
                history: Mutex::new(history),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn SearchObserver>>) {
        *lock(&self.inner.observer) = observer;
    }

    pub fn transport(&self) -> Arc<dyn SearchTransport> {
        lock(&self.inner.consumer).transport()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner.active).is_some()
    }

    /// Starts a search for `query`. Must be called inside a tokio runtime.
    pub fn run(&self, query: impl Into<String>) -> SessionResult<PendingSearch> {
        let query = query.into();
        let request =
            SearchRequest::new(query.clone()).with_include_online(self.include_online());
        self.start(ResponseAssembler::new(query), request)
    }

    /// Follows up a disambiguation prompt with the chosen candidate.
    ///
    /// The resulting record keeps `original_query` and is stored like any
    /// other search.
    pub fn select_candidate(
        &self,
        original_query: impl Into<String>,
        candidate: impl Into<String>,
    ) -> SessionResult<PendingSearch> {
        let original_query = original_query.into();
        let candidate = candidate.into();
        let request = SearchRequest::selection(original_query.clone(), candidate.clone())
            .with_include_online(self.include_online());
        self.start(
            ResponseAssembler::for_selection(original_query, candidate),
            request,
        )
    }

    /// Cancels the active search; returns `false` when none was running.
    pub fn cancel(&self) -> bool {
        self.inner.cancel_target(None)
    }

    /// Rebuilds a stored record's view, re-running the candidate selection
    /// for records saved without display state.
    pub async fn restore(&self, id: &str) -> SessionResult<RestoredView> {
        let restored = self.with_history(|history| history.restore(id));
        let (query, selected_product) = match restored {
            Ok(view) => return Ok(view),
            Err(HistoryError::DisambiguationStale {
                query,
                selected_product,
                ..
            }) => (query, selected_product),
            Err(source) => {
                return Err(source).context(HistorySnafu {
                    stage: "restore-record",
                });
            }
        };

        tracing::info!(
            id = %id,
            query = %query,
            selected_product = %selected_product,
            "re-running selection for record without display state"
        );
        match self.select_candidate(query, selected_product)?.await? {
            SearchOutcome::Saved(record) => Ok(record.restored_view()),
            SearchOutcome::Disambiguation(_) => RestoreIncompleteSnafu {
                stage: "restore-requery",
                id,
                reason: "backend answered with another candidate list",
            }
            .fail(),
            SearchOutcome::Cancelled => RestoreIncompleteSnafu {
                stage: "restore-requery",
                id,
                reason: "re-query was cancelled",
            }
            .fail(),
        }
    }

    /// Gives synchronous access to the history; never held across a search.
    pub fn with_history<R>(&self, f: impl FnOnce(&mut HistoryRepository) -> R) -> R {
        f(&mut lock(&self.inner.history))
    }

    pub fn flush(&self) -> SessionResult<()> {
        self.with_history(|history| history.flush())
            .context(HistorySnafu {
                stage: "flush-history",
            })
    }

    fn include_online(&self) -> bool {
        self.with_history(|history| history.settings().include_online)
    }

    fn start(
        &self,
        assembler: ResponseAssembler,
        request: SearchRequest,
    ) -> SessionResult<PendingSearch> {
        ensure!(
            !request.query.trim().is_empty(),
            EmptyQuerySnafu {
                stage: "session-start",
            }
        );

        let mut active = lock(&self.inner.active);
        if let Some(current) = active.as_ref() {
            return ConcurrencySnafu {
                stage: "session-start",
                active_query: current.query.clone(),
            }
            .fail();
        }

        let query = request.query.clone();
        let StreamHandle { stream, worker } = lock(&self.inner.consumer)
            .open(request)
            .context(ConnectionSnafu {
                stage: "open-search-stream",
            })?;
        let target = stream.target();
        *active = Some(ActiveSearch {
            target,
            query: query.clone(),
            cancel: stream.cancel_handle(),
        });
        drop(active);

        tracing::info!(target = ?target, query = %query, "search started");
        tokio::spawn(worker);

        let (result_tx, result) = oneshot::channel();
        tokio::spawn(drive_search(
            self.inner.clone(),
            stream,
            assembler,
            result_tx,
        ));

        Ok(PendingSearch {
            target,
            inner: self.inner.clone(),
            result,
        })
    }
}

impl SessionInner {
    fn observer(&self) -> Option<Arc<dyn SearchObserver>> {
        lock(&self.observer).clone()
    }

    fn cancel_target(&self, target: Option<StreamTarget>) -> bool {
        let mut active = lock(&self.active);
        let matches = |current: &mut ActiveSearch| {
            target.is_none_or(|target| target == current.target)
        };
        let Some(current) = active.take_if(matches) else {
            return false;
        };

        lock(&self.consumer).cancel(&current.cancel);
        tracing::info!(target = ?current.target, query = %current.query, "search cancelled");
        true
    }

    /// Settles a finished stream. Runs under the slot guard, so it either
    /// sees the search as cancelled or stores its record, never both.
    fn settle(
        &self,
        target: StreamTarget,
        finished: Option<SessionResult<AssemblyOutcome>>,
    ) -> SessionResult<SearchOutcome> {
        let mut active = lock(&self.active);
        let Some(current) = active.take_if(|current| current.target == target) else {
            return Ok(SearchOutcome::Cancelled);
        };
        if current.cancel.is_cancelled() {
            return Ok(SearchOutcome::Cancelled);
        }
        // Release the stream slot before the caller can start the next run.
        lock(&self.consumer).cancel(&current.cancel);

        let outcome = match finished {
            None => {
                return WorkerDroppedSnafu {
                    stage: "drive-search",
                }
                .fail();
            }
            Some(result) => result?,
        };

        match outcome {
            AssemblyOutcome::Failed { message } => {
                tracing::warn!(
                    target = ?target,
                    query = %current.query,
                    message = %message,
                    "search failed"
                );
                SearchFailedSnafu {
                    stage: "search-error-chunk",
                    message,
                }
                .fail()
            }
            AssemblyOutcome::Disambiguation(prompt) => {
                tracing::info!(
                    target = ?target,
                    query = %current.query,
                    candidate_count = prompt.candidates.len(),
                    "search needs a candidate selection"
                );
                Ok(SearchOutcome::Disambiguation(prompt))
            }
            AssemblyOutcome::Record(record) => {
                let mut history = lock(&self.history);
                let stored = history.upsert(record);
                if let Err(error) = history.flush() {
                    tracing::warn!(error = %error, "failed to persist search history");
                }
                let record = stored.record;
                tracing::info!(
                    target = ?target,
                    id = %record.id,
                    response_type = record.resolved_type().as_str(),
                    replaced = stored.replaced,
                    "search saved to history"
                );
                Ok(SearchOutcome::Saved(record))
            }
        }
    }
}

async fn drive_search(
    inner: Arc<SessionInner>,
    mut stream: ChunkStream,
    mut assembler: ResponseAssembler,
    result_tx: oneshot::Sender<SessionResult<SearchOutcome>>,
) {
    let target = stream.target();
    let observer = inner.observer();

    let finished = loop {
        let Some(event) = stream.recv().await else {
            break None;
        };

        match event.payload {
            StreamEventPayload::Chunk(chunk) => {
                let kind = ProgressKind::of(&chunk);
                if let Some(observer) = live_observer(&observer, &stream) {
                    observer.on_progress(target, SearchProgress::Chunk(chunk.clone()));
                }
                let step = assembler.feed(chunk);
                if let Some(observer) = live_observer(&observer, &stream) {
                    report_progress(observer, target, kind, &assembler);
                }
                if let AssemblyStep::Finished(outcome) = step {
                    break Some(Ok(outcome));
                }
            }
            StreamEventPayload::Failed(message) => {
                break Some(
                    ConnectionLostSnafu {
                        stage: "read-search-stream",
                        message,
                    }
                    .fail(),
                );
            }
            StreamEventPayload::Ended => {
                break Some(
                    ConnectionLostSnafu {
                        stage: "read-search-stream",
                        message: "stream ended before a terminal event",
                    }
                    .fail(),
                );
            }
        }
    };

    if finished.is_none() && stream.is_cancelled() {
        tracing::debug!(target = ?target, "search stream stopped after cancel");
    }
    let result = inner.settle(target, finished);
    drop(stream);

    if result_tx.send(result).is_err() {
        tracing::debug!(target = ?target, "search result dropped by caller");
    }
}

/// The observer, unless the stream was cancelled since the event arrived.
fn live_observer<'a>(
    observer: &'a Option<Arc<dyn SearchObserver>>,
    stream: &ChunkStream,
) -> Option<&'a dyn SearchObserver> {
    observer.as_deref().filter(|_| !stream.is_cancelled())
}

#[derive(Clone, Copy)]
enum ProgressKind {
    Stage,
    Content,
    Other,
}

impl ProgressKind {
    fn of(chunk: &Chunk) -> Self {
        match chunk {
            Chunk::SearchStarted | Chunk::StageUpdate { .. } => Self::Stage,
            Chunk::ContentChunk { .. } | Chunk::ContentComplete { .. } => Self::Content,
            _ => Self::Other,
        }
    }
}

fn report_progress(
    observer: &dyn SearchObserver,
    target: StreamTarget,
    kind: ProgressKind,
    assembler: &ResponseAssembler,
) {
    match kind {
        ProgressKind::Stage => {
            if let Some(stage) = assembler.current_stage() {
                observer.on_progress(target, SearchProgress::Stage(stage.to_string()));
            }
        }
        ProgressKind::Content => {
            observer.on_progress(
                target,
                SearchProgress::Content(assembler.buffered_text().to_string()),
            );
        }
        ProgressKind::Other => {}
    }
}
