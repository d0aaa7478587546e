//! Stream Pipeline
//!
//! One task per stream turns raw chunks into delivered units:
//!
//! ```text
//!  ChunkSource ──bytes──► FrameDecoder ──frames──► PayloadPolicy
//!                                                     │
//!                           Passthrough ◄─────────────┴──────► PacingScheduler
//!                                │                                   │
//!                                └──────────► events channel ◄───────┘
//!                                                   │
//!                                              StreamHandle
//! ```
//!
//! # Cancellation
//!
//! A single [`CancellationToken`] is raced against every suspension point of
//! the task: connect, body read, pacing timer and channel send. The handle
//! checks the same token before returning any event, so nothing is observed
//! after `cancel()` even if it was already sitting in the channel.
//!
//! # Completion
//!
//! `Complete` is sent only when upstream has ended (sentinel or end of body)
//! and the pacing queue is empty.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::decoder::{Frame, FrameDecoder};
use crate::error::StreamError;
use crate::pacing::{PacingConfig, PacingScheduler};
use crate::policy::{PayloadPolicy, Unit};
use crate::progress::ProgressReporter;
use crate::transport::{ChunkSource, StreamClient};

/// Default capacity of the per-stream event channel
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Identifiers and Events
// ============================================================================

/// Unique identifier for one stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(Uuid);

impl StreamId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Counters collected over one stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_received: u64,
    pub frames: u64,
    pub units: u64,
    pub time_to_first_byte: Option<Duration>,
    pub duration: Duration,
    pub sentinel_seen: bool,
}

/// What a stream handle yields
#[derive(Debug)]
pub enum StreamEvent {
    Unit(Unit),
    Complete(StreamStats),
    Error(StreamError),
}

impl StreamEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unit(_))
    }
}

/// How a stream ended, as seen by its consumer
#[derive(Debug)]
pub enum StreamOutcome {
    Completed(StreamStats),
    Failed(StreamError),
    Cancelled,
}

// ============================================================================
// Options
// ============================================================================

/// Per-stream settings
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub pacing: PacingConfig,
    pub channel_capacity: usize,
    /// Receives byte counts and the first-unit signal
    pub progress: Option<ProgressReporter>,
    /// Token to use instead of a fresh one (e.g. a registry child token)
    pub cancel: Option<CancellationToken>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            progress: None,
            cancel: None,
        }
    }
}

impl StreamOptions {
    #[must_use]
    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// ============================================================================
// Observer API
// ============================================================================

/// Callback-style consumer of a stream
pub trait StreamObserver: Send {
    fn on_unit(&mut self, unit: &Unit);

    fn on_complete(&mut self, _stats: &StreamStats) {}

    fn on_error(&mut self, _error: &StreamError) {}
}

type UnitCallback = Box<dyn FnMut(&Unit) + Send>;
type CompleteCallback = Box<dyn FnMut(&StreamStats) + Send>;
type ErrorCallback = Box<dyn FnMut(&StreamError) + Send>;

/// Observer assembled from closures
#[derive(Default)]
pub struct StreamCallbacks {
    unit: Option<UnitCallback>,
    complete: Option<CompleteCallback>,
    error: Option<ErrorCallback>,
}

impl StreamCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_unit(mut self, f: impl FnMut(&Unit) + Send + 'static) -> Self {
        self.unit = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, f: impl FnMut(&StreamStats) + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl FnMut(&StreamError) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl StreamObserver for StreamCallbacks {
    fn on_unit(&mut self, unit: &Unit) {
        if let Some(f) = self.unit.as_mut() {
            f(unit);
        }
    }

    fn on_complete(&mut self, stats: &StreamStats) {
        if let Some(f) = self.complete.as_mut() {
            f(stats);
        }
    }

    fn on_error(&mut self, error: &StreamError) {
        if let Some(f) = self.error.as_mut() {
            f(error);
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Consumer side of one running stream
///
/// Dropping the handle cancels the stream.
pub struct StreamHandle {
    id: StreamId,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next event, or `None` once the stream ended or was cancelled
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }

        let event = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        };

        // Cancellation may have raced the receive
        if self.cancel.is_cancelled() {
            self.finished = true;
            return None;
        }

        match event {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Stop the stream; safe to call repeatedly and after completion
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(stream_id = %self.id, "stream cancelled by caller");
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this stream from elsewhere
    #[must_use]
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Events as a `Stream`, ending with the terminal event
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.next_event().await.map(|event| (event, handle))
        })
        .boxed()
    }

    /// Drive the stream to its end through an observer
    pub async fn run<O>(mut self, observer: &mut O) -> StreamOutcome
    where
        O: StreamObserver + ?Sized,
    {
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Unit(unit) => observer.on_unit(&unit),
                StreamEvent::Complete(stats) => {
                    observer.on_complete(&stats);
                    return StreamOutcome::Completed(stats);
                }
                StreamEvent::Error(error) => {
                    observer.on_error(&error);
                    return StreamOutcome::Failed(error);
                }
            }
        }
        StreamOutcome::Cancelled
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Opening Streams
// ============================================================================

/// Run the pipeline over an already-open source
///
/// Must be called within a tokio runtime.
pub fn open_stream<S>(source: S, policy: PayloadPolicy, options: StreamOptions) -> StreamHandle
where
    S: ChunkSource + 'static,
{
    spawn_stream(async move { Ok(source) }, policy, options)
}

impl StreamClient {
    /// POST `body` to `endpoint` and stream the response
    ///
    /// Connecting happens inside the stream task, so transport failures
    /// (including non-success statuses) arrive as the error event.
    pub fn open_stream<B>(
        &self,
        endpoint: &str,
        body: &B,
        policy: PayloadPolicy,
        options: StreamOptions,
    ) -> StreamHandle
    where
        B: Serialize + ?Sized,
    {
        let client = self.clone();
        let endpoint = endpoint.to_string();
        let body = serde_json::to_value(body);

        spawn_stream(
            async move {
                let body = body.map_err(|e| StreamError::InvalidRequest(e.to_string()))?;
                client.open(&endpoint, &body).await
            },
            policy,
            options,
        )
    }
}

fn spawn_stream<F, S>(connect: F, policy: PayloadPolicy, options: StreamOptions) -> StreamHandle
where
    F: Future<Output = Result<S, StreamError>> + Send + 'static,
    S: ChunkSource + 'static,
{
    let id = StreamId::new();
    let cancel = options.cancel.clone().unwrap_or_default();
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

    tracing::info!(stream_id = %id, %policy, "stream opened");
    tokio::spawn(run_stream(id, connect, policy, options, tx, cancel.clone()));

    StreamHandle {
        id,
        events: rx,
        cancel,
        finished: false,
    }
}

async fn run_stream<F, S>(
    id: StreamId,
    connect: F,
    policy: PayloadPolicy,
    options: StreamOptions,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    F: Future<Output = Result<S, StreamError>> + Send,
    S: ChunkSource,
{
    let started_at = Instant::now();

    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = connect => result,
    };

    let mut source = match connected {
        Ok(source) => source,
        Err(error) => {
            tracing::warn!(stream_id = %id, %error, "stream failed to open");
            send_event(&tx, &cancel, StreamEvent::Error(error)).await;
            return;
        }
    };

    let mut pipeline = Pipeline::new(id, policy, &options, started_at);
    pipeline.drive(&mut source, &tx, &cancel).await;
    source.abort();
}

/// Send raced against cancellation; `false` if the stream must stop
async fn send_event(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

// ============================================================================
// Pipeline State
// ============================================================================

/// Decoder, scheduler and counters for one stream
struct Pipeline {
    id: StreamId,
    policy: PayloadPolicy,
    decoder: FrameDecoder,
    scheduler: PacingScheduler,
    progress: Option<ProgressReporter>,
    stats: StreamStats,
    started_at: Instant,
    upstream_done: bool,
    /// Sequence for passthrough units
    next_seq: u64,
}

impl Pipeline {
    fn new(id: StreamId, policy: PayloadPolicy, options: &StreamOptions, started_at: Instant) -> Self {
        Self {
            id,
            policy,
            decoder: FrameDecoder::new(),
            scheduler: PacingScheduler::new(options.pacing.clone()),
            progress: options.progress.clone(),
            stats: StreamStats::default(),
            started_at,
            upstream_done: false,
            next_seq: 0,
        }
    }

    async fn drive<S>(
        &mut self,
        source: &mut S,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) where
        S: ChunkSource,
    {
        loop {
            if self.upstream_done && self.scheduler.is_idle() {
                self.stats.duration = self.started_at.elapsed();
                tracing::info!(
                    stream_id = %self.id,
                    bytes = self.stats.bytes_received,
                    units = self.stats.units,
                    sentinel = self.stats.sentinel_seen,
                    "stream complete"
                );
                send_event(tx, cancel, StreamEvent::Complete(self.stats.clone())).await;
                return;
            }

            let deadline = self.scheduler.deadline();

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.scheduler.cancel();
                    tracing::debug!(stream_id = %self.id, "pipeline stopped by cancellation");
                    return;
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(unit) = self.scheduler.poll_emit(Instant::now()) {
                        if !self.deliver(unit, tx, cancel).await {
                            return;
                        }
                    }
                }
                chunk = source.next_chunk(), if !self.upstream_done => match chunk {
                    Ok(Some(bytes)) => {
                        self.record_bytes(bytes.len());
                        let frames = self.decoder.feed(&bytes);
                        if !self.apply_frames(frames, tx, cancel).await {
                            return;
                        }
                        if self.upstream_done {
                            source.abort();
                        }
                    }
                    Ok(None) => {
                        let frames = self.decoder.finish();
                        if !self.apply_frames(frames, tx, cancel).await {
                            return;
                        }
                        self.upstream_done = true;
                        tracing::debug!(stream_id = %self.id, "end of body");
                    }
                    Err(error) => {
                        self.fail(error, tx, cancel).await;
                        return;
                    }
                }
            }
        }
    }

    fn record_bytes(&mut self, n: usize) {
        if self.stats.time_to_first_byte.is_none() {
            let ttfb = self.started_at.elapsed();
            self.stats.time_to_first_byte = Some(ttfb);
            tracing::debug!(stream_id = %self.id, ttfb_ms = ttfb.as_millis() as u64, "first byte");
        }
        self.stats.bytes_received += n as u64;
        if let Some(progress) = &self.progress {
            progress.bytes(n);
        }
    }

    /// Route decoded frames; stops at the sentinel
    async fn apply_frames(
        &mut self,
        frames: Vec<Frame>,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        for frame in frames {
            if self.upstream_done {
                break;
            }
            match frame {
                Frame::Blank => {}
                Frame::Sentinel => {
                    self.stats.sentinel_seen = true;
                    self.upstream_done = true;
                    tracing::debug!(stream_id = %self.id, "sentinel received");
                }
                Frame::Payload(text) => {
                    self.stats.frames += 1;
                    if self.policy.is_paced() {
                        self.scheduler.enqueue(self.policy.split(&text), Instant::now());
                    } else {
                        let unit = Unit::new(self.next_seq, text);
                        self.next_seq += 1;
                        if !self.deliver(unit, tx, cancel).await {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    async fn deliver(
        &mut self,
        unit: Unit,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        if self.stats.units == 0 {
            if let Some(progress) = &self.progress {
                progress.first_unit();
            }
        }
        self.stats.units += 1;
        send_event(tx, cancel, StreamEvent::Unit(unit)).await
    }

    /// Flush queued units without delay, then report the error
    async fn fail(
        &mut self,
        error: StreamError,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) {
        tracing::warn!(
            stream_id = %self.id,
            %error,
            queued = self.scheduler.backlog(),
            "stream interrupted"
        );
        for unit in self.scheduler.drain_all() {
            if !self.deliver(unit, tx, cancel).await {
                return;
            }
        }
        send_event(tx, cancel, StreamEvent::Error(error)).await;
    }
}
