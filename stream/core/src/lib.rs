//! Mentor Stream Core - Incremental Response Streaming for the mentor client
//!
//! This crate turns a streaming POST response from the mentor backend into an
//! ordered sequence of deliverable units, paces them like typing when asked,
//! estimates progress while the response is in flight, and reconciles the
//! local chat session with the authoritative copy once the stream ends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Consumers                                  │
//! │   SessionReconciler    QuizGeneration    CLI / custom observer   │
//! └──────────────▲─────────────────▲──────────────────▲──────────────┘
//!                │   StreamEvent   │                  │
//! ┌──────────────┴─────────────────┴──────────────────┴──────────────┐
//! │                        StreamHandle                               │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────────┐  │
//! │  │ChunkSource │──►│ FrameDecoder │──►│ PayloadPolicy          │  │
//! │  │(HTTP body) │   │ data: lines  │   │  Passthrough ─────────►│──┼─► Unit
//! │  └────────────┘   └──────────────┘   │  PacedTyping ─► Pacing │  │
//! │        │                              │           Scheduler ──►│──┼─► Unit
//! │        └── bytes ──► ProgressTracker  └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamClient`]: HTTP client bound to the backend base URL
//! - [`StreamHandle`]: A running stream; yields [`StreamEvent`]s, cancellable
//! - [`FrameDecoder`]: Chunk-boundary-safe `data:` line decoder
//! - [`PacingScheduler`]: Adaptive typing-speed delivery queue
//! - [`ProgressTracker`]: Monotonic progress estimate for a pending response
//! - [`SessionReconciler`]: Placeholder lifecycle and post-stream refetch
//! - [`StreamRegistry`]: One active stream per chat session
//!
//! # Quick Start
//!
//! ```ignore
//! use mentor_stream_core::{load_config, PayloadPolicy, StreamClient, StreamEvent};
//!
//! let config = load_config()?;
//! let client = StreamClient::new(config.transport.clone())?;
//! let body = serde_json::json!({ "message": "Explain borrowing" });
//! let mut handle = client.open_stream(
//!     "/chat/stream",
//!     &body,
//!     PayloadPolicy::PacedTyping,
//!     config.stream_options(),
//! );
//!
//! while let Some(event) = handle.next_event().await {
//!     match event {
//!         StreamEvent::Unit(unit) => print!("{}", unit.text),
//!         StreamEvent::Complete(_) => break,
//!         StreamEvent::Error(e) => eprintln!("{e}"),
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: TOML, environment and CLI configuration layering
//! - [`decoder`]: Incremental `data:` frame decoding
//! - [`error`]: Per-stream error type
//! - [`pacing`]: Typing-speed delivery scheduler
//! - [`policy`]: Payload-to-unit policies
//! - [`progress`]: Progress estimation and the tick task
//! - [`quiz`]: Streamed quiz generation and quiz state merging
//! - [`registry`]: Concurrent per-session stream registry
//! - [`session`]: Chat session model and reconciliation
//! - [`stream`]: The stream pipeline and its handle
//! - [`transport`]: Chunk sources and the HTTP client
//! - [`wire`]: Backend response envelope and timestamp parsing

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod decoder;
pub mod error;
pub mod pacing;
pub mod policy;
pub mod progress;
pub mod quiz;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use decoder::{decode_all, parse_line, Frame, FrameDecoder, DATA_PREFIX, DONE_SENTINEL};
pub use error::StreamError;
pub use pacing::{PacingConfig, PacingScheduler};
pub use policy::{PayloadPolicy, Unit};
pub use progress::{
    ProgressConfig, ProgressEstimator, ProgressPhase, ProgressReporter, ProgressSnapshot,
    ProgressTracker,
};
pub use stream::{
    open_stream, StreamCallbacks, StreamEvent, StreamHandle, StreamId, StreamObserver,
    StreamOptions, StreamOutcome, StreamStats,
};
pub use transport::{
    ChannelSource, ChunkSender, ChunkSource, HttpChunkSource, StreamClient, TransportConfig,
};
pub use wire::ApiResponse;

// Session exports
pub use session::{
    ChatMessage, ChatSession, EntryStatus, HttpSessionSource, ReconcileError, ReconcileOutcome,
    Role, SessionId, SessionReconciler, SessionSource, StreamStart,
};

// Quiz exports
pub use quiz::{
    GeneratedQuiz, HttpQuizStore, QuestionType, Quiz, QuizDraft, QuizDraftError, QuizGeneration,
    QuizGenerationError, QuizQuestion, QuizState, QuizStore,
};

// Registry exports
pub use registry::{RegistryConfig, RegistryError, StreamLease, StreamRegistry};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, StreamConfig, StreamToml,
};
