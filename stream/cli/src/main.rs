//! Mentor Stream CLI - Stream mentor answers and quizzes to the terminal
//!
//! Units are written to stdout as they are delivered; logs and the progress
//! indicator go to stderr, so the answer can be piped cleanly.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question, paced like typing
//! mentor-stream chat --body '{"message": "Explain lifetimes"}'
//!
//! # Follow a chat session and refresh it when the answer is complete
//! mentor-stream chat --session 42 --body '{"chatSessionId": "42", "message": "And traits?"}'
//!
//! # Generate and save a quiz, with a progress indicator
//! mentor-stream quiz --session 42 "Rust ownership"
//!
//! # Verbose logging
//! RUST_LOG=debug mentor-stream chat --body '{}'
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): cancels the stream; nothing further is printed

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use mentor_stream_core::{
    default_config_path, load_config_from_path, ChatSession, ConfigOverrides, HttpQuizStore,
    HttpSessionSource, PayloadPolicy, ProgressTracker, QuizGeneration, ReconcileError,
    ReconcileOutcome, SessionId, SessionReconciler, StreamCallbacks, StreamClient, StreamConfig,
    StreamEvent, StreamHandle,
};

/// Default chat streaming endpoint
const CHAT_STREAM_ENDPOINT: &str = "/chat/stream";

/// Mentor Stream - terminal client for the mentor streaming backend
#[derive(Parser, Debug)]
#[command(name = "mentor-stream")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend base URL (overrides config and environment)
    #[arg(short = 'u', long, env = "MENTOR_STREAM_BASE_URL", value_name = "URL")]
    base_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "MENTOR_STREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Connect timeout in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MENTOR_STREAM_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a chat answer
    Chat {
        /// Endpoint to POST to, relative to the base URL
        #[arg(short = 'e', long, default_value = CHAT_STREAM_ENDPOINT)]
        endpoint: String,

        /// JSON request body
        #[arg(short = 'b', long, default_value = "{}")]
        body: String,

        /// Payload policy: paced or passthrough
        #[arg(short = 'p', long)]
        policy: Option<PayloadPolicy>,

        /// Chat session to refresh once the answer completes
        #[arg(short = 's', long)]
        session: Option<String>,
    },

    /// Generate and save a quiz on a topic
    Quiz {
        /// Quiz topic
        topic: String,

        /// Chat session the quiz belongs to
        #[arg(short = 's', long)]
        session: String,

        /// Hide the progress indicator
        #[arg(long)]
        no_progress: bool,
    },
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries streamed content only.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "mentor_stream={level},mentor_stream_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load config from file and environment, then apply CLI overrides
fn resolve_config(args: &Args) -> Result<StreamConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.base_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(ms) = args.connect_timeout_ms {
        overrides = overrides.with_connect_timeout_ms(ms);
    }
    if let Command::Chat {
        policy: Some(policy),
        ..
    } = &args.command
    {
        overrides = overrides.with_policy(*policy);
    }
    overrides.apply(&mut config);
    config.validate()?;

    info!(
        source = %config.source(),
        base_url = %config.transport.base_url,
        policy = %config.default_policy,
        "Configuration resolved"
    );
    Ok(config)
}

/// Cancel `handle` on the first Ctrl-C
fn cancel_on_interrupt(handle: &StreamHandle) {
    let canceller = handle.canceller();
    tokio::spawn(async move {
        tokio::select! {
            () = canceller.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    warn!("Interrupted, cancelling stream");
                    canceller.cancel();
                }
            }
        }
    });
}

async fn write_out(out: &mut Stdout, text: &str) -> Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Write delivered units to `writer` in order
///
/// Returns the callbacks to follow a stream with and the writer task, which
/// hands the writer back once the callbacks are dropped.
fn spawn_unit_printer<W>(mut writer: W) -> (StreamCallbacks, JoinHandle<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let callbacks = StreamCallbacks::new().on_unit(move |unit| {
        let _ = tx.send(unit.text.clone());
    });

    let printer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if writer.write_all(text.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        writer
    });
    (callbacks, printer)
}

/// Stream a chat answer, optionally reconciling a session
async fn run_chat(
    config: &StreamConfig,
    client: &StreamClient,
    endpoint: &str,
    body: &str,
    session: Option<String>,
) -> Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(body).context("--body is not valid JSON")?;
    let mut out = tokio::io::stdout();

    let Some(session_id) = session else {
        let mut handle = client.open_stream(
            endpoint,
            &body,
            config.default_policy,
            config.stream_options(),
        );
        cancel_on_interrupt(&handle);

        while let Some(event) = handle.next_event().await {
            match event {
                StreamEvent::Unit(unit) => write_out(&mut out, &unit.text).await?,
                StreamEvent::Complete(stats) => {
                    write_out(&mut out, "\n").await?;
                    info!(
                        units = stats.units,
                        bytes = stats.bytes_received,
                        duration_ms = stats.duration.as_millis() as u64,
                        "Answer complete"
                    );
                    return Ok(());
                }
                StreamEvent::Error(e) => {
                    write_out(&mut out, "\n").await?;
                    return Err(e.into());
                }
            }
        }
        info!("Stream cancelled");
        return Ok(());
    };

    let session_id = SessionId::new(session_id);
    let source = HttpSessionSource::new(client.clone());
    let local = ChatSession::new(session_id.clone(), "");
    let mut reconciler =
        SessionReconciler::new(local, source).with_registry(config.build_registry());

    let start = reconciler.begin_stream(None)?;
    let handle = client.open_stream(
        endpoint,
        &body,
        config.default_policy,
        config.stream_options().with_cancel(start.cancel),
    );
    cancel_on_interrupt(&handle);

    let (mut printer_callbacks, printer) = spawn_unit_printer(tokio::io::stdout());
    let result = reconciler.follow_with(handle, &mut printer_callbacks).await;
    drop(printer_callbacks);
    printer.await.context("stdout writer task failed")?;
    write_out(&mut out, "\n").await?;

    match result {
        Ok(ReconcileOutcome::Completed(stats)) => {
            info!(%session_id, units = stats.units, "Session refreshed");
            Ok(())
        }
        Ok(ReconcileOutcome::Cancelled) => {
            info!(%session_id, "Stream cancelled");
            Ok(())
        }
        Err(ReconcileError::Refresh(e)) => {
            warn!(%session_id, error = %e, "Answer kept locally, session refresh failed");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Generate a quiz, drawing progress on stderr
async fn run_quiz(
    config: &StreamConfig,
    client: &StreamClient,
    topic: &str,
    session: &str,
    show_progress: bool,
) -> Result<()> {
    let generation = QuizGeneration::new(HttpQuizStore::new(client.clone()), config.progress.clone());
    let tracker = generation.tracker();
    let indicator = show_progress.then(|| spawn_progress_indicator(&tracker));

    let session_id = SessionId::new(session);
    let result = tokio::select! {
        result = generation.run_http(client, topic, &session_id, &tracker) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning quiz generation");
            tracker.cancel();
            return Ok(());
        }
    };
    tracker.cancel();
    if let Some(indicator) = indicator {
        let _ = indicator.await;
    }

    let quiz = result?;
    let mut out = tokio::io::stdout();
    let rendered = serde_json::to_string_pretty(&quiz)?;
    write_out(&mut out, &rendered).await?;
    write_out(&mut out, "\n").await?;
    info!(quiz_id = %quiz.id, questions = quiz.questions.len(), "Quiz saved");
    Ok(())
}

fn spawn_progress_indicator(tracker: &ProgressTracker) -> tokio::task::JoinHandle<()> {
    let mut updates = tracker.updates();
    tokio::spawn(async move {
        let mut err = tokio::io::stderr();
        let mut last = None;
        while let Some(snapshot) = updates.next().await {
            let percent = snapshot.percent();
            if last == Some(percent) {
                continue;
            }
            last = Some(percent);
            let line = format!("\r[{percent:>3}%] {:?}", snapshot.phase);
            if err.write_all(line.as_bytes()).await.is_err() {
                return;
            }
            let _ = err.flush().await;
        }
        let _ = err.write_all(b"\n").await;
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "mentor-stream failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = resolve_config(&args)?;
    let client = StreamClient::new(config.transport.clone())?;

    match args.command {
        Command::Chat {
            endpoint,
            body,
            session,
            ..
        } => run_chat(&config, &client, &endpoint, &body, session).await,
        Command::Quiz {
            topic,
            session,
            no_progress,
        } => run_quiz(&config, &client, &topic, &session, !no_progress).await,
    }
}
