//! Quiz Generation
//!
//! A quiz arrives as one JSON document streamed in passthrough fragments.
//! The fragments are accumulated verbatim (whitespace inside strings is
//! significant), parsed and validated once the stream completes, then handed
//! to the backend for persistence.
//!
//! ```text
//!  /quiz/stream ──Passthrough units──► QuizDraft ──parse──► GeneratedQuiz
//!        │                                                      │
//!   ProgressTracker (Warmup → Streaming → Finalizing)     QuizStore::save
//!                                                               │
//!                                                         Quiz  + 100%
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StreamError;
use crate::policy::PayloadPolicy;
use crate::progress::{ProgressConfig, ProgressTracker};
use crate::session::SessionId;
use crate::stream::{StreamEvent, StreamHandle, StreamOptions};
use crate::transport::StreamClient;
use crate::wire::{timestamp, ApiResponse};

/// Endpoint streaming the quiz document
pub const QUIZ_STREAM_ENDPOINT: &str = "/quiz/stream";

/// Endpoint persisting a streamed quiz
pub const QUIZ_SAVE_ENDPOINT: &str = "/quiz/save";

// ============================================================================
// Models
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "multiple-choice", alias = "MULTIPLE_CHOICE")]
    MultipleChoice,
    #[serde(rename = "true-false", alias = "TRUE_FALSE")]
    TrueFalse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: String,
}

/// A persisted quiz
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: String,
    pub topic: String,
    pub questions: Vec<QuizQuestion>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
}

/// The document the quiz stream produces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuiz {
    pub topic: String,
    pub questions: Vec<QuizQuestion>,
}

/// A user's progress through a quiz
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub quiz_id: String,
    pub chat_session_id: String,
    #[serde(default)]
    pub current_question_index: usize,
    #[serde(default)]
    pub user_answers: BTreeMap<usize, String>,
    #[serde(default)]
    pub is_submitted: BTreeMap<usize, bool>,
    #[serde(default)]
    pub score: u32,
    #[serde(default, alias = "isFinished")]
    pub finished: bool,
}

impl QuizState {
    /// Typed merge of an authoritative state into a local one
    ///
    /// The server owns `id`, `quiz_id`, `chat_session_id`, `user_answers`,
    /// `is_submitted`, `score` and `finished`. The local
    /// `current_question_index` survives only while it is ahead of the
    /// server's (the user advanced before the server caught up) and the quiz
    /// is not finished.
    #[must_use]
    pub fn merge_from_server(&self, server: QuizState) -> QuizState {
        let QuizState {
            id,
            quiz_id,
            chat_session_id,
            current_question_index: server_index,
            user_answers,
            is_submitted,
            score,
            finished,
        } = server;

        let same_quiz = quiz_id == self.quiz_id;
        let current_question_index =
            if same_quiz && !finished && self.current_question_index > server_index {
                self.current_question_index
            } else {
                server_index
            };

        QuizState {
            id,
            quiz_id,
            chat_session_id,
            current_question_index,
            user_answers,
            is_submitted,
            score,
            finished,
        }
    }

    /// Whether the answer for `index` has been submitted
    #[must_use]
    pub fn is_question_submitted(&self, index: usize) -> bool {
        self.is_submitted.get(&index).copied().unwrap_or(false)
    }
}

// ============================================================================
// Draft Accumulation
// ============================================================================

#[derive(Debug, Error)]
pub enum QuizDraftError {
    #[error("quiz stream produced no content")]
    Empty,

    #[error("quiz document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("quiz has no questions")]
    NoQuestions,

    #[error("question {index} has no options")]
    MissingOptions { index: usize },

    #[error("question {index}: correct answer {answer:?} is not among the options")]
    AnswerNotInOptions { index: usize, answer: String },
}

/// Verbatim accumulation of passthrough payloads
#[derive(Debug, Default, Clone)]
pub struct QuizDraft {
    text: String,
    fragments: usize,
}

impl QuizDraft {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The JSON body, without a surrounding markdown code fence
    #[must_use]
    pub fn document(&self) -> &str {
        strip_code_fence(&self.text)
    }

    /// Parse and validate the accumulated document
    pub fn parse(&self) -> Result<GeneratedQuiz, QuizDraftError> {
        let document = self.document();
        if document.is_empty() {
            return Err(QuizDraftError::Empty);
        }
        let quiz: GeneratedQuiz = serde_json::from_str(document)?;
        validate(&quiz)?;
        Ok(quiz)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn validate(quiz: &GeneratedQuiz) -> Result<(), QuizDraftError> {
    if quiz.questions.is_empty() {
        return Err(QuizDraftError::NoQuestions);
    }
    for (index, question) in quiz.questions.iter().enumerate() {
        if question.options.is_empty() {
            return Err(QuizDraftError::MissingOptions { index });
        }
        let answer = question.correct_answer.trim();
        let found = question.options.iter().any(|option| match question.kind {
            QuestionType::MultipleChoice => option.trim() == answer,
            QuestionType::TrueFalse => option.trim().eq_ignore_ascii_case(answer),
        });
        if !found {
            return Err(QuizDraftError::AnswerNotInOptions {
                index,
                answer: question.correct_answer.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Persistence Collaborator
// ============================================================================

/// Backend persistence of a streamed quiz
#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn save_streamed_quiz(
        &self,
        topic: &str,
        session_id: &SessionId,
        quiz_json: &str,
    ) -> anyhow::Result<Quiz>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveQuizRequest<'a> {
    topic: &'a str,
    chat_session_id: &'a str,
    quiz_json: &'a str,
}

/// `POST /quiz/save` on the streaming backend
#[derive(Clone)]
pub struct HttpQuizStore {
    client: StreamClient,
}

impl HttpQuizStore {
    #[must_use]
    pub fn new(client: StreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuizStore for HttpQuizStore {
    async fn save_streamed_quiz(
        &self,
        topic: &str,
        session_id: &SessionId,
        quiz_json: &str,
    ) -> anyhow::Result<Quiz> {
        let request = SaveQuizRequest {
            topic,
            chat_session_id: session_id.as_str(),
            quiz_json,
        };
        let response: ApiResponse<Quiz> = self.client.post_json(QUIZ_SAVE_ENDPOINT, &request).await?;
        response.into_data()
    }
}

// ============================================================================
// Generation Flow
// ============================================================================

#[derive(Debug, Error)]
pub enum QuizGenerationError {
    #[error("quiz stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("quiz generation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Draft(#[from] QuizDraftError),

    #[error("failed to save quiz: {0}")]
    Save(#[source] anyhow::Error),
}

/// Stream, validate and persist one quiz
pub struct QuizGeneration<S> {
    store: S,
    progress: ProgressConfig,
}

impl<S: QuizStore> QuizGeneration<S> {
    #[must_use]
    pub fn new(store: S, progress: ProgressConfig) -> Self {
        Self { store, progress }
    }

    /// Start a tracker for the next run; subscribe to it before running
    #[must_use]
    pub fn tracker(&self) -> ProgressTracker {
        ProgressTracker::spawn(self.progress.clone())
    }

    /// Generate over HTTP with `POST /quiz/stream {topic}`
    pub async fn run_http(
        &self,
        client: &StreamClient,
        topic: &str,
        session_id: &SessionId,
        tracker: &ProgressTracker,
    ) -> Result<Quiz, QuizGenerationError> {
        let body = serde_json::json!({ "topic": topic });
        self.run(topic, session_id, tracker, |options| {
            client.open_stream(QUIZ_STREAM_ENDPOINT, &body, PayloadPolicy::Passthrough, options)
        })
        .await
    }

    /// Generate using a stream opened by `open`
    ///
    /// `open` receives options wired to the tracker's reporter and must
    /// return a passthrough stream.
    pub async fn run<F>(
        &self,
        topic: &str,
        session_id: &SessionId,
        tracker: &ProgressTracker,
        open: F,
    ) -> Result<Quiz, QuizGenerationError>
    where
        F: FnOnce(StreamOptions) -> StreamHandle,
    {
        let reporter = tracker.reporter();
        let mut handle = open(StreamOptions::default().with_progress(reporter.clone()));
        let mut draft = QuizDraft::new();

        let stats = loop {
            match handle.next_event().await {
                Some(StreamEvent::Unit(unit)) => draft.push(&unit.text),
                Some(StreamEvent::Complete(stats)) => break stats,
                Some(StreamEvent::Error(error)) => {
                    tracker.cancel();
                    return Err(error.into());
                }
                None => {
                    tracker.cancel();
                    return Err(QuizGenerationError::Cancelled);
                }
            }
        };

        let generated = match draft.parse() {
            Ok(generated) => generated,
            Err(error) => {
                tracker.cancel();
                tracing::warn!(%error, fragments = draft.fragments(), "streamed quiz rejected");
                return Err(error.into());
            }
        };
        tracing::info!(
            topic,
            questions = generated.questions.len(),
            bytes = stats.bytes_received,
            "quiz stream complete"
        );

        reporter.begin_finalizing();
        let quiz = match self
            .store
            .save_streamed_quiz(topic, session_id, draft.document())
            .await
        {
            Ok(quiz) => quiz,
            Err(error) => {
                tracker.cancel();
                return Err(QuizGenerationError::Save(error));
            }
        };

        reporter.complete();
        tracing::info!(quiz_id = %quiz.id, %session_id, "quiz saved");
        Ok(quiz)
    }
}
