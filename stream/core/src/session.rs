//! Session Reconciliation
//!
//! Merges a stream's units into a chat session and settles the result.
//!
//! # Design Philosophy
//!
//! The backend owns the truth. While a reply streams in, the session holds
//! one speculative placeholder entry that accumulates text locally. When the
//! stream completes the session is re-fetched and replaced wholesale, which
//! discards the placeholder and any drift between what was streamed and what
//! was persisted.
//!
//! ```text
//!   begin_stream ──► [user entry] [placeholder: Open]
//!        │
//!   apply_unit* ───► placeholder.text += unit
//!        │
//!        ├── complete ──► fetch_session ──► merge_fetched (placeholder gone)
//!        ├── fail ──────► placeholder: Partial (text kept) + error
//!        └── cancel ────► placeholder: Partial, or removed if empty
//! ```
//!
//! Observers get snapshots through a `watch` channel, published once per
//! transition.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StreamError;
use crate::policy::Unit;
use crate::quiz::{Quiz, QuizState};
use crate::registry::{RegistryError, StreamLease, StreamRegistry};
use crate::stream::{StreamCallbacks, StreamEvent, StreamHandle, StreamObserver, StreamStats};
use crate::transport::StreamClient;
use crate::wire::{timestamp, ApiResponse};

// ============================================================================
// Model
// ============================================================================

/// Backend identifier of a chat session
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Model,
}

/// Local streaming status of an entry (never sent over the wire)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryStatus {
    /// Authoritative or finished content
    #[default]
    Settled,
    /// Placeholder still receiving units
    Open,
    /// Placeholder whose stream ended early; text is last-known content
    Partial,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub text: String,
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    #[serde(skip)]
    pub local_id: Option<Uuid>,
    #[serde(skip)]
    pub status: EntryStatus,
}

impl ChatMessage {
    /// An optimistic user entry
    pub fn user(text: impl Into<String>, session_id: &SessionId) -> Self {
        Self {
            id: None,
            role: Role::User,
            text: text.into(),
            timestamp: Some(Utc::now()),
            chat_session_id: Some(session_id.to_string()),
            local_id: Some(Uuid::new_v4()),
            status: EntryStatus::Settled,
        }
    }

    /// An empty, open model entry
    #[must_use]
    pub fn placeholder(session_id: &SessionId) -> Self {
        Self {
            id: None,
            role: Role::Model,
            text: String::new(),
            timestamp: Some(Utc::now()),
            chat_session_id: Some(session_id.to_string()),
            local_id: Some(Uuid::new_v4()),
            status: EntryStatus::Open,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == EntryStatus::Open
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub quiz: Option<Quiz>,
    #[serde(default)]
    pub quiz_state: Option<QuizState>,
    #[serde(default)]
    pub active: bool,
}

impl ChatSession {
    pub fn new(id: SessionId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            created_at: Some(Utc::now()),
            messages: Vec::new(),
            quiz: None,
            quiz_state: None,
            active: true,
        }
    }

    /// The open placeholder, if a stream is in progress
    #[must_use]
    pub fn open_placeholder(&self) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.is_open())
    }

    #[must_use]
    pub fn open_placeholder_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_open()).count()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.open_placeholder().is_some()
    }

    /// Insert the placeholder for a new stream
    pub fn start_model_response(&mut self) -> Result<Uuid, ReconcileError> {
        if self.is_streaming() {
            return Err(ReconcileError::StreamAlreadyOpen(self.id.clone()));
        }
        let placeholder = ChatMessage::placeholder(&self.id);
        let local_id = placeholder.local_id.unwrap_or_else(Uuid::new_v4);
        self.messages.push(placeholder);
        Ok(local_id)
    }

    /// Append to the open placeholder
    pub fn append_streaming(&mut self, text: &str) -> Result<(), ReconcileError> {
        let placeholder = self
            .messages
            .iter_mut()
            .find(|m| m.is_open())
            .ok_or(ReconcileError::NoOpenPlaceholder)?;
        placeholder.text.push_str(text);
        Ok(())
    }

    /// Close the placeholder, keeping its text as settled content
    pub fn settle_streaming(&mut self) {
        if let Some(placeholder) = self.messages.iter_mut().find(|m| m.is_open()) {
            placeholder.status = EntryStatus::Settled;
        }
    }

    /// Close the placeholder early: keep its text as partial, or drop it
    /// when nothing arrived
    pub fn interrupt_streaming(&mut self) {
        let Some(index) = self.messages.iter().position(ChatMessage::is_open) else {
            return;
        };
        if self.messages[index].text.is_empty() {
            self.messages.remove(index);
        } else {
            self.messages[index].status = EntryStatus::Partial;
        }
    }

    /// Replace local state with an authoritative copy
    ///
    /// Backend fields overwrite local ones: `id`, `title`, `created_at`,
    /// `messages`, `quiz`, `active`. The quiz state goes through
    /// [`QuizState::merge_from_server`] so a local question index that is
    /// ahead of the server survives.
    pub fn merge_fetched(&mut self, fetched: ChatSession) {
        let ChatSession {
            id,
            title,
            created_at,
            messages,
            quiz,
            quiz_state,
            active,
        } = fetched;

        let quiz_state = match (self.quiz_state.take(), quiz_state) {
            (Some(local), Some(server)) => Some(local.merge_from_server(server)),
            (_, server) => server,
        };

        *self = ChatSession {
            id,
            title,
            created_at,
            messages,
            quiz,
            quiz_state,
            active,
        };
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Source of authoritative session state
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_session(&self, id: &SessionId) -> anyhow::Result<ChatSession>;
}

/// `GET /chat/sessions/{id}` on the backend
#[derive(Clone)]
pub struct HttpSessionSource {
    client: StreamClient,
}

impl HttpSessionSource {
    #[must_use]
    pub fn new(client: StreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_session(&self, id: &SessionId) -> anyhow::Result<ChatSession> {
        let endpoint = format!("/chat/sessions/{id}");
        let response: ApiResponse<ChatSession> = self.client.get_json(&endpoint).await?;
        response.into_data()
    }
}

// ============================================================================
// Reconciler
// ============================================================================

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("session {0} already has an open stream")]
    StreamAlreadyOpen(SessionId),

    #[error("no open placeholder to update")]
    NoOpenPlaceholder,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("failed to refresh session: {0}")]
    Refresh(#[source] anyhow::Error),
}

/// How a followed stream ended without error
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Completed and the session was refreshed
    Completed(StreamStats),
    /// Cancelled by the caller
    Cancelled,
}

/// Result of starting a stream
#[derive(Debug, Clone)]
pub struct StreamStart {
    /// Local id of the placeholder entry
    pub placeholder: Uuid,
    /// Token to open the stream with; cancelled by the registry if any
    pub cancel: CancellationToken,
}

/// Owns one session's state while streams run against it
pub struct SessionReconciler<S> {
    session: ChatSession,
    source: S,
    registry: Option<StreamRegistry>,
    lease: Option<StreamLease>,
    publisher: watch::Sender<ChatSession>,
}

impl<S: SessionSource> SessionReconciler<S> {
    #[must_use]
    pub fn new(session: ChatSession, source: S) -> Self {
        let (publisher, _) = watch::channel(session.clone());
        Self {
            session,
            source,
            registry: None,
            lease: None,
            publisher,
        }
    }

    /// Also claim the session in a shared registry while streaming
    #[must_use]
    pub fn with_registry(mut self, registry: StreamRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    #[must_use]
    pub fn into_session(self) -> ChatSession {
        self.session
    }

    /// Snapshots published at each transition
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatSession> {
        self.publisher.subscribe()
    }

    /// Insert the optional user entry and the placeholder
    ///
    /// Rejected while a stream for this session is open.
    pub fn begin_stream(&mut self, user_text: Option<&str>) -> Result<StreamStart, ReconcileError> {
        if self.session.is_streaming() {
            return Err(ReconcileError::StreamAlreadyOpen(self.session.id.clone()));
        }

        let lease = match &self.registry {
            Some(registry) => Some(registry.register(self.session.id.clone())?),
            None => None,
        };
        let cancel = lease.as_ref().map(StreamLease::token).unwrap_or_default();

        if let Some(text) = user_text {
            let entry = ChatMessage::user(text, &self.session.id);
            self.session.messages.push(entry);
        }
        let placeholder = self.session.start_model_response()?;
        self.lease = lease;

        tracing::debug!(session_id = %self.session.id, %placeholder, "placeholder opened");
        self.publish();
        Ok(StreamStart { placeholder, cancel })
    }

    /// Append one delivered unit to the placeholder
    pub fn apply_unit(&mut self, unit: &Unit) -> Result<(), ReconcileError> {
        self.session.append_streaming(&unit.text)?;
        // Same append on the published copy, not a full clone per unit
        self.publisher
            .send_if_modified(|published| published.append_streaming(&unit.text).is_ok());
        Ok(())
    }

    /// Refresh from the source and replace local state
    ///
    /// If the refresh fails the placeholder is settled in place with its
    /// accumulated text and the error is returned.
    pub async fn complete(&mut self) -> Result<(), ReconcileError> {
        self.lease = None;
        match self.source.fetch_session(&self.session.id).await {
            Ok(fetched) => {
                self.session.merge_fetched(fetched);
                tracing::debug!(session_id = %self.session.id, "session refreshed after stream");
                self.publish();
                Ok(())
            }
            Err(error) => {
                self.session.settle_streaming();
                tracing::warn!(session_id = %self.session.id, %error, "session refresh failed");
                self.publish();
                Err(ReconcileError::Refresh(error))
            }
        }
    }

    /// Keep partial text and report the failure
    pub fn fail(&mut self, error: StreamError) -> ReconcileError {
        self.lease = None;
        self.session.interrupt_streaming();
        tracing::warn!(session_id = %self.session.id, %error, "stream failed, partial content kept");
        self.publish();
        ReconcileError::Stream(error)
    }

    /// Close the placeholder after a caller cancellation
    pub fn cancel(&mut self) {
        self.lease = None;
        self.session.interrupt_streaming();
        tracing::debug!(session_id = %self.session.id, "stream cancelled, placeholder closed");
        self.publish();
    }

    /// Drive `handle` to its end, reconciling every event
    pub async fn follow(&mut self, handle: StreamHandle) -> Result<ReconcileOutcome, ReconcileError> {
        self.follow_with(handle, &mut StreamCallbacks::new()).await
    }

    /// Drive `handle` to its end, passing every event to `observer` too
    ///
    /// The observer gets each unit right after it is applied, including the
    /// units flushed just before an error, so output built from it always
    /// matches the text the session keeps.
    pub async fn follow_with<O>(
        &mut self,
        mut handle: StreamHandle,
        observer: &mut O,
    ) -> Result<ReconcileOutcome, ReconcileError>
    where
        O: StreamObserver + ?Sized,
    {
        while let Some(event) = handle.next_event().await {
            match event {
                StreamEvent::Unit(unit) => {
                    self.apply_unit(&unit)?;
                    observer.on_unit(&unit);
                }
                StreamEvent::Complete(stats) => {
                    observer.on_complete(&stats);
                    self.complete().await?;
                    return Ok(ReconcileOutcome::Completed(stats));
                }
                StreamEvent::Error(error) => {
                    observer.on_error(&error);
                    return Err(self.fail(error));
                }
            }
        }
        self.cancel();
        Ok(ReconcileOutcome::Cancelled)
    }

    fn publish(&self) {
        self.publisher.send_replace(self.session.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedSource(anyhow::Result<ChatSession>);

    #[async_trait]
    impl SessionSource for FixedSource {
        async fn fetch_session(&self, _id: &SessionId) -> anyhow::Result<ChatSession> {
            match &self.0 {
                Ok(session) => Ok(session.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    fn session() -> ChatSession {
        ChatSession::new(SessionId::new("s-1"), "Borrowing")
    }

    #[test]
    fn test_session_wire_format() {
        let json = r#"{
            "id": "s-1", "title": "Borrowing", "createdAt": "2024-05-01T10:00:00",
            "messages": [
                {"id": "m1", "role": "USER", "text": "hi", "chatSessionId": "s-1"},
                {"id": "m2", "role": "MODEL", "text": "hello", "timestamp": "2024-05-01T10:00:01"}
            ],
            "quiz": null, "quizState": null, "active": true
        }"#;
        let session: ChatSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, Role::Model);
        assert_eq!(session.messages[1].status, EntryStatus::Settled);
        assert!(session.created_at.is_some());

        let out = serde_json::to_value(&session.messages[0]).unwrap();
        assert_eq!(out["role"], "USER");
        assert!(out.get("status").is_none());
    }

    #[test]
    fn test_single_placeholder_per_session() {
        let mut session = session();
        session.start_model_response().unwrap();
        let second = session.start_model_response();
        assert!(matches!(second, Err(ReconcileError::StreamAlreadyOpen(_))));
        assert_eq!(session.open_placeholder_count(), 1);
    }

    #[test]
    fn test_interrupt_keeps_partial_or_removes_empty() {
        let mut session = session();
        session.start_model_response().unwrap();
        session.interrupt_streaming();
        assert!(session.messages.is_empty());

        session.start_model_response().unwrap();
        session.append_streaming("Half an ans").unwrap();
        session.interrupt_streaming();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].status, EntryStatus::Partial);
        assert_eq!(session.messages[0].text, "Half an ans");
    }

    #[test]
    fn test_append_without_placeholder_fails() {
        let mut session = session();
        assert!(matches!(
            session.append_streaming("x"),
            Err(ReconcileError::NoOpenPlaceholder)
        ));
    }

    #[test]
    fn test_merge_fetched_replaces_wholesale() {
        let mut local = session();
        local.start_model_response().unwrap();
        local.append_streaming("draft").unwrap();
        local.quiz_state = Some(QuizState {
            quiz_id: "q".into(),
            chat_session_id: "s-1".into(),
            current_question_index: 2,
            ..QuizState::default()
        });

        let mut fetched = session();
        fetched.title = "Borrowing, renamed".into();
        fetched.messages.push(ChatMessage {
            id: Some("m9".into()),
            role: Role::Model,
            text: "final".into(),
            timestamp: None,
            chat_session_id: Some("s-1".into()),
            local_id: None,
            status: EntryStatus::Settled,
        });
        fetched.quiz_state = Some(QuizState {
            quiz_id: "q".into(),
            chat_session_id: "s-1".into(),
            current_question_index: 1,
            score: 1,
            ..QuizState::default()
        });

        local.merge_fetched(fetched);
        assert_eq!(local.title, "Borrowing, renamed");
        assert_eq!(local.messages.len(), 1);
        assert_eq!(local.messages[0].text, "final");
        assert!(!local.is_streaming());
        let state = local.quiz_state.unwrap();
        assert_eq!(state.current_question_index, 2);
        assert_eq!(state.score, 1);
    }

    #[tokio::test]
    async fn test_reconciler_complete_refreshes() {
        let mut fetched = session();
        fetched.messages.push(ChatMessage::user("q", &fetched.id.clone()));
        let mut reconciler = SessionReconciler::new(session(), FixedSource(Ok(fetched.clone())));
        let rx = reconciler.subscribe();

        reconciler.begin_stream(Some("q")).unwrap();
        reconciler.apply_unit(&Unit::new(0, "A")).unwrap();
        assert_eq!(rx.borrow().open_placeholder().map(|m| m.text.clone()), Some("A".into()));

        reconciler.complete().await.unwrap();
        assert_eq!(reconciler.session(), &fetched);
        assert!(!rx.borrow().is_streaming());
    }

    #[test]
    fn test_published_snapshot_tracks_units() {
        let mut reconciler = SessionReconciler::new(session(), FixedSource(Ok(session())));
        let mut rx = reconciler.subscribe();
        reconciler.begin_stream(Some("q")).unwrap();
        rx.borrow_and_update();

        for text in ["Own", "er", "ship"] {
            reconciler.apply_unit(&Unit::new(0, text)).unwrap();
            assert!(rx.has_changed().unwrap());
            assert_eq!(*rx.borrow_and_update(), *reconciler.session());
        }

        reconciler.cancel();
        assert_eq!(*rx.borrow(), *reconciler.session());
        assert_eq!(reconciler.session().messages[1].status, EntryStatus::Partial);
    }

    #[tokio::test]
    async fn test_reconciler_refresh_failure_settles_placeholder() {
        let mut reconciler =
            SessionReconciler::new(session(), FixedSource(Err(anyhow::anyhow!("503"))));
        reconciler.begin_stream(None).unwrap();
        reconciler.apply_unit(&Unit::new(0, "kept")).unwrap();

        let err = reconciler.complete().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Refresh(_)));
        let last = reconciler.session().messages.last().unwrap();
        assert_eq!(last.text, "kept");
        assert_eq!(last.status, EntryStatus::Settled);
    }

    #[tokio::test]
    async fn test_reconciler_registry_claims_session() {
        let registry = StreamRegistry::default();
        let mut reconciler = SessionReconciler::new(session(), FixedSource(Ok(session())))
            .with_registry(registry.clone());

        let start = reconciler.begin_stream(None).unwrap();
        assert!(registry.has_stream(&SessionId::new("s-1")));
        assert!(registry.cancel(&SessionId::new("s-1")));
        assert!(start.cancel.is_cancelled());

        reconciler.cancel();
        assert!(!registry.has_stream(&SessionId::new("s-1")));
    }
}
