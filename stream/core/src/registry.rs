//! Stream Registry
//!
//! Tracks which sessions currently have a stream open.
//!
//! # Design Philosophy
//!
//! Each session may have at most one open stream; a second send must wait
//! until the first finishes or is cancelled. The registry enforces that rule
//! across tasks, caps the number of concurrent streams, and can cancel any
//! stream it tracks through a child of its own cancellation token.
//!
//! Registration returns a [`StreamLease`]. The entry lives exactly as long
//! as the lease: dropping it (on completion, failure, cancellation or panic
//! unwinding) frees the session for the next stream.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::session::SessionId;
use crate::stream::StreamId;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of streams open at once
    pub max_concurrent_streams: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 16,
        }
    }
}

/// Error when registering a stream
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {0} already has an open stream")]
    StreamAlreadyOpen(SessionId),

    #[error("maximum concurrent streams reached ({0})")]
    MaxStreamsReached(usize),
}

// ============================================================================
// Registry
// ============================================================================

struct ActiveStream {
    stream_id: StreamId,
    cancel: CancellationToken,
    registered_at: Instant,
}

struct RegistryInner {
    config: RegistryConfig,
    streams: DashMap<SessionId, ActiveStream>,
    /// Slots held by live leases; never exceeds the configured maximum
    reserved: AtomicUsize,
    root: CancellationToken,
    total_registered: AtomicU64,
    total_cancelled: AtomicU64,
}

/// Shared, cloneable registry of open streams
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl StreamRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                streams: DashMap::new(),
                reserved: AtomicUsize::new(0),
                root: CancellationToken::new(),
                total_registered: AtomicU64::new(0),
                total_cancelled: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Claim the session for a new stream
    pub fn register(&self, session_id: SessionId) -> Result<StreamLease, RegistryError> {
        let max = self.inner.config.max_concurrent_streams;
        let reserved = self
            .inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            return Err(RegistryError::MaxStreamsReached(max));
        }

        let stream_id = StreamId::new();
        let cancel = self.inner.root.child_token();

        match self.inner.streams.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                self.inner.reserved.fetch_sub(1, Ordering::AcqRel);
                return Err(RegistryError::StreamAlreadyOpen(session_id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveStream {
                    stream_id,
                    cancel: cancel.clone(),
                    registered_at: Instant::now(),
                });
            }
        }

        self.inner.total_registered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%session_id, %stream_id, "stream registered");

        Ok(StreamLease {
            inner: Arc::clone(&self.inner),
            session_id,
            stream_id,
            cancel,
        })
    }

    /// Cancel the session's stream; `false` if it has none
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.inner.streams.get(session_id) {
            Some(active) => {
                active.cancel.cancel();
                self.inner.total_cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%session_id, stream_id = %active.stream_id, "stream cancelled via registry");
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked stream, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for active in self.inner.streams.iter() {
            if !active.cancel.is_cancelled() {
                active.cancel.cancel();
                count += 1;
            }
        }
        self.inner
            .total_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            tracing::info!(count, "cancelled all streams");
        }
        count
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }

    #[must_use]
    pub fn has_stream(&self, session_id: &SessionId) -> bool {
        self.inner.streams.contains_key(session_id)
    }

    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.inner.streams.iter().map(|e| e.key().clone()).collect()
    }

    /// How long the session's stream has been open
    #[must_use]
    pub fn stream_age(&self, session_id: &SessionId) -> Option<std::time::Duration> {
        self.inner
            .streams
            .get(session_id)
            .map(|active| active.registered_at.elapsed())
    }

    /// Streams registered over the registry's lifetime
    #[must_use]
    pub fn total_registered(&self) -> u64 {
        self.inner.total_registered.load(Ordering::Relaxed)
    }

    /// Streams cancelled through the registry over its lifetime
    #[must_use]
    pub fn total_cancelled(&self) -> u64 {
        self.inner.total_cancelled.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Registration of one stream; dropping it unregisters
pub struct StreamLease {
    inner: Arc<RegistryInner>,
    session_id: SessionId,
    stream_id: StreamId,
    cancel: CancellationToken,
}

impl StreamLease {
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Token to hand to the stream; the registry cancels through it
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let stream_id = self.stream_id;
        let removed = self
            .inner
            .streams
            .remove_if(&self.session_id, |_, active| active.stream_id == stream_id);
        self.inner.reserved.fetch_sub(1, Ordering::AcqRel);
        if removed.is_some() {
            tracing::debug!(session_id = %self.session_id, %stream_id, "stream unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn test_registry_defaults() {
        let registry = StreamRegistry::default();
        assert_eq!(registry.config().max_concurrent_streams, 16);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_stream_for_session_rejected() {
        let registry = StreamRegistry::default();
        let _lease = registry.register(sid("a")).unwrap();

        let result = registry.register(sid("a"));
        assert_eq!(result.err(), Some(RegistryError::StreamAlreadyOpen(sid("a"))));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_max_streams_limit() {
        let registry = StreamRegistry::new(RegistryConfig {
            max_concurrent_streams: 2,
        });
        let _a = registry.register(sid("a")).unwrap();
        let _b = registry.register(sid("b")).unwrap();

        assert_eq!(
            registry.register(sid("c")).err(),
            Some(RegistryError::MaxStreamsReached(2))
        );
    }

    #[test]
    fn test_rejected_duplicate_releases_its_slot() {
        let registry = StreamRegistry::new(RegistryConfig {
            max_concurrent_streams: 2,
        });
        let _a = registry.register(sid("a")).unwrap();
        assert!(registry.register(sid("a")).is_err());
        assert!(registry.register(sid("b")).is_ok());
    }

    #[test]
    fn test_max_streams_holds_under_concurrent_registration() {
        let registry = StreamRegistry::new(RegistryConfig {
            max_concurrent_streams: 4,
        });
        let barrier = Arc::new(Barrier::new(32));

        let threads: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.register(sid(&format!("s-{i}"))).ok()
                })
            })
            .collect();
        let leases: Vec<StreamLease> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();

        assert_eq!(leases.len(), 4);
        assert_eq!(registry.active_count(), 4);

        drop(leases);
        assert!(registry.is_empty());
        assert!(registry.register(sid("late")).is_ok());
    }

    #[test]
    fn test_dropping_lease_frees_session() {
        let registry = StreamRegistry::default();
        let lease = registry.register(sid("a")).unwrap();
        assert!(registry.has_stream(&sid("a")));

        drop(lease);
        assert!(!registry.has_stream(&sid("a")));
        assert!(registry.register(sid("a")).is_ok());
        assert_eq!(registry.total_registered(), 2);
    }

    #[test]
    fn test_cancel_reaches_lease_token() {
        let registry = StreamRegistry::default();
        let lease = registry.register(sid("a")).unwrap();
        let token = lease.token();

        assert!(registry.cancel(&sid("a")));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&sid("missing")));
        assert_eq!(registry.total_cancelled(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let registry = StreamRegistry::default();
        let a = registry.register(sid("a")).unwrap();
        let b = registry.register(sid("b")).unwrap();

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        // Already cancelled streams are not counted twice
        assert_eq!(registry.cancel_all(), 0);

        let mut sessions = registry.active_sessions();
        sessions.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(sessions, vec![sid("a"), sid("b")]);
    }
}
