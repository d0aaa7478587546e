//! Pacing Scheduler
//!
//! Re-times bursty network delivery into a steady typing cadence.
//!
//! # Design Philosophy
//!
//! The scheduler is a plain state machine. It never sleeps and never spawns;
//! it tells its driver *when* the next unit is due and hands the unit over
//! when asked at or after that instant. The stream pipeline owns the single
//! timer, so there is never more than one pending emission and cancellation
//! is a matter of dropping a deadline.
//!
//! ```text
//!            enqueue (queue was empty)
//!   ┌──────┐ ─────────────────────────► ┌──────────┐
//!   │ Idle │                            │ Draining │ ◄─┐ emit, queue non-empty:
//!   └──────┘ ◄───────────────────────── └──────────┘ ──┘ reschedule
//!            emit, queue now empty
//!            or cancel
//! ```
//!
//! # Delay Tiers
//!
//! Two tiers keyed on backlog: above the threshold the fast delay lets the
//! display catch up, otherwise the slow delay gives a natural feel. Every
//! emission waits its delay, the first one included.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::policy::Unit;

// ============================================================================
// Configuration
// ============================================================================

/// Delay tiers for paced delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// Delay used while the backlog exceeds the threshold
    pub fast_delay: Duration,
    /// Delay used for a small backlog
    pub slow_delay: Duration,
    /// Backlog length above which the fast delay applies
    pub backlog_threshold: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            fast_delay: Duration::from_millis(5),
            slow_delay: Duration::from_millis(20),
            backlog_threshold: 30,
        }
    }
}

impl PacingConfig {
    /// Delay before the next emission given the current backlog
    #[must_use]
    pub fn delay_for(&self, backlog: usize) -> Duration {
        if backlog > self.backlog_threshold {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Queue plus the single scheduled emission
#[derive(Debug)]
pub struct PacingScheduler {
    config: PacingConfig,
    queue: VecDeque<String>,
    /// Due time of the scheduled emission; `Some` iff draining
    next_emit_at: Option<Instant>,
    next_seq: u64,
    cancelled: bool,
}

impl PacingScheduler {
    #[must_use]
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            next_emit_at: None,
            next_seq: 0,
            cancelled: false,
        }
    }

    /// Append units in order, scheduling an emission if idle
    pub fn enqueue<I>(&mut self, texts: I, now: Instant)
    where
        I: IntoIterator<Item = String>,
    {
        if self.cancelled {
            return;
        }
        self.queue.extend(texts);
        if self.next_emit_at.is_none() && !self.queue.is_empty() {
            self.next_emit_at = Some(now + self.config.delay_for(self.queue.len()));
        }
    }

    /// When the next unit is due, if one is scheduled
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.next_emit_at
    }

    /// Emit the head unit if its delay has elapsed
    ///
    /// Reschedules from `now` while units remain, otherwise returns to idle.
    pub fn poll_emit(&mut self, now: Instant) -> Option<Unit> {
        let due = self.next_emit_at?;
        if now < due {
            return None;
        }

        let text = self.queue.pop_front()?;
        let unit = Unit::new(self.next_seq, text);
        self.next_seq += 1;

        self.next_emit_at = if self.queue.is_empty() {
            None
        } else {
            Some(now + self.config.delay_for(self.queue.len()))
        };
        Some(unit)
    }

    /// Hand over every queued unit at once and go idle
    pub fn drain_all(&mut self) -> Vec<Unit> {
        self.next_emit_at = None;
        let start = self.next_seq;
        let units: Vec<Unit> = self
            .queue
            .drain(..)
            .zip(start..)
            .map(|(text, seq)| Unit::new(seq, text))
            .collect();
        self.next_seq += units.len() as u64;
        units
    }

    /// Clear the queue and drop the scheduled emission
    ///
    /// Later `enqueue` calls are ignored.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.queue.clear();
        self.next_emit_at = None;
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.next_emit_at.is_some()
    }

    /// Nothing queued and nothing scheduled
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.next_emit_at.is_none()
    }

    #[must_use]
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Units emitted so far
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chars(s: &str) -> Vec<String> {
        s.chars().map(String::from).collect()
    }

    #[test]
    fn test_delay_tiers() {
        let config = PacingConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(20));
        assert_eq!(config.delay_for(30), Duration::from_millis(20));
        assert_eq!(config.delay_for(31), Duration::from_millis(5));
    }

    #[test]
    fn test_first_unit_waits_its_delay() {
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let t0 = Instant::now();
        scheduler.enqueue(chars("Hi"), t0);

        assert!(scheduler.is_draining());
        assert_eq!(scheduler.deadline(), Some(t0 + Duration::from_millis(20)));
        assert_eq!(scheduler.poll_emit(t0), None);

        let t1 = t0 + Duration::from_millis(20);
        assert_eq!(scheduler.poll_emit(t1), Some(Unit::new(0, "H")));
        assert_eq!(scheduler.deadline(), Some(t1 + Duration::from_millis(20)));

        let t2 = t1 + Duration::from_millis(20);
        assert_eq!(scheduler.poll_emit(t2), Some(Unit::new(1, "i")));
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.deadline(), None);
    }

    #[test]
    fn test_enqueue_while_draining_keeps_single_deadline() {
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let t0 = Instant::now();
        scheduler.enqueue(chars("a"), t0);
        let first = scheduler.deadline();

        scheduler.enqueue(chars("bc"), t0 + Duration::from_millis(3));
        assert_eq!(scheduler.deadline(), first);
        assert_eq!(scheduler.backlog(), 3);
    }

    #[test]
    fn test_large_backlog_uses_fast_delay() {
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let t0 = Instant::now();
        scheduler.enqueue(chars(&"x".repeat(40)), t0);
        assert_eq!(scheduler.deadline(), Some(t0 + Duration::from_millis(5)));
    }

    #[test]
    fn test_order_preserved_for_any_backlog() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let mut now = Instant::now();
        for word in text.split_inclusive(' ') {
            scheduler.enqueue(chars(word), now);
        }

        let mut out = Vec::new();
        while let Some(deadline) = scheduler.deadline() {
            now = deadline;
            out.extend(scheduler.poll_emit(now));
        }

        let seqs: Vec<u64> = out.iter().map(|u| u.seq).collect();
        let expected: Vec<u64> = (0..out.len() as u64).collect();
        assert_eq!(seqs, expected);
        assert_eq!(out.iter().map(|u| u.text.as_str()).collect::<String>(), text);
    }

    #[test]
    fn test_cancel_clears_queue_and_deadline() {
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let t0 = Instant::now();
        scheduler.enqueue(chars("abc"), t0);
        scheduler.cancel();

        assert!(scheduler.is_idle());
        assert_eq!(scheduler.poll_emit(t0 + Duration::from_secs(1)), None);

        scheduler.enqueue(chars("late"), t0);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_drain_all_continues_sequence() {
        let mut scheduler = PacingScheduler::new(PacingConfig::default());
        let t0 = Instant::now();
        scheduler.enqueue(chars("abc"), t0);
        let first = scheduler.poll_emit(t0 + Duration::from_millis(20));
        assert_eq!(first, Some(Unit::new(0, "a")));

        let rest = scheduler.drain_all();
        assert_eq!(rest, vec![Unit::new(1, "b"), Unit::new(2, "c")]);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.emitted(), 3);
    }
}
