//! Progress Estimator
//!
//! A believable 0-100 progress value for a stream whose total size is not
//! known up front.
//!
//! # Phases
//!
//! ```text
//!  Warmup ──first unit──► Streaming ──save begins──► Finalizing ──complete──► 100
//!  time ramp              sqrt(volume) + time bonus  fixed step per tick
//! ```
//!
//! Phases only move forward. The target is recomputed on every tick from
//! telemetry alone; the displayed value chases it by a fraction of the
//! remaining distance and never goes backwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Configuration
// ============================================================================

/// Tunable constants of the heuristic
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressConfig {
    /// Interval between recomputations
    pub tick_interval: Duration,
    /// Value at the very start of warmup
    pub warmup_floor: f64,
    /// Value warmup ramps toward
    pub warmup_ceiling: f64,
    /// Length of the warmup ramp
    pub warmup_duration: Duration,
    /// Byte count considered a "full" response
    pub expected_bytes: u64,
    /// Weight of the volume term once streaming
    pub volume_weight: f64,
    /// Time bonus per second since first unit
    pub time_bonus_per_sec: f64,
    /// Upper bound of the time bonus
    pub time_bonus_cap: f64,
    /// Streaming never reports above this
    pub streaming_cap: f64,
    /// Increment per tick while finalizing
    pub finalizing_step: f64,
    /// Fraction of the remaining distance covered per tick, in (0, 1]
    pub smoothing: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            warmup_floor: 5.0,
            warmup_ceiling: 30.0,
            warmup_duration: Duration::from_secs(4),
            expected_bytes: 3000,
            volume_weight: 70.0,
            time_bonus_per_sec: 1.5,
            time_bonus_cap: 15.0,
            streaming_cap: 95.0,
            finalizing_step: 2.5,
            smoothing: 0.2,
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Heuristic phase, strictly forward-moving
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Warmup,
    Streaming,
    Finalizing,
}

/// Signals observed for one stream
#[derive(Clone, Debug)]
pub struct ProgressTelemetry {
    pub started_at: Instant,
    pub first_unit_at: Option<Instant>,
    pub bytes_received: u64,
    pub phase: ProgressPhase,
}

impl ProgressTelemetry {
    #[must_use]
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            first_unit_at: None,
            bytes_received: 0,
            phase: ProgressPhase::Warmup,
        }
    }

    pub fn record_bytes(&mut self, n: u64) {
        self.bytes_received = self.bytes_received.saturating_add(n);
    }

    /// First content arrived: Warmup moves to Streaming
    pub fn mark_first_unit(&mut self, now: Instant) {
        if self.first_unit_at.is_none() {
            self.first_unit_at = Some(now);
        }
        self.advance_to(ProgressPhase::Streaming);
    }

    pub fn begin_finalizing(&mut self) {
        self.advance_to(ProgressPhase::Finalizing);
    }

    fn advance_to(&mut self, phase: ProgressPhase) {
        if phase > self.phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "progress phase transition");
            self.phase = phase;
        }
    }
}

/// Target value for Warmup and Streaming telemetry
///
/// Finalizing is stateful (it steps from the displayed value) and is handled
/// by [`ProgressEstimator`].
#[must_use]
pub fn estimate_target(telemetry: &ProgressTelemetry, config: &ProgressConfig, now: Instant) -> f64 {
    match (telemetry.phase, telemetry.first_unit_at) {
        (ProgressPhase::Warmup, _) | (_, None) => {
            let elapsed = now.saturating_duration_since(telemetry.started_at);
            let window = config.warmup_duration.as_secs_f64();
            let ratio = if window > 0.0 {
                (elapsed.as_secs_f64() / window).min(1.0)
            } else {
                1.0
            };
            config.warmup_floor + (config.warmup_ceiling - config.warmup_floor) * ratio
        }
        (_, Some(first)) => {
            let expected = config.expected_bytes.max(1) as f64;
            let volume = (telemetry.bytes_received as f64 / expected).sqrt() * config.volume_weight;
            let since_first = now.saturating_duration_since(first).as_secs_f64();
            let bonus = (since_first * config.time_bonus_per_sec).min(config.time_bonus_cap);
            (config.warmup_floor + volume + bonus).min(config.streaming_cap)
        }
    }
}

// ============================================================================
// Estimator
// ============================================================================

/// Displayed value plus the telemetry it is derived from
#[derive(Debug)]
pub struct ProgressEstimator {
    config: ProgressConfig,
    telemetry: ProgressTelemetry,
    displayed: f64,
    completed: bool,
}

impl ProgressEstimator {
    #[must_use]
    pub fn new(config: ProgressConfig, started_at: Instant) -> Self {
        Self {
            config,
            telemetry: ProgressTelemetry::new(started_at),
            displayed: 0.0,
            completed: false,
        }
    }

    #[must_use]
    pub fn telemetry(&self) -> &ProgressTelemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut ProgressTelemetry {
        &mut self.telemetry
    }

    #[must_use]
    pub fn phase(&self) -> ProgressPhase {
        self.telemetry.phase
    }

    #[must_use]
    pub fn displayed(&self) -> f64 {
        self.displayed
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Recompute the target and move the displayed value toward it
    pub fn tick(&mut self, now: Instant) -> f64 {
        if self.completed {
            return self.displayed;
        }

        let next = if self.telemetry.phase == ProgressPhase::Finalizing {
            (self.displayed + self.config.finalizing_step).min(100.0)
        } else {
            let target = estimate_target(&self.telemetry, &self.config, now);
            if target > self.displayed {
                let step = (target - self.displayed) * self.config.smoothing;
                (self.displayed + step).min(target)
            } else {
                self.displayed
            }
        };

        self.displayed = next.max(self.displayed).clamp(0.0, 100.0);
        self.displayed
    }

    /// Pin to 100; later ticks are no-ops
    pub fn complete(&mut self) {
        self.telemetry.begin_finalizing();
        self.displayed = 100.0;
        self.completed = true;
    }
}

// ============================================================================
// Tracker Task
// ============================================================================

/// Telemetry message sent to a running tracker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressSignal {
    Bytes(u64),
    FirstUnit,
    BeginFinalizing,
    Complete,
}

/// Published state of a tracker
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub value: f64,
    pub phase: ProgressPhase,
    pub done: bool,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            value: 0.0,
            phase: ProgressPhase::Warmup,
            done: false,
        }
    }
}

impl ProgressSnapshot {
    /// Rounded percentage for display
    #[must_use]
    pub fn percent(&self) -> u8 {
        self.value.round().clamp(0.0, 100.0) as u8
    }
}

/// Cloneable sender of telemetry to a tracker
///
/// Sends never block; signals sent after the tracker stops are dropped.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressSignal>,
}

impl ProgressReporter {
    pub fn bytes(&self, n: usize) {
        let _ = self.tx.send(ProgressSignal::Bytes(n as u64));
    }

    pub fn first_unit(&self) {
        let _ = self.tx.send(ProgressSignal::FirstUnit);
    }

    pub fn begin_finalizing(&self) {
        let _ = self.tx.send(ProgressSignal::BeginFinalizing);
    }

    pub fn complete(&self) {
        let _ = self.tx.send(ProgressSignal::Complete);
    }
}

/// Fixed-interval tick loop running in its own task
pub struct ProgressTracker {
    reporter: ProgressReporter,
    value: watch::Receiver<ProgressSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProgressTracker {
    /// Start ticking now
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(config: ProgressConfig) -> Self {
        Self::spawn_with_cancel(config, CancellationToken::new())
    }

    /// Start ticking, stopping when `cancel` fires
    #[must_use]
    pub fn spawn_with_cancel(config: ProgressConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (value_tx, value_rx) = watch::channel(ProgressSnapshot::default());
        let task = tokio::spawn(run_tracker(config, rx, value_tx, cancel.clone()));

        Self {
            reporter: ProgressReporter { tx },
            value: value_rx,
            cancel,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    /// Receiver of displayed values; changes at most once per tick
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.value.clone()
    }

    /// Displayed values as a `Stream`, starting with the current one
    ///
    /// Ends once the tick loop exits.
    #[must_use]
    pub fn updates(&self) -> WatchStream<ProgressSnapshot> {
        WatchStream::new(self.value.clone())
    }

    #[must_use]
    pub fn current(&self) -> ProgressSnapshot {
        *self.value.borrow()
    }

    /// Stop ticking without completing
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the tick loop to exit
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_tracker(
    config: ProgressConfig,
    mut signals: mpsc::UnboundedReceiver<ProgressSignal>,
    value: watch::Sender<ProgressSnapshot>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut estimator = ProgressEstimator::new(config, Instant::now());

    let publish = |estimator: &ProgressEstimator| {
        value.send_replace(ProgressSnapshot {
            value: estimator.displayed(),
            phase: estimator.phase(),
            done: estimator.is_complete(),
        });
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("progress tracker cancelled");
                break;
            }
            signal = signals.recv() => match signal {
                Some(ProgressSignal::Bytes(n)) => estimator.telemetry_mut().record_bytes(n),
                Some(ProgressSignal::FirstUnit) => {
                    estimator.telemetry_mut().mark_first_unit(Instant::now());
                }
                Some(ProgressSignal::BeginFinalizing) => {
                    estimator.telemetry_mut().begin_finalizing();
                }
                Some(ProgressSignal::Complete) => {
                    estimator.complete();
                    publish(&estimator);
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                estimator.tick(Instant::now());
                publish(&estimator);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn test_warmup_target_ramps_and_caps() {
        let config = ProgressConfig::default();
        let start = Instant::now();
        let telemetry = ProgressTelemetry::new(start);

        assert!((estimate_target(&telemetry, &config, start) - 5.0).abs() < 1e-9);
        assert!((estimate_target(&telemetry, &config, at(start, 2000)) - 17.5).abs() < 1e-9);
        assert!((estimate_target(&telemetry, &config, at(start, 60_000)) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_streaming_target_capped_below_100() {
        let config = ProgressConfig::default();
        let start = Instant::now();
        let mut telemetry = ProgressTelemetry::new(start);
        telemetry.mark_first_unit(start);
        telemetry.record_bytes(1_000_000);

        let target = estimate_target(&telemetry, &config, at(start, 120_000));
        assert!((target - config.streaming_cap).abs() < 1e-9);
    }

    #[test]
    fn test_streaming_volume_has_diminishing_returns() {
        let config = ProgressConfig::default();
        let start = Instant::now();
        let mut telemetry = ProgressTelemetry::new(start);
        telemetry.mark_first_unit(start);

        telemetry.record_bytes(750);
        let quarter = estimate_target(&telemetry, &config, start);
        telemetry.record_bytes(750);
        let half = estimate_target(&telemetry, &config, start);

        // sqrt(0.25) * 70 = 35, sqrt(0.5) * 70 ~= 49.5
        assert!((quarter - 40.0).abs() < 1e-9);
        assert!(half - quarter < quarter - config.warmup_floor);
    }

    #[test]
    fn test_phase_never_moves_backwards() {
        let start = Instant::now();
        let mut telemetry = ProgressTelemetry::new(start);
        telemetry.begin_finalizing();
        telemetry.mark_first_unit(start);
        assert_eq!(telemetry.phase, ProgressPhase::Finalizing);
    }

    #[test]
    fn test_displayed_is_monotonic_and_reaches_100() {
        let config = ProgressConfig::default();
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(config, start);
        let mut last = 0.0;
        let mut now = start;

        for step in 0..300u64 {
            now = at(now, 100);
            match step {
                20 => estimator.telemetry_mut().mark_first_unit(now),
                21..=200 => estimator.telemetry_mut().record_bytes(25),
                220 => estimator.telemetry_mut().begin_finalizing(),
                _ => {}
            }
            let value = estimator.tick(now);
            assert!(value >= last, "regressed from {last} to {value} at tick {step}");
            assert!(value <= 100.0);
            last = value;
        }

        estimator.complete();
        assert!((estimator.displayed() - 100.0).abs() < f64::EPSILON);
        assert!((estimator.tick(at(now, 100)) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finalizing_steps_from_displayed_value() {
        let config = ProgressConfig::default();
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(config, start);
        estimator.tick(at(start, 100));
        let before = estimator.displayed();

        estimator.telemetry_mut().begin_finalizing();
        let after = estimator.tick(at(start, 200));
        assert!((after - (before + 2.5)).abs() < 1e-9);
    }

    #[test]
    fn test_smoothing_never_overshoots() {
        let config = ProgressConfig {
            smoothing: 1.0,
            ..ProgressConfig::default()
        };
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(config.clone(), start);
        let now = at(start, 1000);
        let value = estimator.tick(now);
        let target = estimate_target(estimator.telemetry(), &config, now);
        assert!((value - target).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_publishes_and_completes() {
        let tracker = ProgressTracker::spawn(ProgressConfig::default());
        let reporter = tracker.reporter();
        let mut rx = tracker.subscribe();

        tokio::time::sleep(Duration::from_millis(550)).await;
        let warm = tracker.current();
        assert_eq!(warm.phase, ProgressPhase::Warmup);
        assert!(warm.value > 0.0);

        reporter.first_unit();
        reporter.bytes(1500);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let streaming = tracker.current();
        assert_eq!(streaming.phase, ProgressPhase::Streaming);
        assert!(streaming.value >= warm.value);

        reporter.complete();
        rx.wait_for(|s| s.done).await.unwrap();
        assert_eq!(tracker.current().percent(), 100);
        tracker.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_stream_ends_after_complete() {
        use tokio_stream::StreamExt;

        let tracker = ProgressTracker::spawn(ProgressConfig::default());
        let reporter = tracker.reporter();
        let updates = tracker.updates();

        tokio::time::sleep(Duration::from_millis(300)).await;
        reporter.complete();

        let seen: Vec<ProgressSnapshot> = updates.collect().await;
        assert!(seen.last().is_some_and(|s| s.done));
        for pair in seen.windows(2) {
            assert!(pair[1].value >= pair[0].value);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_stops_on_cancel() {
        let tracker = ProgressTracker::spawn(ProgressConfig::default());
        tokio::time::sleep(Duration::from_millis(250)).await;
        tracker.cancel();
        let frozen = tracker.current();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tracker.current(), frozen);
        assert!(!frozen.done);
    }
}
