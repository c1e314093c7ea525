//! # Memory Pressure Monitor
//!
//! Samples a [`MemoryProbe`] on a fixed interval, classifies the usage ratio
//! into a [`PressureLevel`] and shrinks the recommended batch sizes as memory
//! fills up. At `High` and `Critical` it runs a forced reclaim: the probe's
//! own cache release plus any registered hooks (typically clearing the
//! sample buffer pool).
//!
//! The sampling loop is a tokio task. [`start`](MemoryPressureMonitor::start)
//! and [`stop`](MemoryPressureMonitor::stop) are idempotent and the monitor
//! can be restarted after stopping.
//!
//! ```ignore
//! let monitor = MemoryPressureMonitor::new(settings, budget.available_bytes(), probe)
//!     .with_event_bus(bus.clone());
//! let pool = buffer_pool.clone();
//! monitor.add_reclaim_hook(move || pool.clear());
//! monitor.start();
//!
//! let batch = monitor.synthesis_batch_size();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bridge_traits::memory::{MemoryProbe, MemorySnapshot};
use core_runtime::config::MemorySettings;
use core_runtime::events::{CoreEvent, EventBus, MemoryEvent};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Number of most recent snapshots used for [`MemoryPressureMonitor::usage_trend`].
const TREND_WINDOW: usize = 5;

/// Memory pressure, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl PressureLevel {
    /// Level for a usage ratio. Depends only on the ratio and the thresholds.
    pub fn classify(ratio: f64, settings: &MemorySettings) -> Self {
        if ratio >= settings.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= settings.high_threshold {
            PressureLevel::High
        } else if ratio >= settings.elevated_threshold {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Elevated => "elevated",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }

    pub fn multiplier(&self, settings: &MemorySettings) -> f64 {
        settings.multipliers[*self as usize]
    }

    /// Whether this level triggers a forced reclaim.
    pub fn requires_reclaim(&self) -> bool {
        matches!(self, PressureLevel::High | PressureLevel::Critical)
    }

    /// `(synthesis, cleaning)` batch sizes at this level.
    pub fn batch_sizes(&self, settings: &MemorySettings) -> (usize, usize) {
        let multiplier = self.multiplier(settings);
        (
            scaled_batch(
                settings.base_synthesis_batch,
                settings.min_synthesis_batch,
                multiplier,
            ),
            scaled_batch(
                settings.base_cleaning_batch,
                settings.min_cleaning_batch,
                multiplier,
            ),
        )
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn scaled_batch(base: usize, min: usize, multiplier: f64) -> usize {
    let scaled = (base as f64 * multiplier).floor();
    let scaled = if scaled.is_nan() || scaled < 0.0 {
        0
    } else {
        scaled as usize
    };
    scaled.clamp(min.min(base), base)
}

/// Monitor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub samples: u64,
    pub peak_active_bytes: u64,
    pub level_changes: u64,
    pub reclaim_count: u64,
    pub probe_errors: u64,
}

type PressureCallback = Arc<dyn Fn(PressureLevel, PressureLevel) + Send + Sync>;
type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

struct MonitorInner {
    settings: MemorySettings,
    budget_bytes: u64,
    probe: Arc<dyn MemoryProbe>,
    history: Mutex<VecDeque<MemorySnapshot>>,
    level: Mutex<PressureLevel>,
    synthesis_batch: AtomicUsize,
    cleaning_batch: AtomicUsize,
    callbacks: Mutex<Vec<PressureCallback>>,
    reclaim_hooks: Mutex<Vec<ReclaimHook>>,
    event_bus: Mutex<Option<EventBus>>,
    stats: Mutex<MonitorStats>,
}

impl MonitorInner {
    fn sample(&self) -> Result<PressureLevel> {
        let snapshot = match self.probe.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.stats.lock().probe_errors += 1;
                return Err(err.into());
            }
        };

        {
            let mut history = self.history.lock();
            history.push_back(snapshot);
            while history.len() > self.settings.history_size.max(1) {
                history.pop_front();
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.samples += 1;
            stats.peak_active_bytes = stats.peak_active_bytes.max(snapshot.active_bytes);
        }

        let ratio = if self.budget_bytes > 0 {
            snapshot.active_bytes as f64 / self.budget_bytes as f64
        } else {
            0.0
        };
        let new_level = PressureLevel::classify(ratio, &self.settings);

        let old_level = {
            let mut level = self.level.lock();
            let old = *level;
            if old == new_level {
                return Ok(new_level);
            }
            *level = new_level;

            let (synthesis, cleaning) = new_level.batch_sizes(&self.settings);
            self.synthesis_batch.store(synthesis, Ordering::SeqCst);
            self.cleaning_batch.store(cleaning, Ordering::SeqCst);
            old
        };

        self.stats.lock().level_changes += 1;
        self.on_level_change(old_level, new_level, ratio);

        Ok(new_level)
    }

    fn on_level_change(&self, old_level: PressureLevel, new_level: PressureLevel, ratio: f64) {
        let synthesis = self.synthesis_batch.load(Ordering::SeqCst);
        let cleaning = self.cleaning_batch.load(Ordering::SeqCst);

        if new_level > old_level && new_level.requires_reclaim() {
            warn!(
                from = %old_level,
                to = %new_level,
                usage_ratio = ratio,
                synthesis_batch = synthesis,
                cleaning_batch = cleaning,
                "Memory pressure rising"
            );
        } else {
            info!(
                from = %old_level,
                to = %new_level,
                usage_ratio = ratio,
                synthesis_batch = synthesis,
                cleaning_batch = cleaning,
                "Memory pressure changed"
            );
        }

        let callbacks: Vec<PressureCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(old_level, new_level))).is_err() {
                warn!("Pressure change callback panicked");
            }
        }

        self.emit(MemoryEvent::PressureChanged {
            from: old_level.as_str().to_string(),
            to: new_level.as_str().to_string(),
            usage_ratio: ratio,
            synthesis_batch: synthesis,
            cleaning_batch: cleaning,
        });

        if self.settings.enable_auto_reclaim && new_level.requires_reclaim() {
            self.reclaim(new_level);
        }
    }

    fn reclaim(&self, level: PressureLevel) {
        if let Err(err) = self.probe.reclaim() {
            warn!(error = %err, "Probe reclaim failed");
        }

        let hooks: Vec<ReclaimHook> = self.reclaim_hooks.lock().clone();
        for hook in &hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                warn!("Reclaim hook panicked");
            }
        }

        self.stats.lock().reclaim_count += 1;
        debug!(level = %level, hooks = hooks.len(), "Forced reclaim complete");

        self.emit(MemoryEvent::ReclaimForced {
            level: level.as_str().to_string(),
        });
    }

    fn emit(&self, event: MemoryEvent) {
        if let Some(bus) = self.event_bus.lock().as_ref() {
            bus.emit(CoreEvent::Memory(event)).ok();
        }
    }
}

struct SamplingLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic memory sampler with adaptive batch sizing.
pub struct MemoryPressureMonitor {
    inner: Arc<MonitorInner>,
    running: Mutex<Option<SamplingLoop>>,
}

impl MemoryPressureMonitor {
    /// Creates a stopped monitor. `budget_bytes` is the denominator of the
    /// usage ratio.
    pub fn new(settings: MemorySettings, budget_bytes: u64, probe: Arc<dyn MemoryProbe>) -> Self {
        let (synthesis, cleaning) = PressureLevel::Normal.batch_sizes(&settings);
        let history_capacity = settings.history_size.max(1);

        Self {
            inner: Arc::new(MonitorInner {
                settings,
                budget_bytes,
                probe,
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                level: Mutex::new(PressureLevel::Normal),
                synthesis_batch: AtomicUsize::new(synthesis),
                cleaning_batch: AtomicUsize::new(cleaning),
                callbacks: Mutex::new(Vec::new()),
                reclaim_hooks: Mutex::new(Vec::new()),
                event_bus: Mutex::new(None),
                stats: Mutex::new(MonitorStats::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Publish pressure changes and reclaims on `bus`.
    pub fn with_event_bus(self, bus: EventBus) -> Self {
        *self.inner.event_bus.lock() = Some(bus);
        self
    }

    /// Registers a callback invoked with `(old, new)` on every level change.
    pub fn on_pressure_change<F>(&self, callback: F)
    where
        F: Fn(PressureLevel, PressureLevel) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().push(Arc::new(callback));
    }

    /// Registers work to run during a forced reclaim.
    pub fn add_reclaim_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.reclaim_hooks.lock().push(Arc::new(hook));
    }

    /// Starts the sampling loop. Must be called within a tokio runtime.
    /// No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .map_or(false, |active| !active.handle.is_finished())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let period = self
            .inner
            .settings
            .check_interval
            .max(std::time::Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = inner.sample() {
                            warn!(error = %err, "Memory sampling failed");
                        }
                    }
                }
            }
            debug!("Memory pressure loop stopped");
        });

        info!(
            interval_ms = period.as_millis() as u64,
            budget_bytes = self.inner.budget_bytes,
            "Memory pressure monitor started"
        );
        *running = Some(SamplingLoop { cancel, handle });
    }

    /// Stops the sampling loop and waits for it to exit. No-op if not running.
    pub async fn stop(&self) {
        let active = self.running.lock().take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(err) = active.handle.await {
                warn!(error = %err, "Memory pressure loop ended abnormally");
            }
            debug!("Memory pressure monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |active| !active.handle.is_finished())
    }

    /// Takes one sample immediately, outside the loop's schedule.
    pub fn sample_now(&self) -> Result<PressureLevel> {
        self.inner.sample()
    }

    pub fn level(&self) -> PressureLevel {
        *self.inner.level.lock()
    }

    pub fn synthesis_batch_size(&self) -> usize {
        self.inner.synthesis_batch.load(Ordering::SeqCst)
    }

    pub fn cleaning_batch_size(&self) -> usize {
        self.inner.cleaning_batch.load(Ordering::SeqCst)
    }

    /// Snapshots oldest first.
    pub fn history(&self) -> Vec<MemorySnapshot> {
        self.inner.history.lock().iter().copied().collect()
    }

    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.inner.history.lock().back().copied()
    }

    /// Change in active bytes per second over the most recent snapshots.
    /// Positive means usage is growing.
    pub fn usage_trend(&self) -> f64 {
        let history = self.inner.history.lock();
        if history.len() < 2 {
            return 0.0;
        }

        let start = history.len().saturating_sub(TREND_WINDOW);
        let (Some(first), Some(last)) = (history.get(start), history.back()) else {
            return 0.0;
        };

        let elapsed = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }

        (last.active_bytes as f64 - first.active_bytes as f64) / elapsed
    }

    pub fn stats(&self) -> MonitorStats {
        *self.inner.stats.lock()
    }

    pub fn budget_bytes(&self) -> u64 {
        self.inner.budget_bytes
    }
}

impl Drop for MemoryPressureMonitor {
    fn drop(&mut self) {
        if let Some(active) = self.running.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("level", &self.level())
            .field("budget_bytes", &self.inner.budget_bytes)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicU64;

    const BUDGET: u64 = 1_000_000;

    /// Reports whatever `active` is set to.
    #[derive(Default)]
    struct DialProbe {
        active: AtomicU64,
        reclaims: AtomicU64,
        fail: std::sync::atomic::AtomicBool,
    }

    impl DialProbe {
        fn set_ratio(&self, ratio: f64) {
            self.active
                .store((BUDGET as f64 * ratio) as u64, Ordering::SeqCst);
        }
    }

    impl MemoryProbe for DialProbe {
        fn snapshot(&self) -> BridgeResult<MemorySnapshot> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("probe offline".to_string()));
            }
            let active = self.active.load(Ordering::SeqCst);
            Ok(MemorySnapshot::now(active, active, 0))
        }

        fn reclaim(&self) -> BridgeResult<()> {
            self.reclaims.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn monitor_with(probe: Arc<DialProbe>) -> MemoryPressureMonitor {
        MemoryPressureMonitor::new(MemorySettings::default(), BUDGET, probe)
    }

    #[test]
    fn test_classification_is_monotonic() {
        let settings = MemorySettings::default();

        assert_eq!(PressureLevel::classify(0.50, &settings), PressureLevel::Normal);
        assert_eq!(PressureLevel::classify(0.75, &settings), PressureLevel::Elevated);
        assert_eq!(PressureLevel::classify(0.90, &settings), PressureLevel::High);
        assert_eq!(PressureLevel::classify(0.98, &settings), PressureLevel::Critical);

        let mut previous = PressureLevel::Normal;
        for step in 0..=120 {
            let level = PressureLevel::classify(step as f64 / 100.0, &settings);
            assert!(level >= previous);
            previous = level;
        }
    }

    #[test]
    fn test_batch_sizes_shrink_with_pressure() {
        let settings = MemorySettings::default();

        assert_eq!(PressureLevel::Normal.batch_sizes(&settings), (4, 8));
        assert_eq!(PressureLevel::Elevated.batch_sizes(&settings), (3, 6));
        assert_eq!(PressureLevel::High.batch_sizes(&settings), (2, 4));
        assert_eq!(PressureLevel::Critical.batch_sizes(&settings), (1, 2));
    }

    #[test]
    fn test_sample_updates_level_and_batches() {
        let probe = Arc::new(DialProbe::default());
        let monitor = monitor_with(probe.clone());

        probe.set_ratio(0.75);
        assert_eq!(monitor.sample_now().unwrap(), PressureLevel::Elevated);
        assert_eq!(monitor.synthesis_batch_size(), 3);
        assert_eq!(monitor.cleaning_batch_size(), 6);

        probe.set_ratio(0.2);
        assert_eq!(monitor.sample_now().unwrap(), PressureLevel::Normal);
        assert_eq!(monitor.synthesis_batch_size(), 4);
        assert_eq!(monitor.stats().level_changes, 2);
    }

    #[test]
    fn test_high_pressure_forces_reclaim_once_per_change() {
        let probe = Arc::new(DialProbe::default());
        let monitor = monitor_with(probe.clone());
        let hook_runs = Arc::new(AtomicU64::new(0));
        let counter = hook_runs.clone();
        monitor.add_reclaim_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        probe.set_ratio(0.90);
        monitor.sample_now().unwrap();
        monitor.sample_now().unwrap();

        assert_eq!(probe.reclaims.load(Ordering::SeqCst), 1);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.stats().reclaim_count, 1);

        probe.set_ratio(0.99);
        monitor.sample_now().unwrap();
        assert_eq!(monitor.stats().reclaim_count, 2);
    }

    #[test]
    fn test_pressure_callbacks_receive_transition() {
        let probe = Arc::new(DialProbe::default());
        let monitor = monitor_with(probe.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_pressure_change(move |old, new| sink.lock().push((old, new)));
        monitor.on_pressure_change(|_, _| panic!("misbehaving callback"));

        probe.set_ratio(0.86);
        monitor.sample_now().unwrap();

        assert_eq!(
            seen.lock().as_slice(),
            &[(PressureLevel::Normal, PressureLevel::High)]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let probe = Arc::new(DialProbe::default());
        let settings = MemorySettings {
            history_size: 3,
            ..MemorySettings::default()
        };
        let monitor = MemoryPressureMonitor::new(settings, BUDGET, probe.clone());

        for i in 1..=5u64 {
            probe.active.store(i, Ordering::SeqCst);
            monitor.sample_now().unwrap();
        }

        let actives: Vec<u64> = monitor.history().iter().map(|s| s.active_bytes).collect();
        assert_eq!(actives, vec![3, 4, 5]);
        assert_eq!(monitor.stats().peak_active_bytes, 5);
    }

    #[test]
    fn test_probe_errors_are_counted() {
        let probe = Arc::new(DialProbe::default());
        let monitor = monitor_with(probe.clone());
        probe.fail.store(true, Ordering::SeqCst);

        assert!(monitor.sample_now().is_err());
        assert_eq!(monitor.stats().probe_errors, 1);
        assert_eq!(monitor.level(), PressureLevel::Normal);
    }

    #[test]
    fn test_usage_trend_uses_recent_window() {
        let probe = Arc::new(DialProbe::default());
        let monitor = monitor_with(probe);
        let start = Utc::now();

        {
            let mut history = monitor.inner.history.lock();
            for i in 0..7i64 {
                history.push_back(MemorySnapshot {
                    timestamp: start + ChronoDuration::seconds(i),
                    active_bytes: if i < 2 { 0 } else { 1000 * i as u64 },
                    peak_bytes: 0,
                    cached_bytes: 0,
                });
            }
        }

        // Window covers t=2..6: (6000 - 2000) / 4s
        assert_eq!(monitor.usage_trend(), 1000.0);
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let probe = Arc::new(DialProbe::default());
        let settings = MemorySettings {
            check_interval: std::time::Duration::from_millis(10),
            ..MemorySettings::default()
        };
        let monitor = MemoryPressureMonitor::new(settings, BUDGET, probe);

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(monitor.stats().samples >= 2);

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start();
        assert!(monitor.is_running());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_loop_exit() {
        let probe = Arc::new(DialProbe::default());
        let settings = MemorySettings {
            check_interval: std::time::Duration::from_millis(5),
            ..MemorySettings::default()
        };
        let monitor = MemoryPressureMonitor::new(settings, BUDGET, probe);

        monitor.start();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        monitor.stop().await;

        let samples = monitor.stats().samples;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(monitor.stats().samples, samples);
    }
}
