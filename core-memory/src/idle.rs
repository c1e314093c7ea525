//! # Idle Timeout Manager
//!
//! Unloads registered models after a period without activity. Callers mark
//! activity with [`record_activity`](IdleTimeoutManager::record_activity);
//! a background loop checks the idle time every `check_interval`, fires a
//! one-shot warning when the unload is `warning_before` away and runs every
//! unload hook once the timeout elapses.
//!
//! After an unload the idle clock restarts, so hooks never run twice for the
//! same idle period.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::error::Result as BridgeResult;
use bridge_traits::speech::ModelLifecycle;
use chrono::{DateTime, Utc};
use core_runtime::config::IdleSettings;
use core_runtime::events::{CoreEvent, EventBus, MemoryEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type UnloadHook = Arc<dyn Fn() -> BoxFuture<'static, BridgeResult<()>> + Send + Sync>;
type WarningCallback = Arc<dyn Fn(Duration) + Send + Sync>;
type UnloadCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Result of one idle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleCheck {
    /// Activity is recent enough; nothing happened.
    Active,
    /// The warning fired; the unload is `remaining` away.
    Warned { remaining: Duration },
    /// Hooks ran; contains the names that unloaded successfully.
    Unloaded(Vec<String>),
}

/// Idle manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleStats {
    pub unload_count: u64,
    pub warnings_issued: u64,
    pub last_unloaded: Vec<String>,
    pub last_unload_at: Option<DateTime<Utc>>,
}

struct ActivityState {
    last_activity: Instant,
    warning_issued: bool,
}

struct IdleInner {
    settings: IdleSettings,
    activity: Mutex<ActivityState>,
    hooks: Mutex<BTreeMap<String, UnloadHook>>,
    warning_callbacks: Mutex<Vec<WarningCallback>>,
    unload_callbacks: Mutex<Vec<UnloadCallback>>,
    stats: Mutex<IdleStats>,
    event_bus: Mutex<Option<EventBus>>,
}

impl IdleInner {
    fn idle_time(&self) -> Duration {
        self.activity.lock().last_activity.elapsed()
    }

    async fn check(&self) -> IdleCheck {
        let timeout = self.settings.timeout;
        let warn_at = timeout.saturating_sub(self.settings.warning_before);

        let (idle, warn_now) = {
            let mut activity = self.activity.lock();
            let idle = activity.last_activity.elapsed();
            let warn_now = idle >= warn_at && idle < timeout && !activity.warning_issued;
            if warn_now {
                activity.warning_issued = true;
            }
            (idle, warn_now)
        };

        if idle >= timeout {
            let unloaded = self.unload_all(idle).await;
            let mut activity = self.activity.lock();
            activity.last_activity = Instant::now();
            activity.warning_issued = false;
            return IdleCheck::Unloaded(unloaded);
        }

        if warn_now {
            let remaining = timeout.saturating_sub(idle);
            self.stats.lock().warnings_issued += 1;
            info!(
                seconds_until_unload = remaining.as_secs(),
                "Models idle; unloading soon"
            );

            let callbacks: Vec<WarningCallback> = self.warning_callbacks.lock().clone();
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(remaining))).is_err() {
                    warn!("Idle warning callback panicked");
                }
            }

            self.emit(MemoryEvent::IdleWarning {
                seconds_until_unload: remaining.as_secs(),
            });
            return IdleCheck::Warned { remaining };
        }

        IdleCheck::Active
    }

    async fn unload_all(&self, idle: Duration) -> Vec<String> {
        let hooks: Vec<(String, UnloadHook)> = self
            .hooks
            .lock()
            .iter()
            .map(|(name, hook)| (name.clone(), Arc::clone(hook)))
            .collect();

        let mut unloaded = Vec::with_capacity(hooks.len());
        for (name, hook) in hooks {
            match hook().await {
                Ok(()) => unloaded.push(name),
                Err(err) => warn!(model = %name, error = %err, "Failed to unload idle model"),
            }
        }

        if unloaded.is_empty() {
            return unloaded;
        }

        {
            let mut stats = self.stats.lock();
            stats.unload_count += 1;
            stats.last_unloaded = unloaded.clone();
            stats.last_unload_at = Some(Utc::now());
            info!(
                models = %unloaded.join(", "),
                idle_seconds = idle.as_secs(),
                unload_count = stats.unload_count,
                warnings_issued = stats.warnings_issued,
                "Idle timeout: unloaded models"
            );
        }

        let callbacks: Vec<UnloadCallback> = self.unload_callbacks.lock().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&unloaded))).is_err() {
                warn!("Idle unload callback panicked");
            }
        }

        self.emit(MemoryEvent::ModelsUnloaded {
            models: unloaded.clone(),
            idle_seconds: idle.as_secs(),
        });

        unloaded
    }

    fn emit(&self, event: MemoryEvent) {
        if let Some(bus) = self.event_bus.lock().as_ref() {
            bus.emit(CoreEvent::Memory(event)).ok();
        }
    }
}

struct CheckLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Evicts registered models after a period of inactivity.
pub struct IdleTimeoutManager {
    inner: Arc<IdleInner>,
    running: Mutex<Option<CheckLoop>>,
}

impl IdleTimeoutManager {
    pub fn new(settings: IdleSettings) -> Self {
        Self {
            inner: Arc::new(IdleInner {
                settings,
                activity: Mutex::new(ActivityState {
                    last_activity: Instant::now(),
                    warning_issued: false,
                }),
                hooks: Mutex::new(BTreeMap::new()),
                warning_callbacks: Mutex::new(Vec::new()),
                unload_callbacks: Mutex::new(Vec::new()),
                stats: Mutex::new(IdleStats::default()),
                event_bus: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn with_event_bus(self, bus: EventBus) -> Self {
        *self.inner.event_bus.lock() = Some(bus);
        self
    }

    /// Registers an unload hook under `name`, replacing any previous one.
    pub fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(model = %name, "Registered for idle unload");
        self.inner
            .hooks
            .lock()
            .insert(name, Arc::new(move || hook().boxed()));
    }

    /// Registers a model whose [`ModelLifecycle::unload`] runs on idle timeout.
    pub fn register_model<M>(&self, model: Arc<M>)
    where
        M: ModelLifecycle + ?Sized + 'static,
    {
        let name = model.model_name();
        self.register(name, move || {
            let model = Arc::clone(&model);
            async move { model.unload().await }
        });
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.hooks.lock().remove(name).is_some()
    }

    pub fn registered(&self) -> Vec<String> {
        self.inner.hooks.lock().keys().cloned().collect()
    }

    /// Resets the idle clock and re-arms the warning.
    pub fn record_activity(&self) {
        let mut activity = self.inner.activity.lock();
        activity.last_activity = Instant::now();
        activity.warning_issued = false;
    }

    /// Callback receiving the time left before unload.
    pub fn on_warning<F>(&self, callback: F)
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.inner.warning_callbacks.lock().push(Arc::new(callback));
    }

    /// Callback receiving the names of the models just unloaded.
    pub fn on_unload<F>(&self, callback: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.inner.unload_callbacks.lock().push(Arc::new(callback));
    }

    pub fn idle_time(&self) -> Duration {
        self.inner.idle_time()
    }

    /// Runs one idle check now.
    pub async fn check_now(&self) -> IdleCheck {
        self.inner.check().await
    }

    /// Starts the check loop. No-op if already running or disabled.
    pub fn start(&self) {
        if !self.inner.settings.enabled {
            debug!("Idle timeout disabled");
            return;
        }

        let mut running = self.running.lock();
        if running
            .as_ref()
            .map_or(false, |active| !active.handle.is_finished())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let period = self.inner.settings.check_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.check().await;
                    }
                }
            }
            debug!("Idle check loop stopped");
        });

        info!(
            timeout_secs = self.inner.settings.timeout.as_secs(),
            "Idle timeout manager started"
        );
        *running = Some(CheckLoop { cancel, handle });
    }

    /// Stops the check loop and waits for it to exit.
    pub async fn stop(&self) {
        let active = self.running.lock().take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(err) = active.handle.await {
                warn!(error = %err, "Idle check loop ended abnormally");
            }
            debug!("Idle timeout manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |active| !active.handle.is_finished())
    }

    pub fn stats(&self) -> IdleStats {
        self.inner.stats.lock().clone()
    }
}

impl Drop for IdleTimeoutManager {
    fn drop(&mut self) {
        if let Some(active) = self.running.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl fmt::Debug for IdleTimeoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimeoutManager")
            .field("registered", &self.registered())
            .field("idle_time", &self.idle_time())
            .field("running", &self.is_running())
            .finish()
    }
}
