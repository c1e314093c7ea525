//! # Event Bus System
//!
//! Provides an event-driven architecture for the conversion pipeline using
//! `tokio::sync::broadcast`. Progress, log, state and memory notifications are
//! published as a closed set of tagged events rather than ad hoc callbacks.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for each concern
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ Orchestrator ├────────────>│           │
//! └──────────────┘             │           │    subscribe    ┌────────────┐
//! ┌──────────────┐    emit     │ EventBus  ├────────────────>│  UI / CLI  │
//! │ Pressure Mon ├────────────>│ (broadcast│                 └────────────┘
//! └──────────────┘             │  channel) │    subscribe    ┌────────────┐
//! ┌──────────────┐    emit     │           ├────────────────>│   Logger   │
//! │ Idle Manager ├────────────>│           │                 └────────────┘
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, ProgressEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Progress(ProgressEvent::new("run-1", "synthesizing", "Chunk 1/4")))
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Progress(_)));
//! # }
//! ```
//!
//! ## Delivery
//!
//! Events are delivered in emission order per emitter. Progress from
//! different chapters may interleave; subscribers must not assume a global
//! order across chapters. Subscribers that fall behind receive
//! `RecvError::Lagged` and skip ahead.

use bridge_traits::log::LogLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError};

pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Progress is emitted per chunk, so the buffer is sized for bursts of
/// several chapters completing batches at once.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Stage/chunk/chapter progress
    Progress(ProgressEvent),
    /// Log line mirrored from `tracing`
    Log(LogEvent),
    /// Pipeline stage transition
    State(StateEvent),
    /// Per-chapter lifecycle
    Chapter(ChapterEvent),
    /// Memory pressure and idle eviction
    Memory(MemoryEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Progress(_) => "Conversion progress",
            CoreEvent::Log(_) => "Log message",
            CoreEvent::State(_) => "Pipeline state changed",
            CoreEvent::Chapter(e) => e.description(),
            CoreEvent::Memory(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Log(LogEvent { level, .. }) => match level {
                LogLevel::Error => EventSeverity::Error,
                LogLevel::Warn => EventSeverity::Warning,
                LogLevel::Info => EventSeverity::Info,
                LogLevel::Debug | LogLevel::Trace => EventSeverity::Debug,
            },
            CoreEvent::Chapter(ChapterEvent::Failed { .. }) => EventSeverity::Warning,
            CoreEvent::Memory(MemoryEvent::ReclaimForced { .. }) => EventSeverity::Warning,
            CoreEvent::Memory(MemoryEvent::IdleWarning { .. }) => EventSeverity::Info,
            CoreEvent::State(StateEvent { to, .. }) if to == "error" => EventSeverity::Error,
            CoreEvent::State(_) | CoreEvent::Chapter(ChapterEvent::Completed { .. }) => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Progress Events
// ============================================================================

/// Progress report emitted at stage boundaries and on every chunk or chapter
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// Identifier of the conversion run.
    pub run_id: String,
    /// Stage the reporting chapter is in (e.g. "synthesizing").
    pub stage: String,
    /// Zero-based chapter index.
    pub chapter_index: usize,
    pub total_chapters: usize,
    /// Zero-based chunk index within the chapter.
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Overall completion in `[0, 1]`, by processed characters.
    pub ratio: f64,
    pub message: String,
    /// Estimated seconds remaining; `None` until enough work has completed.
    pub eta_seconds: Option<f64>,
}

impl ProgressEvent {
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            chapter_index: 0,
            total_chapters: 0,
            chunk_index: 0,
            total_chunks: 0,
            ratio: 0.0,
            message: message.into(),
            eta_seconds: None,
        }
    }

    pub fn with_chapter(mut self, index: usize, total: usize) -> Self {
        self.chapter_index = index;
        self.total_chapters = total;
        self
    }

    pub fn with_chunk(mut self, index: usize, total: usize) -> Self {
        self.chunk_index = index;
        self.total_chunks = total;
        self
    }

    /// Sets the completion ratio, clamped to `[0, 1]`. NaN becomes 0.
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        self
    }

    pub fn with_eta(mut self, eta_seconds: Option<f64>) -> Self {
        self.eta_seconds = eta_seconds;
        self
    }
}

// ============================================================================
// Log and State Events
// ============================================================================

/// A log line forwarded onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

/// Pipeline-level stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateEvent {
    pub run_id: String,
    pub from: String,
    pub to: String,
}

// ============================================================================
// Chapter Events
// ============================================================================

/// Per-chapter lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ChapterEvent {
    Started {
        run_id: String,
        index: usize,
        title: String,
    },
    Completed {
        run_id: String,
        index: usize,
        duration_ms: u64,
    },
    Failed {
        run_id: String,
        index: usize,
        /// Stable error code (e.g. "E100").
        code: String,
        message: String,
    },
}

impl ChapterEvent {
    fn description(&self) -> &str {
        match self {
            ChapterEvent::Started { .. } => "Chapter started",
            ChapterEvent::Completed { .. } => "Chapter completed",
            ChapterEvent::Failed { .. } => "Chapter failed",
        }
    }
}

// ============================================================================
// Memory Events
// ============================================================================

/// Memory pressure and idle eviction events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum MemoryEvent {
    /// Pressure level changed.
    PressureChanged {
        from: String,
        to: String,
        usage_ratio: f64,
        synthesis_batch: usize,
        cleaning_batch: usize,
    },
    /// A reclaim pass ran because pressure reached High or Critical.
    ReclaimForced { level: String },
    /// Models will be unloaded soon unless activity resumes.
    IdleWarning { seconds_until_unload: u64 },
    /// Registered models were unloaded after the idle timeout.
    ModelsUnloaded { models: Vec<String>, idle_seconds: u64 },
}

impl MemoryEvent {
    fn description(&self) -> &str {
        match self {
            MemoryEvent::PressureChanged { .. } => "Memory pressure changed",
            MemoryEvent::ReclaimForced { .. } => "Memory reclaim forced",
            MemoryEvent::IdleWarning { .. } => "Idle unload imminent",
            MemoryEvent::ModelsUnloaded { .. } => "Idle models unloaded",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers that fall behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers; emitters treat
    /// that as a no-op (`.ok()`).
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(16);
/// let progress_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Progress(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n`
    /// events and `RecvError::Closed` once every sender is gone.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter_failed(index: usize) -> CoreEvent {
        CoreEvent::Chapter(ChapterEvent::Failed {
            run_id: "run".to_string(),
            index,
            code: "E100".to_string(),
            message: "synthesis failed".to_string(),
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.emit(chapter_failed(0)).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::State(StateEvent {
            run_id: "run".to_string(),
            from: "idle".to_string(),
            to: "ingesting".to_string(),
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Progress(_)));

        bus.emit(chapter_failed(1)).ok();
        bus.emit(CoreEvent::Progress(ProgressEvent::new("run", "encoding", "Encoding"))).ok();

        let received = stream.recv().await.unwrap();
        assert!(matches!(received, CoreEvent::Progress(_)));
    }

    #[tokio::test]
    async fn test_try_recv_skips_filtered_events() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Memory(_)));

        bus.emit(chapter_failed(2)).ok();
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_progress_ratio_is_clamped() {
        let over = ProgressEvent::new("run", "synthesizing", "x").with_ratio(1.7);
        let under = ProgressEvent::new("run", "synthesizing", "x").with_ratio(-0.2);
        let nan = ProgressEvent::new("run", "synthesizing", "x").with_ratio(f64::NAN);

        assert_eq!(over.ratio, 1.0);
        assert_eq!(under.ratio, 0.0);
        assert_eq!(nan.ratio, 0.0);
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(chapter_failed(0).severity(), EventSeverity::Warning);

        let error_state = CoreEvent::State(StateEvent {
            run_id: "run".to_string(),
            from: "packaging".to_string(),
            to: "error".to_string(),
        });
        assert_eq!(error_state.severity(), EventSeverity::Error);

        let log = CoreEvent::Log(LogEvent {
            level: LogLevel::Debug,
            target: "core".to_string(),
            message: "tick".to_string(),
        });
        assert_eq!(log.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CoreEvent::Memory(MemoryEvent::ReclaimForced {
            level: "high".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "Memory");
        assert_eq!(json["payload"]["event"], "ReclaimForced");
        assert_eq!(json["payload"]["level"], "high");
    }
}
