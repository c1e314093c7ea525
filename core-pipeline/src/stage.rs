//! # Conversion Stages
//!
//! `PipelineStage` is the state machine of one conversion run:
//!
//! ```text
//! Idle → Ingesting → Chunking → Cleaning → Synthesizing → Encoding → Packaging → Complete
//!   \_______________________________________________________________________/
//!                                   ↓
//!                           Error | Cancelled
//! ```
//!
//! With several chapters in flight the chapter-level stages interleave, so
//! the run-level stage records the furthest stage reached. Earlier working
//! stages are ignored by [`PipelineState::advance`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, StateEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Idle,
    Ingesting,
    Chunking,
    Cleaning,
    Synthesizing,
    Encoding,
    Packaging,
    Complete,
    Error,
    Cancelled,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Ingesting => "ingesting",
            PipelineStage::Chunking => "chunking",
            PipelineStage::Cleaning => "cleaning",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Encoding => "encoding",
            PipelineStage::Packaging => "packaging",
            PipelineStage::Complete => "complete",
            PipelineStage::Error => "error",
            PipelineStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Complete | PipelineStage::Error | PipelineStage::Cancelled
        )
    }

    /// Position in the working sequence. Terminal failure stages share the
    /// highest ordinal.
    pub fn ordinal(&self) -> u8 {
        match self {
            PipelineStage::Idle => 0,
            PipelineStage::Ingesting => 1,
            PipelineStage::Chunking => 2,
            PipelineStage::Cleaning => 3,
            PipelineStage::Synthesizing => 4,
            PipelineStage::Encoding => 5,
            PipelineStage::Packaging => 6,
            PipelineStage::Complete | PipelineStage::Error | PipelineStage::Cancelled => 7,
        }
    }

    /// Forward moves only; `Error` and `Cancelled` are reachable from any
    /// non-terminal stage and nothing leaves a terminal stage.
    pub fn can_transition_to(&self, to: PipelineStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            PipelineStage::Error | PipelineStage::Cancelled => true,
            _ => to.ordinal() > self.ordinal(),
        }
    }
}

impl FromStr for PipelineStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(PipelineStage::Idle),
            "ingesting" => Ok(PipelineStage::Ingesting),
            "chunking" => Ok(PipelineStage::Chunking),
            "cleaning" => Ok(PipelineStage::Cleaning),
            "synthesizing" => Ok(PipelineStage::Synthesizing),
            "encoding" => Ok(PipelineStage::Encoding),
            "packaging" => Ok(PipelineStage::Packaging),
            "complete" => Ok(PipelineStage::Complete),
            "error" => Ok(PipelineStage::Error),
            "cancelled" => Ok(PipelineStage::Cancelled),
            _ => Err(PipelineError::Config(format!("unknown pipeline stage: {}", s))),
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run-level state owned by the conversion pipeline. Every stage change is
/// published as a [`StateEvent`] when an event bus is attached.
pub struct PipelineState {
    run_id: String,
    stage: Mutex<PipelineStage>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    bus: Option<EventBus>,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            run_id: run_id.into(),
            stage: Mutex::new(PipelineStage::Idle),
            cancel,
            started_at: Utc::now(),
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Option<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> PipelineStage {
        *self.stage.lock()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Strict transition: any move `can_transition_to` rejects is an error.
    pub fn transition(&self, to: PipelineStage) -> Result<PipelineStage> {
        let mut stage = self.stage.lock();
        if !stage.can_transition_to(to) {
            return Err(PipelineError::InvalidStateTransition {
                from: stage.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let from = *stage;
        *stage = to;
        drop(stage);
        self.publish(from, to);
        Ok(from)
    }

    /// Moves to `to` if it is further along. Returns the previous stage when
    /// the stage changed, `None` when the request was behind the current one.
    pub fn advance(&self, to: PipelineStage) -> Result<Option<PipelineStage>> {
        let mut stage = self.stage.lock();
        if stage.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: stage.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        if !stage.can_transition_to(to) {
            return Ok(None);
        }
        let from = *stage;
        *stage = to;
        drop(stage);
        self.publish(from, to);
        Ok(Some(from))
    }

    fn publish(&self, from: PipelineStage, to: PipelineStage) {
        debug!(run_id = %self.run_id, from = %from, to = %to, "Pipeline stage changed");
        if let Some(bus) = &self.bus {
            bus.emit(CoreEvent::State(StateEvent {
                run_id: self.run_id.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }))
            .ok();
        }
    }
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("run_id", &self.run_id)
            .field("stage", &self.stage())
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip_strings() {
        for stage in [
            PipelineStage::Idle,
            PipelineStage::Chunking,
            PipelineStage::Packaging,
            PipelineStage::Cancelled,
        ] {
            assert_eq!(stage.as_str().parse::<PipelineStage>().unwrap(), stage);
        }
        assert!("warming".parse::<PipelineStage>().is_err());
    }

    #[test]
    fn test_forward_and_terminal_rules() {
        assert!(PipelineStage::Idle.can_transition_to(PipelineStage::Ingesting));
        assert!(PipelineStage::Chunking.can_transition_to(PipelineStage::Encoding));
        assert!(!PipelineStage::Encoding.can_transition_to(PipelineStage::Chunking));
        assert!(PipelineStage::Synthesizing.can_transition_to(PipelineStage::Cancelled));
        assert!(!PipelineStage::Complete.can_transition_to(PipelineStage::Error));
        assert!(!PipelineStage::Cancelled.can_transition_to(PipelineStage::Error));
    }

    #[test]
    fn test_transition_rejects_backward_moves() {
        let state = PipelineState::new("run", CancellationToken::new());
        state.transition(PipelineStage::Ingesting).unwrap();
        state.transition(PipelineStage::Synthesizing).unwrap();

        let err = state.transition(PipelineStage::Chunking).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
        assert_eq!(state.stage(), PipelineStage::Synthesizing);
    }

    #[test]
    fn test_advance_keeps_furthest_stage() {
        let state = PipelineState::new("run", CancellationToken::new());

        assert_eq!(
            state.advance(PipelineStage::Synthesizing).unwrap(),
            Some(PipelineStage::Idle)
        );
        assert_eq!(state.advance(PipelineStage::Chunking).unwrap(), None);
        assert_eq!(state.stage(), PipelineStage::Synthesizing);

        state.advance(PipelineStage::Cancelled).unwrap();
        assert!(state.advance(PipelineStage::Packaging).is_err());
        assert_eq!(state.stage(), PipelineStage::Cancelled);
    }

    #[tokio::test]
    async fn test_stage_changes_are_published() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let state = PipelineState::new("run-7", CancellationToken::new()).with_event_bus(Some(bus));

        state.advance(PipelineStage::Ingesting).unwrap();
        state.advance(PipelineStage::Idle).unwrap();
        state.transition(PipelineStage::Error).unwrap();

        let mut seen = Vec::new();
        while let Ok(CoreEvent::State(event)) = rx.try_recv() {
            assert_eq!(event.run_id, "run-7");
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                ("idle".to_string(), "ingesting".to_string()),
                ("ingesting".to_string(), "error".to_string()),
            ]
        );
    }
}
