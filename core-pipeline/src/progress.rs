//! Character-based progress and ETA for one conversion run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use core_runtime::events::{CoreEvent, EventBus, ProgressEvent};
use parking_lot::Mutex;

use crate::stage::{PipelineStage, PipelineState};

/// Tracks characters processed per chapter and publishes progress events.
///
/// Chapter counts only ever grow, so reporting the same chapter twice (once
/// per batch and again on completion) never double counts. Reports also push
/// the run-level stage forward when a [`PipelineState`] is attached.
pub struct ProgressTracker {
    run_id: String,
    bus: Option<EventBus>,
    state: Option<Arc<PipelineState>>,
    started: Instant,
    total_chars: usize,
    chapter_chars: Mutex<Vec<usize>>,
}

impl ProgressTracker {
    pub fn new(run_id: impl Into<String>, total_chars: usize, chapters: usize) -> Self {
        Self {
            run_id: run_id.into(),
            bus: None,
            state: None,
            started: Instant::now(),
            total_chars,
            chapter_chars: Mutex::new(vec![0; chapters]),
        }
    }

    pub fn with_event_bus(mut self, bus: Option<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_state(mut self, state: Arc<PipelineState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn total_chapters(&self) -> usize {
        self.chapter_chars.lock().len()
    }

    /// Records `chars` processed so far for chapter `index`.
    pub fn record_chapter_chars(&self, index: usize, chars: usize) {
        let mut counts = self.chapter_chars.lock();
        if let Some(slot) = counts.get_mut(index) {
            *slot = (*slot).max(chars);
        }
    }

    pub fn chars_processed(&self) -> usize {
        self.chapter_chars.lock().iter().sum()
    }

    pub fn ratio(&self) -> f64 {
        if self.total_chars == 0 {
            return 0.0;
        }
        (self.chars_processed() as f64 / self.total_chars as f64).min(1.0)
    }

    pub fn eta_seconds(&self) -> Option<f64> {
        estimate_eta(self.chars_processed(), self.total_chars, self.started.elapsed())
    }

    /// Publishes a progress event.
    pub fn report(
        &self,
        stage: PipelineStage,
        chapter: Option<usize>,
        chunk: Option<(usize, usize)>,
        message: impl Into<String>,
    ) {
        if let Some(state) = &self.state {
            state.advance(stage).ok();
        }
        let Some(bus) = &self.bus else {
            return;
        };

        let mut event = ProgressEvent::new(self.run_id.clone(), stage.as_str(), message)
            .with_ratio(self.ratio())
            .with_eta(self.eta_seconds());
        if let Some(index) = chapter {
            event = event.with_chapter(index, self.total_chapters());
        }
        if let Some((index, total)) = chunk {
            event = event.with_chunk(index, total);
        }

        bus.emit(CoreEvent::Progress(event)).ok();
    }
}

/// Extrapolates the observed rate over the remaining characters.
///
/// Returns `None` until at least one character has been processed.
pub fn estimate_eta(processed: usize, total: usize, elapsed: Duration) -> Option<f64> {
    if processed == 0 {
        return None;
    }
    let elapsed = elapsed.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    let rate = processed as f64 / elapsed;
    let remaining = total.saturating_sub(processed) as f64;
    Some(remaining / rate)
}
