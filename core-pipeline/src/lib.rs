//! # Conversion Pipeline
//!
//! Schedules audiobook conversion runs within a memory budget:
//!
//! - [`orchestrator`] - the [`ConversionPipeline`] entry point and run modes
//! - [`chapter`] - chunk, clean, synthesize and encode one chapter
//! - [`worker_pool`] - bounded concurrent chapter execution
//! - [`worker`] - in-process and child-process chapter workers
//! - [`pipeliner`] - overlapped synthesis and encoding stages
//! - [`stage`] - run-level state machine
//! - [`task`] - per-chapter task lifecycle
//! - [`chunker`] - sentence-aware text chunking
//! - [`output`] - staged writes and output file naming
//! - [`progress`] - character-based progress and ETA
//!
//! Speech synthesis, text cleaning, encoding and packaging are reached
//! through the traits in `bridge_traits`; this crate owns only scheduling.

pub mod chapter;
pub mod chunker;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeliner;
pub mod progress;
pub mod stage;
pub mod task;
pub mod worker;
pub mod worker_pool;

pub use chapter::{ChapterJob, ChapterOutput, ChapterProcessor, ChapterSettings};
pub use chunker::TextChunker;
pub use error::{PipelineError, Result};
pub use orchestrator::{
    ChapterReport, ConversionPipeline, ConversionPipelineBuilder, ConversionResult, RunMode,
};
pub use output::OutputWriter;
pub use pipeliner::{StagePipeliner, StageReport};
pub use progress::ProgressTracker;
pub use stage::{PipelineStage, PipelineState};
pub use task::{ChapterTask, TaskFailure, TaskStatus};
pub use worker::{
    serve_stdio, InProcessWorker, ProcessWorker, Worker, DEFAULT_EXIT_GRACE, WORKER_MEMORY_ENV,
};
pub use worker_pool::ChapterWorkerPool;
