//! # Host Bridge Traits
//!
//! Narrow interfaces between the scheduler core and the subsystems it drives
//! but does not implement.
//!
//! ## Overview
//!
//! The core owns scheduling, memory budgeting and orchestration. Everything
//! else is reached through the traits below and injected by the host:
//!
//! ### Content
//! - [`DocumentIngestor`](ingest::DocumentIngestor) - Parse a source file into chapters
//!
//! ### Models
//! - [`ModelLifecycle`](speech::ModelLifecycle) - Load/unload of heavy model state
//! - [`SpeechSynthesizer`](speech::SpeechSynthesizer) - Text to samples
//! - [`TextCleaner`](speech::TextCleaner) - Text normalization ahead of synthesis
//!
//! ### Audio
//! - [`AudioEncoder`](audio::AudioEncoder) - Samples to a chapter file
//! - [`AudiobookPackager`](audio::AudiobookPackager) - Chapter files to the final container
//!
//! ### Platform
//! - [`MemoryProbe`](memory::MemoryProbe) - Memory statistics for pressure monitoring
//! - [`LogSink`](log::LogSink) - Forward structured logs to the host
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should map out-of-memory conditions to
//! [`BridgeError::ResourceExhausted`] so the core can treat them as a
//! per-chapter failure rather than a fatal one.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; the core shares implementations across
//! worker tasks behind `Arc`.

pub mod audio;
pub mod error;
pub mod ingest;
pub mod log;
pub mod memory;
pub mod speech;

pub use error::BridgeError;

pub use audio::{AudioEncoder, AudiobookPackager, BookMetadata, PackagedChapter};
pub use ingest::{ChapterText, Document, DocumentIngestor};
pub use log::{LogEntry, LogLevel, LogSink};
pub use memory::{MemoryProbe, MemorySnapshot};
pub use speech::{ModelLifecycle, SpeechSynthesizer, SynthesizedAudio, TextCleaner};
