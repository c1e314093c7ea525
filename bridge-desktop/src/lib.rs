//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `MemoryProbe` using `sysinfo` (process resident set or system usage)
//! - `LogSink` writing to stderr
//!
//! The speech, ingestion and encoding bridges are model- and format-specific
//! and are always supplied by the host application.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ConsoleLogSink, MemorySource, SystemMemoryProbe};
//! use std::sync::Arc;
//!
//! let probe = Arc::new(SystemMemoryProbe::new(MemorySource::Process)?);
//! let sink = Arc::new(ConsoleLogSink::default());
//! ```

mod log;
mod memory;

pub use log::ConsoleLogSink;
pub use memory::{MemorySource, SystemMemoryProbe};
