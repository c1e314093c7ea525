//! Workspace facade crate.
//!
//! Host applications depend on `narrator-workspace` to pull in the scheduler
//! core without wiring each crate individually. The `desktop-shims` feature
//! adds the desktop bridge implementations (system memory probe, console log
//! sink).

pub use bridge_traits;
pub use core_memory;
pub use core_pipeline;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_pipeline::{ConversionPipeline, ConversionResult};
pub use core_runtime::config::PipelineConfig;
