//! # Memory Management
//!
//! Keeps the conversion pipeline inside its memory budget:
//!
//! - [`budget`] - how many chapter workers fit in memory
//! - [`buffer_pool`] - reusable sample buffers bucketed by size
//! - [`monitor`] - pressure sampling and adaptive batch sizes
//! - [`idle`] - unloading models after a period of inactivity
//!
//! The monitor and idle manager run as tokio tasks and must be started from
//! within a runtime. Both publish [`MemoryEvent`](core_runtime::events::MemoryEvent)s
//! when given an [`EventBus`](core_runtime::events::EventBus).

pub mod budget;
pub mod buffer_pool;
pub mod error;
pub mod idle;
pub mod monitor;

pub use budget::{compute_max_concurrency, ResourceBudget};
pub use buffer_pool::{BufferPool, BufferPoolStats, ElementType, PooledBuffer, Sample};
pub use error::{MemoryError, Result};
pub use idle::{IdleCheck, IdleStats, IdleTimeoutManager};
pub use monitor::{MemoryPressureMonitor, MonitorStats, PressureLevel};
