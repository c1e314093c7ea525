//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the narrator crates:
//! - Pipeline configuration and validation
//! - Event bus for progress, state and memory notifications
//! - Logging and tracing setup
//!
//! ## Overview
//!
//! Nothing here schedules work. The memory subsystem and the conversion
//! pipeline read their settings from [`config::PipelineConfig`] and publish
//! through [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
