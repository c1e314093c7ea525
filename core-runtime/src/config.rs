//! # Pipeline Configuration Module
//!
//! Provides configuration management for the conversion pipeline.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! [`PipelineConfig`]. Every tunable has a documented default; only the
//! output and temp directories are required. The builder validates the
//! result before returning it so a misconfigured run fails before any model
//! is loaded.
//!
//! Configurations are serde-serializable so they can be stored alongside a
//! library or handed to an out-of-process worker.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{PipelineConfig, WorkerMode};
//!
//! let config = PipelineConfig::builder()
//!     .output_dir("/tmp/audiobooks")
//!     .temp_dir("/tmp/audiobooks/.work")
//!     .voice("af_bella")
//!     .max_parallel_chapters(3)
//!     .worker_mode(WorkerMode::InProcess)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.chunk_queue_size, 4);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::PipelineConfig;
//!
//! // Missing temp dir
//! let config = PipelineConfig::builder()
//!     .output_dir("/tmp/audiobooks")
//!     .build()
//!     .expect("Should fail - temp dir is required");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// ============================================================================
// Worker Selection
// ============================================================================

/// How chapter workers are isolated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMode {
    /// Chapters run as tasks on the runtime's worker threads.
    #[default]
    InProcess,
    /// Each chapter runs in a child process started from `program`.
    ///
    /// The child receives one JSON job on stdin and answers with one JSON
    /// line on stdout.
    Process {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl WorkerMode {
    pub fn is_process(&self) -> bool {
        matches!(self, WorkerMode::Process { .. })
    }
}

// ============================================================================
// Resource Budget Settings
// ============================================================================

/// Memory budget inputs, in gigabytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Total memory available to models.
    ///
    /// Default: 32 GB.
    #[serde(default = "default_total_gb")]
    pub total_gb: f64,

    /// Floor kept free for the OS and the host application.
    ///
    /// Default: 2 GB.
    #[serde(default = "default_reserved_gb")]
    pub reserved_gb: f64,

    /// Extra headroom against estimation error.
    ///
    /// Default: 1 GB.
    #[serde(default = "default_safety_margin_gb")]
    pub safety_margin_gb: f64,

    /// Footprint of one loaded synthesis model.
    ///
    /// Default: 0.5 GB.
    #[serde(default = "default_synthesis_model_gb")]
    pub synthesis_model_gb: f64,

    /// Footprint of one loaded cleaning model.
    ///
    /// Default: 1.5 GB.
    #[serde(default = "default_cleaning_model_gb")]
    pub cleaning_model_gb: f64,

    /// Upper bound on concurrent chapters regardless of memory.
    ///
    /// Default: 4.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            total_gb: default_total_gb(),
            reserved_gb: default_reserved_gb(),
            safety_margin_gb: default_safety_margin_gb(),
            synthesis_model_gb: default_synthesis_model_gb(),
            cleaning_model_gb: default_cleaning_model_gb(),
            hard_cap: default_hard_cap(),
        }
    }
}

impl BudgetSettings {
    /// Memory left for models once the floor and margin are taken out.
    pub fn available_gb(&self) -> f64 {
        self.total_gb - self.reserved_gb - self.safety_margin_gb
    }

    pub fn available_bytes(&self) -> u64 {
        (self.available_gb().max(0.0) * GIB) as u64
    }

    /// Footprint of one chapter worker: a synthesis model plus a cleaning model.
    pub fn per_unit_gb(&self) -> f64 {
        self.synthesis_model_gb + self.cleaning_model_gb
    }
}

// ============================================================================
// Memory Pressure Settings
// ============================================================================

/// Pressure monitor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Sampling period.
    ///
    /// Default: 2 seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,

    /// Number of snapshots kept for trend analysis.
    ///
    /// Default: 10.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Usage ratio at which pressure becomes Elevated.
    #[serde(default = "default_elevated_threshold")]
    pub elevated_threshold: f64,

    /// Usage ratio at which pressure becomes High.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    /// Usage ratio at which pressure becomes Critical.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Batch-size multipliers for Normal, Elevated, High and Critical.
    ///
    /// Default: `[1.0, 0.75, 0.5, 0.25]`.
    #[serde(default = "default_multipliers")]
    pub multipliers: [f64; 4],

    /// Synthesis batch size under Normal pressure.
    #[serde(default = "default_base_synthesis_batch")]
    pub base_synthesis_batch: usize,

    /// Cleaning batch size under Normal pressure.
    #[serde(default = "default_base_cleaning_batch")]
    pub base_cleaning_batch: usize,

    #[serde(default = "default_min_synthesis_batch")]
    pub min_synthesis_batch: usize,

    #[serde(default = "default_min_cleaning_batch")]
    pub min_cleaning_batch: usize,

    /// Run a reclaim pass when pressure reaches High or Critical.
    ///
    /// Default: true.
    #[serde(default = "default_true")]
    pub enable_auto_reclaim: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            history_size: default_history_size(),
            elevated_threshold: default_elevated_threshold(),
            high_threshold: default_high_threshold(),
            critical_threshold: default_critical_threshold(),
            multipliers: default_multipliers(),
            base_synthesis_batch: default_base_synthesis_batch(),
            base_cleaning_batch: default_base_cleaning_batch(),
            min_synthesis_batch: default_min_synthesis_batch(),
            min_cleaning_batch: default_min_cleaning_batch(),
            enable_auto_reclaim: true,
        }
    }
}

// ============================================================================
// Idle Timeout Settings
// ============================================================================

/// Idle model eviction tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inactivity after which every registered model is unloaded.
    ///
    /// Default: 5 minutes.
    #[serde(default = "default_idle_timeout")]
    pub timeout: Duration,

    /// Period of the idle check loop.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_idle_check_interval")]
    pub check_interval: Duration,

    /// How long before the unload the warning fires.
    ///
    /// Default: 60 seconds.
    #[serde(default = "default_idle_warning")]
    pub warning_before: Duration,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_idle_timeout(),
            check_interval: default_idle_check_interval(),
            warning_before: default_idle_warning(),
        }
    }
}

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Configuration for one conversion pipeline.
///
/// Use [`PipelineConfigBuilder`] to construct instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for finished audiobooks (one subdirectory per book).
    pub output_dir: PathBuf,

    /// Scratch directory for per-run temporary files.
    pub temp_dir: PathBuf,

    /// Voice identifier passed to the synthesizer.
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Speaking rate multiplier.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Maximum tokens per synthesis chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters per token used to convert `chunk_size` to characters.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    /// Process chapters concurrently when the budget allows.
    #[serde(default = "default_true")]
    pub enable_parallel: bool,

    /// Requested concurrent chapters, further capped by the memory budget.
    #[serde(default = "default_max_parallel_chapters")]
    pub max_parallel_chapters: usize,

    #[serde(default)]
    pub worker_mode: WorkerMode,

    /// Overlap synthesis and encoding across chapters when not running in
    /// parallel.
    #[serde(default = "default_true")]
    pub enable_pipelining: bool,

    /// Capacity of each pipeliner queue.
    #[serde(default = "default_chunk_queue_size")]
    pub chunk_queue_size: usize,

    /// Pipeliner queue poll timeout; bounds cancellation latency.
    #[serde(default = "default_stage_poll_interval")]
    pub stage_poll_interval: Duration,

    /// Write `source.md` and per-chapter cleaned text next to the audio.
    #[serde(default = "default_true")]
    pub save_intermediates: bool,

    #[serde(default)]
    pub budget: BudgetSettings,

    #[serde(default)]
    pub memory: MemorySettings,

    #[serde(default)]
    pub idle: IdleSettings,

    /// Cap on bytes retained by the sample buffer pool.
    #[serde(default = "default_buffer_pool_max_bytes")]
    pub buffer_pool_max_bytes: u64,
}

impl PipelineConfig {
    /// Creates a new builder for constructing a `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Maximum characters per synthesis chunk.
    pub fn max_chunk_chars(&self) -> usize {
        ((self.chunk_size as f64) * self.chars_per_token).floor().max(1.0) as usize
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::Config("Output directory cannot be empty".to_string()));
        }

        if self.temp_dir.as_os_str().is_empty() {
            return Err(Error::Config("Temp directory cannot be empty".to_string()));
        }

        if !(self.speed > 0.0 && self.speed <= 4.0) {
            return Err(Error::Config(format!(
                "Speed must be in (0, 4], got {}",
                self.speed
            )));
        }

        if self.chunk_size == 0 {
            return Err(Error::Config(
                "Chunk size must be greater than 0 tokens".to_string(),
            ));
        }

        if !(self.chars_per_token > 0.0) {
            return Err(Error::Config(
                "Characters per token must be positive".to_string(),
            ));
        }

        if self.max_parallel_chapters == 0 {
            return Err(Error::Config(
                "Max parallel chapters must be at least 1".to_string(),
            ));
        }

        if self.chunk_queue_size == 0 {
            return Err(Error::Config(
                "Chunk queue size must be at least 1".to_string(),
            ));
        }

        if self.stage_poll_interval.is_zero() {
            return Err(Error::Config(
                "Stage poll interval must be greater than 0".to_string(),
            ));
        }

        if let WorkerMode::Process { program, .. } = &self.worker_mode {
            if program.as_os_str().is_empty() {
                return Err(Error::Config(
                    "Process worker mode requires a worker program path".to_string(),
                ));
            }
        }

        self.validate_budget()?;
        self.validate_memory()?;
        self.validate_idle()?;

        Ok(())
    }

    fn validate_budget(&self) -> Result<()> {
        let budget = &self.budget;

        if !(budget.total_gb > 0.0) {
            return Err(Error::Config("Total memory must be positive".to_string()));
        }

        if budget.reserved_gb < 0.0 || budget.safety_margin_gb < 0.0 {
            return Err(Error::Config(
                "Reserved memory and safety margin cannot be negative".to_string(),
            ));
        }

        if !(budget.synthesis_model_gb > 0.0) || !(budget.cleaning_model_gb > 0.0) {
            return Err(Error::Config(
                "Model footprints must be positive".to_string(),
            ));
        }

        if budget.hard_cap == 0 {
            return Err(Error::Config("Hard cap must be at least 1".to_string()));
        }

        Ok(())
    }

    fn validate_memory(&self) -> Result<()> {
        let memory = &self.memory;

        if memory.check_interval.is_zero() {
            return Err(Error::Config(
                "Memory check interval must be greater than 0".to_string(),
            ));
        }

        if memory.history_size == 0 {
            return Err(Error::Config(
                "Memory history size must be at least 1".to_string(),
            ));
        }

        let ascending = 0.0 < memory.elevated_threshold
            && memory.elevated_threshold < memory.high_threshold
            && memory.high_threshold < memory.critical_threshold;
        if !ascending {
            return Err(Error::Config(format!(
                "Pressure thresholds must be strictly ascending and positive, got {} / {} / {}",
                memory.elevated_threshold, memory.high_threshold, memory.critical_threshold
            )));
        }

        if memory.multipliers.iter().any(|m| !(*m > 0.0 && *m <= 1.0)) {
            return Err(Error::Config(
                "Batch multipliers must be in (0, 1]".to_string(),
            ));
        }

        if memory.min_synthesis_batch == 0 || memory.min_cleaning_batch == 0 {
            return Err(Error::Config(
                "Minimum batch sizes must be at least 1".to_string(),
            ));
        }

        if memory.min_synthesis_batch > memory.base_synthesis_batch
            || memory.min_cleaning_batch > memory.base_cleaning_batch
        {
            return Err(Error::Config(
                "Minimum batch size cannot exceed its base batch size".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_idle(&self) -> Result<()> {
        let idle = &self.idle;

        if idle.timeout.is_zero() || idle.check_interval.is_zero() {
            return Err(Error::Config(
                "Idle timeout and check interval must be greater than 0".to_string(),
            ));
        }

        if idle.warning_before >= idle.timeout {
            return Err(Error::Config(
                "Idle warning window must be shorter than the idle timeout".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing [`PipelineConfig`] instances.
///
/// Unset fields fall back to their documented defaults; the directories are
/// required.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    output_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    voice: Option<String>,
    speed: Option<f64>,
    chunk_size: Option<usize>,
    enable_parallel: Option<bool>,
    max_parallel_chapters: Option<usize>,
    worker_mode: Option<WorkerMode>,
    enable_pipelining: Option<bool>,
    chunk_queue_size: Option<usize>,
    stage_poll_interval: Option<Duration>,
    save_intermediates: Option<bool>,
    budget: Option<BudgetSettings>,
    memory: Option<MemorySettings>,
    idle: Option<IdleSettings>,
    buffer_pool_max_bytes: Option<u64>,
}

impl PipelineConfigBuilder {
    /// Sets the output directory.
    pub fn output_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the scratch directory.
    pub fn temp_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.temp_dir = Some(path.into());
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Sets the maximum tokens per chunk.
    ///
    /// Default: 500
    pub fn chunk_size(mut self, tokens: usize) -> Self {
        self.chunk_size = Some(tokens);
        self
    }

    pub fn enable_parallel(mut self, enabled: bool) -> Self {
        self.enable_parallel = Some(enabled);
        self
    }

    /// Sets the requested number of concurrent chapters.
    ///
    /// Default: 2. The effective value is also capped by the memory budget.
    pub fn max_parallel_chapters(mut self, count: usize) -> Self {
        self.max_parallel_chapters = Some(count);
        self
    }

    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = Some(mode);
        self
    }

    pub fn enable_pipelining(mut self, enabled: bool) -> Self {
        self.enable_pipelining = Some(enabled);
        self
    }

    /// Sets the pipeliner queue capacity.
    ///
    /// Default: 4
    pub fn chunk_queue_size(mut self, size: usize) -> Self {
        self.chunk_queue_size = Some(size);
        self
    }

    pub fn stage_poll_interval(mut self, interval: Duration) -> Self {
        self.stage_poll_interval = Some(interval);
        self
    }

    pub fn save_intermediates(mut self, enabled: bool) -> Self {
        self.save_intermediates = Some(enabled);
        self
    }

    pub fn budget(mut self, budget: BudgetSettings) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Overrides only the total memory of the budget.
    pub fn total_memory_gb(mut self, total_gb: f64) -> Self {
        let mut budget = self.budget.take().unwrap_or_default();
        budget.total_gb = total_gb;
        self.budget = Some(budget);
        self
    }

    pub fn memory(mut self, memory: MemorySettings) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn idle(mut self, idle: IdleSettings) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Sets the buffer pool cap in bytes.
    ///
    /// Default: 512 MiB
    pub fn buffer_pool_max_bytes(mut self, bytes: u64) -> Self {
        self.buffer_pool_max_bytes = Some(bytes);
        self
    }

    /// Builds the configuration, applying defaults and validating it.
    pub fn build(self) -> Result<PipelineConfig> {
        let output_dir = self.output_dir.ok_or_else(|| {
            Error::Config("Output directory is required. Use .output_dir() to set it.".to_string())
        })?;

        let temp_dir = self.temp_dir.ok_or_else(|| {
            Error::Config("Temp directory is required. Use .temp_dir() to set it.".to_string())
        })?;

        let config = PipelineConfig {
            output_dir,
            temp_dir,
            voice: self.voice.unwrap_or_else(default_voice),
            speed: self.speed.unwrap_or_else(default_speed),
            chunk_size: self.chunk_size.unwrap_or_else(default_chunk_size),
            chars_per_token: default_chars_per_token(),
            enable_parallel: self.enable_parallel.unwrap_or(true),
            max_parallel_chapters: self
                .max_parallel_chapters
                .unwrap_or_else(default_max_parallel_chapters),
            worker_mode: self.worker_mode.unwrap_or_default(),
            enable_pipelining: self.enable_pipelining.unwrap_or(true),
            chunk_queue_size: self
                .chunk_queue_size
                .unwrap_or_else(default_chunk_queue_size),
            stage_poll_interval: self
                .stage_poll_interval
                .unwrap_or_else(default_stage_poll_interval),
            save_intermediates: self.save_intermediates.unwrap_or(true),
            budget: self.budget.unwrap_or_default(),
            memory: self.memory.unwrap_or_default(),
            idle: self.idle.unwrap_or_default(),
            buffer_pool_max_bytes: self
                .buffer_pool_max_bytes
                .unwrap_or_else(default_buffer_pool_max_bytes),
        };

        config.validate()?;

        Ok(config)
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_voice() -> String {
    "am_adam".to_string()
}

fn default_speed() -> f64 {
    1.0
}

fn default_chunk_size() -> usize {
    500
}

fn default_chars_per_token() -> f64 {
    4.0
}

fn default_max_parallel_chapters() -> usize {
    2
}

fn default_chunk_queue_size() -> usize {
    4
}

fn default_stage_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_buffer_pool_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_total_gb() -> f64 {
    32.0
}

fn default_reserved_gb() -> f64 {
    2.0
}

fn default_safety_margin_gb() -> f64 {
    1.0
}

fn default_synthesis_model_gb() -> f64 {
    0.5
}

fn default_cleaning_model_gb() -> f64 {
    1.5
}

fn default_hard_cap() -> usize {
    4
}

fn default_check_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_history_size() -> usize {
    10
}

fn default_elevated_threshold() -> f64 {
    0.70
}

fn default_high_threshold() -> f64 {
    0.85
}

fn default_critical_threshold() -> f64 {
    0.95
}

fn default_multipliers() -> [f64; 4] {
    [1.0, 0.75, 0.5, 0.25]
}

fn default_base_synthesis_batch() -> usize {
    4
}

fn default_base_cleaning_batch() -> usize {
    8
}

fn default_min_synthesis_batch() -> usize {
    1
}

fn default_min_cleaning_batch() -> usize {
    2
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_idle_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_warning() -> Duration {
    Duration::from_secs(60)
}
