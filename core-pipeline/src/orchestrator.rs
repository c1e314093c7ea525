//! # Conversion Pipeline
//!
//! Single entry point turning a source document into an audiobook.
//!
//! ## Workflow
//!
//! 1. Ingest the document once and create the book directories
//! 2. Compute the memory budget and start the pressure monitor and idle manager
//! 3. Pick a run mode:
//!    - **Parallel**: whole chapters on the worker pool (in-process or child processes)
//!    - **Pipelined**: synthesis of one chapter overlaps encoding of the previous
//!    - **Sequential**: one chapter after another
//! 4. Collect chapter outcomes in document order
//! 5. Package every successful chapter into the final container
//!
//! Chapter failures are recorded and the run continues. Ingestion failure,
//! cancellation and packaging failure end the run. Background loops, staged
//! files and loaded models are cleaned up on every exit path.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_pipeline::ConversionPipeline;
//! use core_runtime::config::PipelineConfig;
//!
//! let config = PipelineConfig::builder()
//!     .output_dir("/books/out")
//!     .temp_dir("/tmp/narrator")
//!     .build()?;
//!
//! let pipeline = ConversionPipeline::builder(config)
//!     .ingestor(ingestor)
//!     .synthesizer(synthesizer)
//!     .cleaner(cleaner)
//!     .encoder(encoder)
//!     .packager(packager)
//!     .build()?;
//!
//! let result = pipeline.convert(Path::new("book.epub"), None, None).await;
//! println!("{} of {} chapters", result.chapters_completed, result.chapters_total);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_traits::audio::{AudioEncoder, AudiobookPackager, BookMetadata, PackagedChapter};
use bridge_traits::ingest::{Document, DocumentIngestor};
use bridge_traits::memory::MemoryProbe;
use bridge_traits::speech::{SpeechSynthesizer, TextCleaner};
use core_memory::{BufferPool, IdleTimeoutManager, MemoryPressureMonitor, ResourceBudget};
use core_runtime::config::{PipelineConfig, WorkerMode};
use core_runtime::events::{ChapterEvent, CoreEvent, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chapter::{
    ChapterJob, ChapterOutput, ChapterProcessor, ChapterSettings, PreparedChapter,
    SynthesizedChapter,
};
use crate::error::{PipelineError, Result};
use crate::output::{sanitize_title, OutputWriter};
use crate::pipeliner::StagePipeliner;
use crate::progress::ProgressTracker;
use crate::stage::{PipelineStage, PipelineState};
use crate::task::{ChapterTask, TaskFailure, TaskStatus};
use crate::worker::{InProcessWorker, ProcessWorker, Worker};
use crate::worker_pool::ChapterWorkerPool;

const BOOK_COMMENT: &str = "Narrated by narrator-workspace";

// ============================================================================
// Run Mode
// ============================================================================

/// How the chapters of one run are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    Parallel { workers: usize },
    Pipelined,
    Sequential,
}

impl RunMode {
    /// Parallel chapters and overlapped stages are mutually exclusive; the
    /// pool wins whenever more than one worker fits.
    pub fn select(config: &PipelineConfig, chapters: usize, budget: &ResourceBudget) -> Self {
        let workers = config
            .max_parallel_chapters
            .min(budget.max_concurrency());
        if config.enable_parallel && chapters > 1 && workers > 1 {
            RunMode::Parallel { workers }
        } else if config.enable_pipelining && chapters > 1 {
            RunMode::Pipelined
        } else {
            RunMode::Sequential
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterReport {
    pub index: usize,
    pub number: u32,
    pub title: String,
    pub status: TaskStatus,
    pub audio_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub run_id: String,
    pub success: bool,
    pub state: PipelineStage,
    pub title: String,
    pub author: Option<String>,
    pub output_path: Option<PathBuf>,
    pub mode: Option<RunMode>,
    /// Every chapter in document order.
    pub chapters: Vec<ChapterReport>,
    pub chapters_completed: usize,
    pub chapters_total: usize,
    /// Chapter index to error message.
    pub failed_chapters: BTreeMap<usize, String>,
    pub total_duration_ms: u64,
    pub processing_time: Duration,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl ConversionResult {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            success: false,
            state: PipelineStage::Idle,
            title: String::new(),
            author: None,
            output_path: None,
            mode: None,
            chapters: Vec::new(),
            chapters_completed: 0,
            chapters_total: 0,
            failed_chapters: BTreeMap::new(),
            total_duration_ms: 0,
            processing_time: Duration::ZERO,
            error: None,
            error_code: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == PipelineStage::Cancelled
    }
}

type ChapterOutcome = std::result::Result<ChapterOutput, TaskFailure>;

/// Outcomes keyed by chapter index, plus whether the run was cut short.
struct ChapterOutcomes {
    outcomes: BTreeMap<usize, ChapterOutcome>,
    cancelled: bool,
}

// ============================================================================
// Chapter Events
// ============================================================================

#[derive(Clone)]
struct ChapterEvents {
    run_id: String,
    bus: Option<EventBus>,
}

impl ChapterEvents {
    fn started(&self, job: &ChapterJob) {
        info!(chapter = job.index, title = %job.title, chars = job.char_count(), "Chapter started");
        self.emit(ChapterEvent::Started {
            run_id: self.run_id.clone(),
            index: job.index,
            title: job.title.clone(),
        });
    }

    fn finished(&self, index: usize, result: &Result<ChapterOutput>) {
        match result {
            Ok(output) => self.completed(output),
            Err(err) => self.failed(index, err),
        }
    }

    fn completed(&self, output: &ChapterOutput) {
        info!(chapter = output.index, duration_ms = output.duration_ms, "Chapter complete");
        self.emit(ChapterEvent::Completed {
            run_id: self.run_id.clone(),
            index: output.index,
            duration_ms: output.duration_ms,
        });
    }

    /// Cancellation is not a chapter failure and is not reported.
    fn failed(&self, index: usize, err: &PipelineError) {
        if err.is_cancelled() {
            return;
        }
        warn!(chapter = index, code = err.code(), error = %err, "Chapter failed");
        self.emit(ChapterEvent::Failed {
            run_id: self.run_id.clone(),
            index,
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: ChapterEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(CoreEvent::Chapter(event)).ok();
        }
    }
}

// ============================================================================
// Run Context
// ============================================================================

/// Everything one run owns; dropped when the run ends.
struct RunContext {
    run_id: String,
    token: CancellationToken,
    state: Arc<PipelineState>,
    writer: Arc<OutputWriter>,
    run_temp_dir: PathBuf,
    monitor: Option<Arc<MemoryPressureMonitor>>,
    events: ChapterEvents,
}

impl RunContext {
    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_stage(&self, stage: PipelineStage) {
        if let Err(err) = self.state.advance(stage) {
            debug!(error = %err, "Stage change ignored");
        }
    }
}

// ============================================================================
// Conversion Pipeline
// ============================================================================

pub struct ConversionPipeline {
    config: PipelineConfig,
    ingestor: Arc<dyn DocumentIngestor>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cleaner: Arc<dyn TextCleaner>,
    encoder: Arc<dyn AudioEncoder>,
    packager: Arc<dyn AudiobookPackager>,
    probe: Option<Arc<dyn MemoryProbe>>,
    event_bus: Option<EventBus>,
    buffer_pool: BufferPool,
    idle: Arc<IdleTimeoutManager>,
    active_run: Mutex<Option<CancellationToken>>,
    current_state: Mutex<Option<Arc<PipelineState>>>,
}

impl ConversionPipeline {
    pub fn builder(config: PipelineConfig) -> ConversionPipelineBuilder {
        ConversionPipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn idle_manager(&self) -> &Arc<IdleTimeoutManager> {
        &self.idle
    }

    /// Stage of the current or most recent run.
    pub fn stage(&self) -> PipelineStage {
        self.current_state
            .lock()
            .as_ref()
            .map(|state| state.stage())
            .unwrap_or(PipelineStage::Idle)
    }

    /// Cancels the active run. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        match self.active_run.lock().as_ref() {
            Some(token) => {
                info!("Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Converts `source` into an audiobook. Never panics and never returns
    /// early without cleaning up; the outcome is described by the result.
    ///
    /// One run at a time: a call made while another run is active fails
    /// with `E500` and leaves the active run untouched.
    #[instrument(skip_all, fields(source = %source.display()))]
    pub async fn convert(
        &self,
        source: &Path,
        title_override: Option<String>,
        author_override: Option<String>,
    ) -> ConversionResult {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        if !self.claim_run(&token) {
            let err = PipelineError::RunInProgress;
            warn!(run_id = %run_id, "Conversion rejected: another run is active");
            let mut result = ConversionResult::new(&run_id);
            result.state = PipelineStage::Error;
            result.error = Some(err.to_string());
            result.error_code = Some(err.code().to_string());
            return result;
        }

        let state = Arc::new(
            PipelineState::new(run_id.clone(), token.clone()).with_event_bus(self.event_bus.clone()),
        );
        *self.current_state.lock() = Some(Arc::clone(&state));

        let run_temp_dir = self.config.temp_dir.join(&run_id);
        let mut run = RunContext {
            run_id: run_id.clone(),
            token,
            state,
            writer: Arc::new(OutputWriter::new(&run_temp_dir)),
            run_temp_dir,
            monitor: None,
            events: ChapterEvents {
                run_id: run_id.clone(),
                bus: self.event_bus.clone(),
            },
        };

        info!(run_id = %run_id, "Conversion started");
        let mut result = ConversionResult::new(&run_id);
        let outcome = self
            .execute(&mut run, source, title_override, author_override, &mut result)
            .await;

        match outcome {
            Ok(()) => {
                run.state.transition(PipelineStage::Complete).ok();
                result.success = true;
                info!(
                    run_id = %run_id,
                    completed = result.chapters_completed,
                    total = result.chapters_total,
                    "Conversion complete"
                );
            }
            Err(err) if err.is_cancelled() => {
                run.state.transition(PipelineStage::Cancelled).ok();
                result.error = Some(err.to_string());
                result.error_code = Some(err.code().to_string());
                info!(run_id = %run_id, "Conversion cancelled");
            }
            Err(err) => {
                run.state.transition(PipelineStage::Error).ok();
                result.error = Some(err.to_string());
                result.error_code = Some(err.code().to_string());
                error!(run_id = %run_id, code = err.code(), error = %err, "Conversion failed");
            }
        }

        self.finish_run(&run).await;
        *self.active_run.lock() = None;

        result.state = run.state.stage();
        result.processing_time = started.elapsed();
        result
    }

    fn claim_run(&self, token: &CancellationToken) -> bool {
        let mut active = self.active_run.lock();
        if active.is_some() {
            return false;
        }
        *active = Some(token.clone());
        true
    }

    async fn execute(
        &self,
        run: &mut RunContext,
        source: &Path,
        title_override: Option<String>,
        author_override: Option<String>,
        result: &mut ConversionResult,
    ) -> Result<()> {
        run.set_stage(PipelineStage::Ingesting);
        run.check_cancelled()?;
        let document = tokio::select! {
            _ = run.token.cancelled() => return Err(PipelineError::Cancelled),
            document = self.ingestor.ingest(source) => {
                document.map_err(|err| PipelineError::Ingestion(err.to_string()))?
            }
        };
        if document.chapters.is_empty() {
            return Err(PipelineError::Ingestion(
                "document contains no chapters".to_string(),
            ));
        }

        result.title = title_override.unwrap_or_else(|| document.title.clone());
        result.author = author_override.or_else(|| document.author.clone());
        result.chapters_total = document.chapters.len();
        info!(
            title = %result.title,
            chapters = result.chapters_total,
            chars = document.total_chars(),
            "Document ingested"
        );

        let book_dir = self.config.output_dir.join(sanitize_title(&result.title));
        let chapters_dir = book_dir.join("chapters");
        fs::create_dir_all(&chapters_dir).await?;
        if self.config.save_intermediates {
            self.save_source(run, &book_dir, &result.title, &document).await;
        }

        let budget = ResourceBudget::from_settings(&self.config.budget);
        info!(budget = %budget.summary(), "Resource budget computed");
        run.monitor = self.start_monitor(&budget);
        self.idle.record_activity();
        self.idle.start();

        let progress = Arc::new(
            ProgressTracker::new(run.run_id.clone(), document.total_chars(), document.chapters.len())
                .with_event_bus(self.event_bus.clone())
                .with_state(Arc::clone(&run.state)),
        );
        let processor = Arc::new(self.processor(run, Arc::clone(&progress)));

        let settings = ChapterSettings::from_config(&self.config, Some(book_dir.clone()));
        let jobs: Vec<ChapterJob> = document
            .chapters
            .iter()
            .enumerate()
            .map(|(index, chapter)| ChapterJob::new(index, chapter, &chapters_dir, settings.clone()))
            .collect();

        let mode = RunMode::select(&self.config, jobs.len(), &budget);
        result.mode = Some(mode);
        info!(?mode, "Run mode selected");

        // Child processes load their own models.
        let in_process =
            !matches!(mode, RunMode::Parallel { .. }) || !self.config.worker_mode.is_process();
        if in_process {
            run.check_cancelled()?;
            processor.ensure_models_loaded().await?;
            processor.register_idle_unload(&self.idle);
        }

        let chapter_meta: Vec<(usize, u32, String)> = jobs
            .iter()
            .map(|job| (job.index, job.number, job.title.clone()))
            .collect();

        let outcomes = match mode {
            RunMode::Parallel { workers } => {
                self.run_parallel(run, jobs, workers, &budget, &processor, &progress)
                    .await?
            }
            RunMode::Pipelined => self.run_pipelined(run, jobs, &processor).await,
            RunMode::Sequential => self.run_sequential(run, jobs, &processor).await,
        };

        let packaged = collect_reports(&chapter_meta, &outcomes, result);
        if outcomes.cancelled || run.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if packaged.is_empty() {
            return Err(PipelineError::Packaging(
                "No valid chapter audio to package".to_string(),
            ));
        }

        run.set_stage(PipelineStage::Packaging);
        progress.report(
            PipelineStage::Packaging,
            None,
            None,
            format!("Packaging {} chapters", packaged.len()),
        );
        let output_path = book_dir.join(format!(
            "{}.{}",
            sanitize_title(&result.title),
            self.packager.extension()
        ));
        let metadata = BookMetadata::new(
            result.title.clone(),
            result.author.clone(),
            self.config.voice.clone(),
        )
        .with_comment(BOOK_COMMENT);

        tokio::select! {
            _ = run.token.cancelled() => return Err(PipelineError::Cancelled),
            packaged = self.packager.package(&packaged, &metadata, &output_path) => {
                packaged.map_err(|err| PipelineError::Packaging(err.to_string()))?
            }
        };

        info!(path = %output_path.display(), "Audiobook packaged");
        result.output_path = Some(output_path);
        Ok(())
    }

    async fn run_sequential(
        &self,
        run: &RunContext,
        jobs: Vec<ChapterJob>,
        processor: &ChapterProcessor,
    ) -> ChapterOutcomes {
        let mut outcomes = BTreeMap::new();

        for job in jobs {
            if run.token.is_cancelled() {
                return ChapterOutcomes {
                    outcomes,
                    cancelled: true,
                };
            }
            let index = job.index;
            run.events.started(&job);
            let result = processor.process(job, &run.token).await;
            run.events.finished(index, &result);

            match result {
                Ok(output) => {
                    outcomes.insert(index, Ok(output));
                }
                Err(err) if err.is_cancelled() => {
                    return ChapterOutcomes {
                        outcomes,
                        cancelled: true,
                    };
                }
                Err(err) => {
                    outcomes.insert(index, Err(TaskFailure::from(&err)));
                }
            }
        }

        ChapterOutcomes {
            outcomes,
            cancelled: false,
        }
    }

    async fn run_parallel(
        &self,
        run: &RunContext,
        jobs: Vec<ChapterJob>,
        workers: usize,
        budget: &ResourceBudget,
        processor: &Arc<ChapterProcessor>,
        progress: &Arc<ProgressTracker>,
    ) -> Result<ChapterOutcomes> {
        let worker: Arc<dyn Worker> = match &self.config.worker_mode {
            WorkerMode::InProcess => Arc::new(InProcessWorker::new(Arc::clone(processor))),
            WorkerMode::Process { program, args } => Arc::new(ProcessWorker::new(
                program.clone(),
                args.clone(),
                budget.per_worker_share(workers),
            )),
        };
        info!(workers, backend = worker.name(), "Starting chapter workers");

        let pool: ChapterWorkerPool<ChapterOutput> =
            ChapterWorkerPool::new(workers).with_parent_token(&run.token);
        pool.start();

        let mut cancelled = false;
        for job in jobs {
            let index = job.index;
            let task = ChapterTask::new(index).with_chars(job.char_count());
            let worker = Arc::clone(&worker);
            let cancel = pool.cancellation_token();
            let events = run.events.clone();
            let progress = Arc::clone(progress);

            run.events.started(&job);
            let submitted = pool
                .submit_task(task, async move {
                    let result = worker.run(job, cancel).await;
                    if let Ok(output) = &result {
                        progress.record_chapter_chars(output.index, output.chars_processed);
                        progress.report(
                            PipelineStage::Encoding,
                            Some(output.index),
                            None,
                            "Chapter complete",
                        );
                    }
                    events.finished(index, &result);
                    result
                })
                .await;

            if let Err(err) = submitted {
                if err.is_cancelled() {
                    cancelled = true;
                    break;
                }
                return Err(err);
            }
        }

        if cancelled || run.token.is_cancelled() {
            pool.shutdown(false).await;
            let outcomes = pool
                .results()
                .into_iter()
                .map(|(index, output)| (index, Ok(output)))
                .collect();
            return Ok(ChapterOutcomes {
                outcomes,
                cancelled: true,
            });
        }

        let results = pool.wait_for_all().await;
        let errors = pool.errors();
        pool.shutdown(true).await;
        info!(peak_active = pool.peak_active(), "Chapter workers finished");

        let mut outcomes: BTreeMap<usize, ChapterOutcome> = results
            .into_iter()
            .map(|(index, output)| (index, Ok(output)))
            .collect();
        outcomes.extend(errors.into_iter().map(|(index, failure)| (index, Err(failure))));

        Ok(ChapterOutcomes {
            outcomes,
            cancelled: run.token.is_cancelled(),
        })
    }

    async fn run_pipelined(
        &self,
        run: &RunContext,
        jobs: Vec<ChapterJob>,
        processor: &ChapterProcessor,
    ) -> ChapterOutcomes {
        let pipeliner: StagePipeliner<PreparedChapter, SynthesizedChapter> = StagePipeliner::new(
            self.config.chunk_queue_size,
            self.config.stage_poll_interval,
        )
        .with_parent_token(&run.token);
        let failures: Mutex<BTreeMap<usize, TaskFailure>> = Mutex::new(BTreeMap::new());
        let failures = &failures;
        let token = &run.token;
        let events = &run.events;

        let producer = async {
            for job in jobs {
                let index = job.index;
                events.started(&job);
                match processor.prepare(job, token).await {
                    Ok(prepared) => {
                        if pipeliner.submit(prepared).await.is_err() {
                            break;
                        }
                    }
                    Err(err) if err.is_cancelled() => break,
                    Err(err) => record_failure(failures, events, index, &err),
                }
            }
            if let Err(err) = pipeliner.finish().await {
                debug!(error = %err, "Pipeline drain not enqueued");
            }
        };

        let synthesis = pipeliner.run_synthesis_stage(|prepared| {
            let index = prepared.job.index;
            async move {
                let result = processor.synthesize(prepared, token).await;
                if let Err(err) = &result {
                    record_failure(failures, events, index, err);
                }
                result
            }
        });

        let encoding = pipeliner.run_encoding_stage(|synthesized| {
            let index = synthesized.job.index;
            async move {
                let result = processor.encode(synthesized, token).await;
                match &result {
                    Ok(output) => events.completed(output),
                    Err(err) => record_failure(failures, events, index, err),
                }
                result
            }
        });

        let ((), synthesis, encoding) = tokio::join!(producer, synthesis, encoding);

        let mut outcomes: BTreeMap<usize, ChapterOutcome> = BTreeMap::new();
        let mut cancelled = token.is_cancelled();
        match synthesis {
            Ok(report) => cancelled |= report.cancelled,
            Err(err) => warn!(error = %err, "Synthesis stage failed to run"),
        }
        match encoding {
            Ok((report, outputs)) => {
                cancelled |= report.cancelled;
                outcomes.extend(outputs.into_iter().map(|output| (output.index, Ok(output))));
            }
            Err(err) => warn!(error = %err, "Encoding stage failed to run"),
        }
        outcomes.extend(
            std::mem::take(&mut *failures.lock())
                .into_iter()
                .map(|(index, failure)| (index, Err(failure))),
        );

        ChapterOutcomes {
            outcomes,
            cancelled,
        }
    }

    fn processor(&self, run: &RunContext, progress: Arc<ProgressTracker>) -> ChapterProcessor {
        let processor = ChapterProcessor::new(
            Arc::clone(&self.synthesizer),
            Arc::clone(&self.cleaner),
            Arc::clone(&self.encoder),
            self.buffer_pool.clone(),
            Arc::clone(&run.writer),
        )
        .with_idle_manager(Arc::clone(&self.idle))
        .with_progress(progress);

        match &run.monitor {
            Some(monitor) => processor.with_monitor(Arc::clone(monitor)),
            None => processor,
        }
    }

    fn start_monitor(&self, budget: &ResourceBudget) -> Option<Arc<MemoryPressureMonitor>> {
        let probe = self.probe.as_ref()?;
        let mut monitor = MemoryPressureMonitor::new(
            self.config.memory.clone(),
            budget.available_bytes(),
            Arc::clone(probe),
        );
        if let Some(bus) = &self.event_bus {
            monitor = monitor.with_event_bus(bus.clone());
        }

        let pool = self.buffer_pool.clone();
        monitor.add_reclaim_hook(move || pool.clear());
        monitor.start();
        Some(Arc::new(monitor))
    }

    async fn save_source(&self, run: &RunContext, book_dir: &Path, title: &str, document: &Document) {
        let contents = format!("# {}\n\n{}", title, document.raw_text);
        if let Err(err) = run.writer.write_text(&book_dir.join("source.md"), &contents).await {
            warn!(error = %err, "Failed to save source text");
        }
    }

    /// Stops background loops and removes run artifacts. Never fails.
    async fn finish_run(&self, run: &RunContext) {
        if let Some(monitor) = &run.monitor {
            monitor.stop().await;
            let stats = monitor.stats();
            debug!(
                samples = stats.samples,
                peak_bytes = stats.peak_active_bytes,
                reclaims = stats.reclaim_count,
                "Memory monitor stopped"
            );
        }
        self.idle.stop().await;

        let removed = run.writer.cleanup().await;
        if removed > 0 {
            debug!(removed, "Removed staged files");
        }
        match fs::remove_dir_all(&run.run_temp_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %run.run_temp_dir.display(),
                error = %err,
                "Failed to remove run temp directory"
            ),
        }

        for name in [self.synthesizer.model_name(), self.cleaner.model_name()] {
            self.idle.unregister(&name);
        }
        if self.synthesizer.is_loaded() {
            if let Err(err) = self.synthesizer.unload().await {
                warn!(error = %err, "Failed to unload synthesis model");
            }
        }
        if self.cleaner.is_loaded() {
            if let Err(err) = self.cleaner.unload().await {
                warn!(error = %err, "Failed to unload cleaning model");
            }
        }

        self.buffer_pool.clear();
    }
}

fn record_failure(
    failures: &Mutex<BTreeMap<usize, TaskFailure>>,
    events: &ChapterEvents,
    index: usize,
    err: &PipelineError,
) {
    events.failed(index, err);
    if !err.is_cancelled() {
        failures.lock().insert(index, TaskFailure::from(err));
    }
}

/// Fills the chapter reports in document order and returns what to package.
fn collect_reports(
    chapters: &[(usize, u32, String)],
    outcomes: &ChapterOutcomes,
    result: &mut ConversionResult,
) -> Vec<PackagedChapter> {
    let mut packaged = Vec::new();
    result.chapters.clear();
    result.failed_chapters.clear();

    for (index, number, title) in chapters {
        let report = match outcomes.outcomes.get(index) {
            Some(Ok(output)) => {
                packaged.push(output.to_packaged());
                result.total_duration_ms += output.duration_ms;
                ChapterReport {
                    index: *index,
                    number: *number,
                    title: title.clone(),
                    status: TaskStatus::Completed,
                    audio_path: Some(output.audio_path.clone()),
                    duration_ms: output.duration_ms,
                    error: None,
                }
            }
            Some(Err(failure)) => {
                result.failed_chapters.insert(*index, failure.message.clone());
                ChapterReport {
                    index: *index,
                    number: *number,
                    title: title.clone(),
                    status: TaskStatus::Failed,
                    audio_path: None,
                    duration_ms: 0,
                    error: Some(failure.to_string()),
                }
            }
            None => ChapterReport {
                index: *index,
                number: *number,
                title: title.clone(),
                status: TaskStatus::Cancelled,
                audio_path: None,
                duration_ms: 0,
                error: None,
            },
        };
        result.chapters.push(report);
    }

    result.chapters_completed = packaged.len();
    packaged
}

// ============================================================================
// Builder
// ============================================================================

pub struct ConversionPipelineBuilder {
    config: PipelineConfig,
    ingestor: Option<Arc<dyn DocumentIngestor>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    cleaner: Option<Arc<dyn TextCleaner>>,
    encoder: Option<Arc<dyn AudioEncoder>>,
    packager: Option<Arc<dyn AudiobookPackager>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    event_bus: Option<EventBus>,
}

impl ConversionPipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ingestor: None,
            synthesizer: None,
            cleaner: None,
            encoder: None,
            packager: None,
            probe: None,
            event_bus: None,
        }
    }

    pub fn ingestor(mut self, ingestor: Arc<dyn DocumentIngestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn cleaner(mut self, cleaner: Arc<dyn TextCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn AudioEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn packager(mut self, packager: Arc<dyn AudiobookPackager>) -> Self {
        self.packager = Some(packager);
        self
    }

    /// Memory source for the pressure monitor. Without one (and without the
    /// `desktop-shims` feature) batch sizes stay at their base values.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<ConversionPipeline> {
        self.config.validate()?;

        let ingestor = require(self.ingestor, "Document ingestor", "ingestor")?;
        let synthesizer = require(self.synthesizer, "Speech synthesizer", "synthesizer")?;
        let cleaner = require(self.cleaner, "Text cleaner", "cleaner")?;
        let encoder = require(self.encoder, "Audio encoder", "encoder")?;
        let packager = require(self.packager, "Audiobook packager", "packager")?;
        let probe = self.probe.or_else(default_probe);

        let mut idle = IdleTimeoutManager::new(self.config.idle.clone());
        if let Some(bus) = &self.event_bus {
            idle = idle.with_event_bus(bus.clone());
        }

        Ok(ConversionPipeline {
            buffer_pool: BufferPool::new(self.config.buffer_pool_max_bytes),
            config: self.config,
            ingestor,
            synthesizer,
            cleaner,
            encoder,
            packager,
            probe,
            event_bus: self.event_bus,
            idle: Arc::new(idle),
            active_run: Mutex::new(None),
            current_state: Mutex::new(None),
        })
    }
}

fn require<T: ?Sized>(value: Option<Arc<T>>, what: &str, setter: &str) -> Result<Arc<T>> {
    value.ok_or_else(|| {
        PipelineError::Config(format!("{} is required. Use .{}() to set it.", what, setter))
    })
}

#[cfg(feature = "desktop-shims")]
fn default_probe() -> Option<Arc<dyn MemoryProbe>> {
    use bridge_desktop::{MemorySource, SystemMemoryProbe};

    match SystemMemoryProbe::new(MemorySource::Process) {
        Ok(probe) => Some(Arc::new(probe)),
        Err(err) => {
            warn!(error = %err, "System memory probe unavailable; pressure monitoring disabled");
            None
        }
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn default_probe() -> Option<Arc<dyn MemoryProbe>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::config::BudgetSettings;

    fn config(parallel: bool, pipelining: bool, max_parallel: usize) -> PipelineConfig {
        PipelineConfig::builder()
            .output_dir("/tmp/out")
            .temp_dir("/tmp/tmp")
            .enable_parallel(parallel)
            .enable_pipelining(pipelining)
            .max_parallel_chapters(max_parallel)
            .build()
            .unwrap()
    }

    #[test]
    fn test_mode_selection() {
        let roomy = ResourceBudget::from_settings(&BudgetSettings::default());
        let tight = ResourceBudget::from_settings(&BudgetSettings {
            total_gb: 4.0,
            ..BudgetSettings::default()
        });

        assert_eq!(
            RunMode::select(&config(true, true, 2), 5, &roomy),
            RunMode::Parallel { workers: 2 }
        );
        assert_eq!(
            RunMode::select(&config(true, true, 8), 5, &roomy),
            RunMode::Parallel { workers: 4 }
        );
        assert_eq!(RunMode::select(&config(true, true, 2), 5, &tight), RunMode::Pipelined);
        assert_eq!(RunMode::select(&config(true, true, 2), 1, &roomy), RunMode::Sequential);
        assert_eq!(RunMode::select(&config(false, true, 2), 3, &roomy), RunMode::Pipelined);
        assert_eq!(RunMode::select(&config(false, false, 2), 3, &roomy), RunMode::Sequential);
        assert_eq!(RunMode::select(&config(true, false, 1), 3, &roomy), RunMode::Sequential);
    }

    #[test]
    fn test_collect_reports_orders_and_counts() {
        let chapters = vec![
            (0, 1, "One".to_string()),
            (1, 2, "Two".to_string()),
            (2, 3, "Three".to_string()),
        ];
        let output = |index: usize| ChapterOutput {
            index,
            number: index as u32 + 1,
            title: format!("ch{}", index),
            audio_path: PathBuf::from(format!("/out/{}.mp3", index)),
            duration_ms: 1000,
            chars_processed: 10,
            chunks_total: 1,
            chunks_failed: 0,
        };
        let mut outcomes = BTreeMap::new();
        outcomes.insert(2, Ok(output(2)));
        outcomes.insert(
            1,
            Err(TaskFailure {
                code: "E100".into(),
                message: "No audio generated".into(),
            }),
        );
        outcomes.insert(0, Ok(output(0)));
        let outcomes = ChapterOutcomes {
            outcomes,
            cancelled: false,
        };

        let mut result = ConversionResult::new("run");
        let packaged = collect_reports(&chapters, &outcomes, &mut result);

        assert_eq!(packaged.iter().map(|p| p.number).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(result.chapters_completed, 2);
        assert_eq!(result.total_duration_ms, 2000);
        assert_eq!(result.chapters[1].status, TaskStatus::Failed);
        assert_eq!(result.failed_chapters[&1], "No audio generated");
    }
}
