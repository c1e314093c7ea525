//! # Chapter Processor
//!
//! Runs one chapter through chunking, cleaning, synthesis and encoding. The
//! work is split into [`prepare`](ChapterProcessor::prepare),
//! [`synthesize`](ChapterProcessor::synthesize) and
//! [`encode`](ChapterProcessor::encode) so the pipeliner can overlap the last
//! two across chapters; [`process`](ChapterProcessor::process) runs all three.
//!
//! Model calls are serialized through a shared lock: one synthesizer and one
//! cleaner instance serve every in-process worker. Idle unloads registered
//! through [`register_idle_unload`](ChapterProcessor::register_idle_unload)
//! take the same lock, and every batch reloads a model that was unloaded in
//! between.
//!
//! Batch sizes are read from the memory pressure monitor before every batch,
//! so a pressure change takes effect mid-chapter.

use std::path::PathBuf;
use std::sync::Arc;

use bridge_traits::audio::{AudioEncoder, PackagedChapter};
use bridge_traits::ingest::ChapterText;
use bridge_traits::speech::{ModelLifecycle, SpeechSynthesizer, TextCleaner};
use core_memory::{BufferPool, IdleTimeoutManager, MemoryPressureMonitor, PooledBuffer};
use core_runtime::config::PipelineConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunker::TextChunker;
use crate::error::{PipelineError, Result};
use crate::output::{chapter_file_name, cleaned_text_file_name, OutputWriter};
use crate::progress::ProgressTracker;
use crate::stage::PipelineStage;

/// Per-run settings every chapter job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSettings {
    pub voice: String,
    pub speed: f64,
    pub max_chunk_chars: usize,
    /// Batch sizes used when no pressure monitor is attached.
    pub synthesis_batch: usize,
    pub cleaning_batch: usize,
    /// Where cleaned chapter text is saved; `None` skips it.
    pub intermediates_dir: Option<PathBuf>,
}

impl ChapterSettings {
    pub fn from_config(config: &PipelineConfig, intermediates_dir: Option<PathBuf>) -> Self {
        Self {
            voice: config.voice.clone(),
            speed: config.speed,
            max_chunk_chars: config.max_chunk_chars(),
            synthesis_batch: config.memory.base_synthesis_batch,
            cleaning_batch: config.memory.base_cleaning_batch,
            intermediates_dir: if config.save_intermediates {
                intermediates_dir
            } else {
                None
            },
        }
    }
}

/// One chapter's worth of work, serializable for process workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterJob {
    /// Zero-based position in the document.
    pub index: usize,
    pub number: u32,
    pub title: String,
    pub text: String,
    pub chapters_dir: PathBuf,
    pub settings: ChapterSettings,
}

impl ChapterJob {
    pub fn new(
        index: usize,
        chapter: &ChapterText,
        chapters_dir: impl Into<PathBuf>,
        settings: ChapterSettings,
    ) -> Self {
        Self {
            index,
            number: chapter.number,
            title: chapter.title.clone(),
            text: chapter.content.clone(),
            chapters_dir: chapters_dir.into(),
            settings,
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Result of a successfully encoded chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutput {
    pub index: usize,
    pub number: u32,
    pub title: String,
    pub audio_path: PathBuf,
    pub duration_ms: u64,
    pub chars_processed: usize,
    pub chunks_total: usize,
    pub chunks_failed: usize,
}

impl ChapterOutput {
    pub fn to_packaged(&self) -> PackagedChapter {
        PackagedChapter {
            number: self.number,
            title: self.title.clone(),
            audio_path: self.audio_path.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Chunked and cleaned text waiting for synthesis.
#[derive(Debug)]
pub struct PreparedChapter {
    pub job: ChapterJob,
    pub chunks: Vec<String>,
}

/// Concatenated samples waiting for encoding.
#[derive(Debug)]
pub struct SynthesizedChapter {
    pub job: ChapterJob,
    pub samples: PooledBuffer<f32>,
    pub sample_rate: u32,
    pub chars_processed: usize,
    pub chunks_total: usize,
    pub chunks_failed: usize,
}

pub struct ChapterProcessor {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cleaner: Arc<dyn TextCleaner>,
    encoder: Arc<dyn AudioEncoder>,
    buffer_pool: BufferPool,
    writer: Arc<OutputWriter>,
    model_lock: Arc<Mutex<()>>,
    monitor: Option<Arc<MemoryPressureMonitor>>,
    idle: Option<Arc<IdleTimeoutManager>>,
    progress: Option<Arc<ProgressTracker>>,
}

impl ChapterProcessor {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        cleaner: Arc<dyn TextCleaner>,
        encoder: Arc<dyn AudioEncoder>,
        buffer_pool: BufferPool,
        writer: Arc<OutputWriter>,
    ) -> Self {
        Self {
            synthesizer,
            cleaner,
            encoder,
            buffer_pool,
            writer,
            model_lock: Arc::new(Mutex::new(())),
            monitor: None,
            idle: None,
            progress: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MemoryPressureMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_idle_manager(mut self, idle: Arc<IdleTimeoutManager>) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn writer(&self) -> &Arc<OutputWriter> {
        &self.writer
    }

    /// Loads whichever model is not loaded yet.
    pub async fn ensure_models_loaded(&self) -> Result<()> {
        let guard = self.lock_loaded(self.synthesizer.as_ref()).await?;
        drop(guard);
        let guard = self.lock_loaded(self.cleaner.as_ref()).await?;
        drop(guard);
        self.touch();
        Ok(())
    }

    /// Registers both models with `idle`. The unload hooks wait for the model
    /// lock, so an unload never lands in the middle of a batch.
    pub fn register_idle_unload(&self, idle: &IdleTimeoutManager) {
        register_guarded(idle, Arc::clone(&self.synthesizer), Arc::clone(&self.model_lock));
        register_guarded(idle, Arc::clone(&self.cleaner), Arc::clone(&self.model_lock));
    }

    /// Takes the model lock and loads `model` if it is not loaded.
    async fn lock_loaded<M>(&self, model: &M) -> Result<MutexGuard<'_, ()>>
    where
        M: ModelLifecycle + ?Sized,
    {
        let guard = self.model_lock.lock().await;
        if !model.is_loaded() {
            info!(model = %model.model_name(), "Loading model");
            model.load().await.map_err(PipelineError::synthesis)?;
        }
        Ok(guard)
    }

    #[instrument(skip(self, job, cancel), fields(chapter = job.index))]
    pub async fn process(&self, job: ChapterJob, cancel: &CancellationToken) -> Result<ChapterOutput> {
        let prepared = self.prepare(job, cancel).await?;
        let synthesized = self.synthesize(prepared, cancel).await?;
        self.encode(synthesized, cancel).await
    }

    /// Chunks and cleans the chapter text.
    pub async fn prepare(&self, job: ChapterJob, cancel: &CancellationToken) -> Result<PreparedChapter> {
        check_cancelled(cancel)?;
        self.ensure_models_loaded().await?;

        self.report(PipelineStage::Chunking, job.index, None, "Chunking text");
        let chunks = TextChunker::new(job.settings.max_chunk_chars).chunk(&job.text);
        if chunks.is_empty() {
            return Err(PipelineError::chapter(job.index, "No text content"));
        }
        debug!(chapter = job.index, chunks = chunks.len(), "Chapter chunked");

        let mut cleaned = Vec::with_capacity(chunks.len());
        let mut position = 0;
        while position < chunks.len() {
            check_cancelled(cancel)?;
            let end = (position + self.cleaning_batch(&job.settings)).min(chunks.len());
            let batch = &chunks[position..end];

            let results = {
                let _guard = self.lock_loaded(self.cleaner.as_ref()).await?;
                check_cancelled(cancel)?;
                self.cleaner.clean_batch(batch).await
            };
            let mut results = results.into_iter();
            for (offset, raw) in batch.iter().enumerate() {
                match results.next() {
                    Some(Ok(text)) if text.trim().is_empty() => {}
                    Some(Ok(text)) => cleaned.push(text),
                    Some(Err(err)) => {
                        warn!(
                            chapter = job.index,
                            chunk = position + offset,
                            error = %err,
                            "Cleaning failed, keeping raw text"
                        );
                        cleaned.push(raw.clone());
                    }
                    None => {
                        warn!(
                            chapter = job.index,
                            chunk = position + offset,
                            "Cleaner returned no result, keeping raw text"
                        );
                        cleaned.push(raw.clone());
                    }
                }
            }

            self.touch();
            self.report(
                PipelineStage::Cleaning,
                job.index,
                Some((end, chunks.len())),
                "Cleaning text",
            );
            position = end;
        }

        if cleaned.is_empty() {
            return Err(PipelineError::chapter(job.index, "No text content"));
        }

        if let Some(dir) = &job.settings.intermediates_dir {
            let path = dir.join(cleaned_text_file_name(job.number));
            let contents = format!("# {}\n\n{}", job.title, cleaned.join("\n\n"));
            if let Err(err) = self.writer.write_text(&path, &contents).await {
                warn!(chapter = job.index, error = %err, "Failed to save cleaned text");
            }
        }

        Ok(PreparedChapter {
            job,
            chunks: cleaned,
        })
    }

    /// Synthesizes every chunk and concatenates the audio into one pooled
    /// buffer. Failed chunks are skipped.
    pub async fn synthesize(
        &self,
        prepared: PreparedChapter,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedChapter> {
        let PreparedChapter { job, chunks } = prepared;
        let settings = &job.settings;

        let mut pieces: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        let mut sample_rate: Option<u32> = None;
        let mut chars_processed = 0;
        let mut chunks_failed = 0;
        let mut position = 0;

        while position < chunks.len() {
            check_cancelled(cancel)?;
            let end = (position + self.synthesis_batch(settings)).min(chunks.len());
            let batch = &chunks[position..end];

            let results = {
                let _guard = self.lock_loaded(self.synthesizer.as_ref()).await?;
                check_cancelled(cancel)?;
                self.synthesizer
                    .synthesize_batch(batch, &settings.voice, settings.speed)
                    .await
            };
            let mut results = results.into_iter();
            for (offset, text) in batch.iter().enumerate() {
                let result = match results.next() {
                    Some(result) => result,
                    None => {
                        chunks_failed += 1;
                        warn!(
                            chapter = job.index,
                            chunk = position + offset,
                            "Synthesizer returned no result for chunk"
                        );
                        continue;
                    }
                };
                match result {
                    Ok(audio) if audio.samples.is_empty() => chunks_failed += 1,
                    Ok(audio) => {
                        match sample_rate {
                            None => sample_rate = Some(audio.sample_rate),
                            Some(rate) if rate != audio.sample_rate => warn!(
                                chapter = job.index,
                                expected = rate,
                                got = audio.sample_rate,
                                "Sample rate mismatch between chunks"
                            ),
                            Some(_) => {}
                        }
                        chars_processed += text.chars().count();
                        pieces.push(audio.samples);
                    }
                    Err(err) => {
                        chunks_failed += 1;
                        warn!(
                            chapter = job.index,
                            chunk = position + offset,
                            error = %err,
                            "Chunk synthesis failed, skipping"
                        );
                    }
                }
            }

            self.touch();
            if let Some(progress) = &self.progress {
                progress.record_chapter_chars(job.index, chars_processed);
            }
            self.report(
                PipelineStage::Synthesizing,
                job.index,
                Some((end, chunks.len())),
                "Synthesizing speech",
            );
            position = end;
        }

        let sample_rate = match sample_rate {
            Some(rate) if !pieces.is_empty() => rate,
            _ => return Err(PipelineError::chapter(job.index, "No audio generated")),
        };

        let total: usize = pieces.iter().map(Vec::len).sum();
        let mut samples = self.buffer_pool.acquire::<f32>(&[total])?;
        let mut offset = 0;
        for piece in pieces {
            samples[offset..offset + piece.len()].copy_from_slice(&piece);
            offset += piece.len();
        }

        Ok(SynthesizedChapter {
            chunks_total: chunks.len(),
            job,
            samples,
            sample_rate,
            chars_processed,
            chunks_failed,
        })
    }

    /// Encodes the samples to a staged file and commits it under the
    /// chapter's final name.
    pub async fn encode(
        &self,
        synthesized: SynthesizedChapter,
        cancel: &CancellationToken,
    ) -> Result<ChapterOutput> {
        let SynthesizedChapter {
            job,
            samples,
            sample_rate,
            chars_processed,
            chunks_total,
            chunks_failed,
        } = synthesized;
        check_cancelled(cancel)?;

        self.report(PipelineStage::Encoding, job.index, None, "Encoding audio");
        let file_name = chapter_file_name(job.number, &job.title, &self.encoder.extension());
        let staged = self.writer.staging_path(&file_name).await?;

        let duration_ms = self
            .encoder
            .encode(&samples, sample_rate, &staged)
            .await
            .map_err(PipelineError::encoding)?;
        drop(samples);

        let audio_path = job.chapters_dir.join(&file_name);
        self.writer.commit(&staged, &audio_path).await?;

        if let Some(progress) = &self.progress {
            progress.record_chapter_chars(job.index, chars_processed);
        }
        info!(
            chapter = job.index,
            duration_ms,
            chunks_failed,
            path = %audio_path.display(),
            "Chapter encoded"
        );

        Ok(ChapterOutput {
            index: job.index,
            number: job.number,
            title: job.title,
            audio_path,
            duration_ms,
            chars_processed,
            chunks_total,
            chunks_failed,
        })
    }

    fn synthesis_batch(&self, settings: &ChapterSettings) -> usize {
        self.monitor
            .as_ref()
            .map(|monitor| monitor.synthesis_batch_size())
            .unwrap_or(settings.synthesis_batch)
            .max(1)
    }

    fn cleaning_batch(&self, settings: &ChapterSettings) -> usize {
        self.monitor
            .as_ref()
            .map(|monitor| monitor.cleaning_batch_size())
            .unwrap_or(settings.cleaning_batch)
            .max(1)
    }

    fn touch(&self) {
        if let Some(idle) = &self.idle {
            idle.record_activity();
        }
    }

    fn report(
        &self,
        stage: PipelineStage,
        chapter: usize,
        chunk: Option<(usize, usize)>,
        message: &str,
    ) {
        if let Some(progress) = &self.progress {
            progress.report(stage, Some(chapter), chunk, message);
        }
    }
}

fn register_guarded<M>(idle: &IdleTimeoutManager, model: Arc<M>, lock: Arc<Mutex<()>>)
where
    M: ModelLifecycle + ?Sized + 'static,
{
    idle.register(model.model_name(), move || {
        let model = Arc::clone(&model);
        let lock = Arc::clone(&lock);
        async move {
            let _guard = lock.lock().await;
            model.unload().await
        }
    });
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::speech::{ModelLifecycle, SynthesizedAudio};
    use mockall::mock;
    use core_memory::IdleCheck;
    use core_runtime::config::IdleSettings;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    mock! {
        Encoder {}

        #[async_trait]
        impl AudioEncoder for Encoder {
            async fn encode(&self, samples: &[f32], sample_rate: u32, out_path: &Path) -> BridgeResult<u64>;
            fn extension(&self) -> String;
        }
    }

    /// Synthesizes one sample per character; text containing "fail" errors,
    /// as does any call while the model is unloaded.
    #[derive(Default)]
    struct CharSynth {
        loaded: AtomicBool,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ModelLifecycle for CharSynth {
        fn model_name(&self) -> String {
            "char-synth".to_string()
        }
        async fn load(&self) -> BridgeResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.loaded.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn unload(&self) -> BridgeResult<()> {
            self.loaded.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_loaded(&self) -> bool {
            self.loaded.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for CharSynth {
        async fn synthesize(&self, text: &str, _voice: &str, _speed: f64) -> BridgeResult<SynthesizedAudio> {
            if !self.is_loaded() {
                return Err(BridgeError::NotAvailable("model unloaded".into()));
            }
            if text.contains("fail") {
                return Err(BridgeError::OperationFailed("bad chunk".into()));
            }
            Ok(SynthesizedAudio::new(vec![0.5; text.chars().count()], 1000))
        }
    }

    /// Drops the last result of every batch.
    struct TruncatingSynth(CharSynth);

    #[async_trait]
    impl ModelLifecycle for TruncatingSynth {
        fn model_name(&self) -> String {
            "truncating-synth".to_string()
        }
        async fn load(&self) -> BridgeResult<()> {
            self.0.load().await
        }
        async fn unload(&self) -> BridgeResult<()> {
            self.0.unload().await
        }
        fn is_loaded(&self) -> bool {
            self.0.is_loaded()
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for TruncatingSynth {
        async fn synthesize(&self, text: &str, voice: &str, speed: f64) -> BridgeResult<SynthesizedAudio> {
            self.0.synthesize(text, voice, speed).await
        }

        async fn synthesize_batch(
            &self,
            texts: &[String],
            voice: &str,
            speed: f64,
        ) -> Vec<BridgeResult<SynthesizedAudio>> {
            let mut out = Vec::new();
            for text in texts.iter().take(texts.len().saturating_sub(1)) {
                out.push(self.0.synthesize(text, voice, speed).await);
            }
            out
        }
    }

    struct PassCleaner;

    #[async_trait]
    impl ModelLifecycle for PassCleaner {
        fn model_name(&self) -> String {
            "pass-cleaner".to_string()
        }
        async fn load(&self) -> BridgeResult<()> {
            Ok(())
        }
        async fn unload(&self) -> BridgeResult<()> {
            Ok(())
        }
        fn is_loaded(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl TextCleaner for PassCleaner {
        async fn clean(&self, text: &str) -> BridgeResult<String> {
            Ok(text.to_string())
        }
    }

    fn settings(dir: Option<PathBuf>) -> ChapterSettings {
        ChapterSettings {
            voice: "am_adam".into(),
            speed: 1.0,
            max_chunk_chars: 20,
            synthesis_batch: 2,
            cleaning_batch: 4,
            intermediates_dir: dir,
        }
    }

    fn job(dir: &TempDir, text: &str) -> ChapterJob {
        ChapterJob::new(
            0,
            &ChapterText::new(1, "Opening", text),
            dir.path().join("chapters"),
            settings(Some(dir.path().to_path_buf())),
        )
    }

    fn processor(dir: &TempDir, encoder: MockEncoder, pool: BufferPool) -> ChapterProcessor {
        ChapterProcessor::new(
            Arc::new(CharSynth::default()),
            Arc::new(PassCleaner),
            Arc::new(encoder),
            pool,
            Arc::new(OutputWriter::new(dir.path().join("tmp"))),
        )
    }

    #[tokio::test]
    async fn test_process_skips_failed_chunks() {
        let dir = TempDir::new().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_extension().returning(|| "mp3".to_string());
        encoder
            .expect_encode()
            .times(1)
            .returning(|samples, rate, path| {
                std::fs::write(path, b"mp3").unwrap();
                Ok(samples.len() as u64 * 1000 / rate as u64)
            });

        let pool = BufferPool::new(1024 * 1024);
        let processor = processor(&dir, encoder, pool.clone());
        let text = "Good words here. This will fail now. More good words.";

        let output = processor
            .process(job(&dir, text), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.chunks_total, 3);
        assert_eq!(output.chunks_failed, 1);
        assert_eq!(output.chars_processed, 16 + 16);
        assert_eq!(output.duration_ms, 32);
        assert_eq!(output.audio_path, dir.path().join("chapters").join("01_Opening.mp3"));
        assert!(output.audio_path.exists());
        assert_eq!(pool.outstanding(), 0);

        let cleaned = std::fs::read_to_string(dir.path().join("chapter_01_cleaned.md")).unwrap();
        assert!(cleaned.starts_with("# Opening\n\nGood words here."));
    }

    #[tokio::test]
    async fn test_empty_chapter_fails_without_encoding() {
        let dir = TempDir::new().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().never();

        let processor = processor(&dir, encoder, BufferPool::new(1024));
        let err = processor
            .process(job(&dir, "   \n\n  "), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Chapter { index: 0, ref message } if message == "No text content"));
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_no_audio() {
        let dir = TempDir::new().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().never();

        let processor = processor(&dir, encoder, BufferPool::new(1024));
        let err = processor
            .process(job(&dir, "This will fail."), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Chapter { ref message, .. } if message == "No audio generated"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_work() {
        let dir = TempDir::new().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().never();

        let processor = processor(&dir, encoder, BufferPool::new(1024));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = processor
            .process(job(&dir, "Some words."), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    fn idle_manager() -> Arc<IdleTimeoutManager> {
        Arc::new(IdleTimeoutManager::new(IdleSettings {
            enabled: true,
            timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            warning_before: Duration::from_secs(2),
        }))
    }

    #[tokio::test]
    async fn test_batch_shortfall_counts_as_failed_chunks() {
        let dir = TempDir::new().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_extension().returning(|| "mp3".to_string());
        encoder
            .expect_encode()
            .times(1)
            .returning(|samples, rate, path| {
                std::fs::write(path, b"mp3").unwrap();
                Ok(samples.len() as u64 * 1000 / rate as u64)
            });

        let processor = ChapterProcessor::new(
            Arc::new(TruncatingSynth(CharSynth::default())),
            Arc::new(PassCleaner),
            Arc::new(encoder),
            BufferPool::new(1024 * 1024),
            Arc::new(OutputWriter::new(dir.path().join("tmp"))),
        );
        let text = "Good words here. Fine words here. More good words.";

        let output = processor
            .process(job(&dir, text), &CancellationToken::new())
            .await
            .unwrap();

        // Batches of two: the second chunk and the lone third chunk go missing.
        assert_eq!(output.chunks_total, 3);
        assert_eq!(output.chunks_failed, 2);
        assert_eq!(output.chars_processed, 16);
        assert_eq!(output.duration_ms, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_unload_between_stages_reloads_synthesizer() {
        let dir = TempDir::new().unwrap();
        let synth = Arc::new(CharSynth::default());
        let idle = idle_manager();
        let processor = ChapterProcessor::new(
            synth.clone(),
            Arc::new(PassCleaner),
            Arc::new(MockEncoder::new()),
            BufferPool::new(1024 * 1024),
            Arc::new(OutputWriter::new(dir.path().join("tmp"))),
        )
        .with_idle_manager(idle.clone());
        processor.register_idle_unload(&idle);

        let cancel = CancellationToken::new();
        let prepared = processor
            .prepare(job(&dir, "Some words here."), &cancel)
            .await
            .unwrap();
        assert!(synth.is_loaded());

        tokio::time::advance(Duration::from_secs(11)).await;
        match idle.check_now().await {
            IdleCheck::Unloaded(names) => assert!(names.contains(&"char-synth".to_string())),
            other => panic!("unexpected idle check: {:?}", other),
        }
        assert!(!synth.is_loaded());

        let synthesized = processor.synthesize(prepared, &cancel).await.unwrap();
        assert_eq!(synthesized.chunks_failed, 0);
        assert_eq!(synthesized.samples.len(), 16);
        assert_eq!(synth.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_unload_waits_for_model_lock() {
        let dir = TempDir::new().unwrap();
        let synth = Arc::new(CharSynth::default());
        let idle = idle_manager();
        let processor = ChapterProcessor::new(
            synth.clone(),
            Arc::new(PassCleaner),
            Arc::new(MockEncoder::new()),
            BufferPool::new(1024),
            Arc::new(OutputWriter::new(dir.path().join("tmp"))),
        );
        processor.register_idle_unload(&idle);
        processor.ensure_models_loaded().await.unwrap();

        let guard = processor.model_lock.lock().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let checker = idle.clone();
        let check = tokio::spawn(async move { checker.check_now().await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(synth.is_loaded());

        drop(guard);
        assert!(matches!(check.await.unwrap(), IdleCheck::Unloaded(_)));
        assert!(!synth.is_loaded());
    }
}
