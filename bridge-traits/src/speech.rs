//! Speech Model Abstractions
//!
//! Heavy, memory-hungry collaborators: the speech synthesizer and the text
//! cleaner. Both share a load/unload lifecycle so the core can warm them up
//! once per run and evict them when idle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Load/unload lifecycle shared by heavy models.
#[async_trait]
pub trait ModelLifecycle: Send + Sync {
    /// Stable name used in logs and idle-unload bookkeeping.
    fn model_name(&self) -> String;

    /// Load model weights. Must be a no-op when already loaded.
    async fn load(&self) -> Result<()>;

    /// Release model weights. Must be a no-op when not loaded.
    async fn unload(&self) -> Result<()>;

    fn is_loaded(&self) -> bool;
}

/// Mono audio produced by a synthesis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// Text-to-speech engine.
///
/// # Example
///
/// ```ignore
/// let audio = synthesizer.synthesize("Hello there.", "am_adam", 1.0).await?;
/// assert!(audio.sample_rate > 0);
/// ```
#[async_trait]
pub trait SpeechSynthesizer: ModelLifecycle {
    /// Synthesize one chunk of text.
    async fn synthesize(&self, text: &str, voice: &str, speed: f64) -> Result<SynthesizedAudio>;

    /// Synthesize several chunks. The result has one entry per input, in order.
    ///
    /// Engines that batch natively should override this; the default runs
    /// the chunks one after another.
    async fn synthesize_batch(
        &self,
        texts: &[String],
        voice: &str,
        speed: f64,
    ) -> Vec<Result<SynthesizedAudio>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.synthesize(text, voice, speed).await);
        }
        out
    }
}

/// Text normalizer run ahead of synthesis.
#[async_trait]
pub trait TextCleaner: ModelLifecycle {
    async fn clean(&self, text: &str) -> Result<String>;

    /// Clean several chunks, one result per input, in order.
    async fn clean_batch(&self, texts: &[String]) -> Vec<Result<String>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.clean(text).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoCleaner {
        loaded: AtomicBool,
    }

    #[async_trait]
    impl ModelLifecycle for EchoCleaner {
        fn model_name(&self) -> String {
            "echo".to_string()
        }

        async fn load(&self) -> Result<()> {
            self.loaded.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unload(&self) -> Result<()> {
            self.loaded.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.loaded.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextCleaner for EchoCleaner {
        async fn clean(&self, text: &str) -> Result<String> {
            if text.is_empty() {
                return Err(crate::BridgeError::OperationFailed("empty".into()));
            }
            Ok(text.to_uppercase())
        }
    }

    #[test]
    fn test_duration_ms() {
        let audio = SynthesizedAudio::new(vec![0.0; 24_000], 24_000);
        assert_eq!(audio.duration_ms(), 1000);

        let silent = SynthesizedAudio::new(vec![0.0; 10], 0);
        assert_eq!(silent.duration_ms(), 0);
    }

    #[tokio::test]
    async fn test_default_clean_batch_preserves_order_and_errors() {
        let cleaner = EchoCleaner {
            loaded: AtomicBool::new(false),
        };
        cleaner.load().await.unwrap();
        assert!(cleaner.is_loaded());

        let results = cleaner
            .clean_batch(&["a".to_string(), String::new(), "c".to_string()])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref().unwrap(), "A");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_deref().unwrap(), "C");
    }
}
