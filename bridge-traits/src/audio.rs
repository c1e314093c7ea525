//! Audio Encoding and Packaging
//!
//! Contracts for turning raw samples into chapter files and chapter files
//! into a single audiobook container.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Encoder for one chapter's audio.
#[async_trait]
pub trait AudioEncoder: Send + Sync {
    /// Encode `samples` to `out_path` and return the encoded duration in
    /// milliseconds.
    async fn encode(&self, samples: &[f32], sample_rate: u32, out_path: &Path) -> Result<u64>;

    /// File extension (without dot) of the produced files.
    fn extension(&self) -> String {
        "mp3".to_string()
    }
}

/// A successfully encoded chapter handed to the packager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedChapter {
    pub number: u32,
    pub title: String,
    pub audio_path: PathBuf,
    pub duration_ms: u64,
}

/// Book-level metadata embedded in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    pub narrator: String,
    pub comment: Option<String>,
}

impl BookMetadata {
    pub fn new(title: impl Into<String>, author: Option<String>, narrator: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.unwrap_or_else(|| "Unknown".to_string()),
            narrator: narrator.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Packager that assembles chapter files into the final audiobook.
#[async_trait]
pub trait AudiobookPackager: Send + Sync {
    /// Write the audiobook to `out_path`. `chapters` are in reading order.
    async fn package(
        &self,
        chapters: &[PackagedChapter],
        metadata: &BookMetadata,
        out_path: &Path,
    ) -> Result<()>;

    /// File extension (without dot) of the produced container.
    fn extension(&self) -> String {
        "m4b".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults_unknown_author() {
        let meta = BookMetadata::new("Title", None, "am_adam").with_comment("generated");
        assert_eq!(meta.author, "Unknown");
        assert_eq!(meta.narrator, "am_adam");
        assert_eq!(meta.comment.as_deref(), Some("generated"));
    }
}
