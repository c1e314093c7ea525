//! Document Ingestion
//!
//! Contract for the parser that turns a source file into chapter text.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One top-level chapter of a parsed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterText {
    /// 1-based chapter number as it appears in the source.
    pub number: u32,
    /// Chapter title.
    pub title: String,
    /// Plain chapter text.
    pub content: String,
}

impl ChapterText {
    pub fn new(number: u32, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            content: content.into(),
        }
    }

    /// Number of characters, used for ETA accounting.
    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }
}

/// A parsed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub author: Option<String>,
    pub chapters: Vec<ChapterText>,
    /// Full source text, kept for intermediate output.
    pub raw_text: String,
}

impl Document {
    pub fn total_chars(&self) -> usize {
        self.chapters.iter().map(ChapterText::char_count).sum()
    }
}

/// Document parser (PDF, EPUB, ...).
///
/// Implementations should return [`BridgeError::Unsupported`](crate::BridgeError::Unsupported)
/// for file types they cannot read.
#[async_trait]
pub trait DocumentIngestor: Send + Sync {
    /// Parse `path` into a title, optional author and ordered chapters.
    async fn ingest(&self, path: &Path) -> Result<Document>;
}
