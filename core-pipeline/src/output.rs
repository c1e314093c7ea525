//! # Output Writer
//!
//! Every file the pipeline produces is written to a sibling temp name and
//! renamed into place, so a cancelled or crashed run never leaves a
//! half-written file under its final name. Staged audio lives in the run's
//! temp directory until it is committed.
//!
//! Commits and text writes go through one async lock, so concurrent chapter
//! workers never race on the same destination.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

const MAX_CHAPTER_TITLE_CHARS: usize = 50;

/// Keeps alphanumerics, spaces, `-` and `_`; everything else becomes `_`.
pub fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `NN_<title>.<ext>` with the title cut to 50 characters.
pub fn chapter_file_name(number: u32, title: &str, extension: &str) -> String {
    let safe: String = sanitize_title(title)
        .chars()
        .take(MAX_CHAPTER_TITLE_CHARS)
        .collect();
    format!("{:02}_{}.{}", number, safe.trim_end(), extension)
}

pub fn cleaned_text_file_name(number: u32) -> String {
    format!("chapter_{:02}_cleaned.md", number)
}

#[derive(Debug)]
pub struct OutputWriter {
    temp_dir: PathBuf,
    staged: Mutex<Vec<PathBuf>>,
    write_lock: AsyncMutex<()>,
}

impl OutputWriter {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            staged: Mutex::new(Vec::new()),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Reserves a unique path in the temp directory for `file_name`.
    pub async fn staging_path(&self, file_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.temp_dir).await?;
        let path = self
            .temp_dir
            .join(format!("{}.{}.part", Uuid::new_v4(), file_name));
        self.staged.lock().push(path.clone());
        Ok(path)
    }

    /// Moves a staged file to `dest`, falling back to copy when the rename
    /// crosses filesystems.
    pub async fn commit(&self, staged: &Path, dest: &Path) -> Result<()> {
        let _writing = self.write_lock.lock().await;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::rename(staged, dest).await.is_err() {
            fs::copy(staged, dest).await?;
            fs::remove_file(staged).await.ok();
        }

        self.staged.lock().retain(|path| path != staged);
        debug!(path = %dest.display(), "Committed output file");
        Ok(())
    }

    /// Writes `contents` to a sibling temp file, then renames it over `dest`.
    pub async fn write_text(&self, dest: &Path, contents: &str) -> Result<()> {
        let _writing = self.write_lock.lock().await;
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;

        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        if let Err(err) = fs::write(&tmp, contents).await {
            fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp, dest).await {
            fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }
        Ok(())
    }

    /// Removes staged files that were never committed. Best effort.
    pub async fn cleanup(&self) -> usize {
        let staged: Vec<PathBuf> = std::mem::take(&mut *self.staged.lock());
        let mut removed = 0;
        for path in staged {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove temp file"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("War & Peace: Vol. 1"), "War _ Peace_ Vol_ 1");
        assert_eq!(sanitize_title("  ../etc/passwd "), "___etc_passwd");
        assert_eq!(sanitize_title("?!"), "__");
        assert_eq!(sanitize_title("   "), "untitled");
    }

    #[test]
    fn test_chapter_file_name_truncates_title() {
        assert_eq!(chapter_file_name(3, "The Beginning", "mp3"), "03_The Beginning.mp3");

        let long = "x".repeat(80);
        let name = chapter_file_name(12, &long, "mp3");
        assert_eq!(name, format!("12_{}.mp3", "x".repeat(50)));
        assert_eq!(cleaned_text_file_name(7), "chapter_07_cleaned.md");
    }

    #[tokio::test]
    async fn test_write_text_is_atomic_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path().join("tmp"));
        let dest = dir.path().join("book").join("source.md");

        writer.write_text(&dest, "# Book\n\nText").await.unwrap();
        writer.write_text(&dest, "# Book\n\nNew text").await.unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "# Book\n\nNew text");
        let entries: Vec<_> = std::fs::read_dir(dest.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_moves_staged_file_and_cleanup_removes_rest() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path().join("tmp"));

        let kept = writer.staging_path("01_intro.mp3").await.unwrap();
        let abandoned = writer.staging_path("02_next.mp3").await.unwrap();
        std::fs::write(&kept, b"audio").unwrap();
        std::fs::write(&abandoned, b"partial").unwrap();

        let dest = dir.path().join("chapters").join("01_intro.mp3");
        writer.commit(&kept, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"audio");
        assert_eq!(writer.cleanup().await, 1);
        assert!(!abandoned.exists());
        assert_eq!(writer.cleanup().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_destination_stay_whole() {
        let dir = TempDir::new().unwrap();
        let writer = std::sync::Arc::new(OutputWriter::new(dir.path().join("tmp")));
        let dest = dir.path().join("book").join("source.md");

        let writes: Vec<_> = (0..16u8)
            .map(|i| {
                let writer = writer.clone();
                let dest = dest.clone();
                tokio::spawn(async move {
                    let contents = char::from(b'a' + i).to_string().repeat(4096);
                    writer.write_text(&dest, &contents).await
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }

        let written = std::fs::read_to_string(&dest).unwrap();
        let first = written.chars().next().unwrap();
        assert_eq!(written.len(), 4096);
        assert!(written.chars().all(|c| c == first));
        let entries: Vec<_> = std::fs::read_dir(dest.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_waits_for_writer_lock() {
        let dir = TempDir::new().unwrap();
        let writer = std::sync::Arc::new(OutputWriter::new(dir.path().join("tmp")));
        let staged = writer.staging_path("01_intro.mp3").await.unwrap();
        std::fs::write(&staged, b"audio").unwrap();
        let dest = dir.path().join("chapters").join("01_intro.mp3");

        let held = writer.write_lock.lock().await;
        let committing = {
            let writer = writer.clone();
            let dest = dest.clone();
            tokio::spawn(async move { writer.commit(&staged, &dest).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!dest.exists());

        drop(held);
        committing.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"audio");
    }
}
