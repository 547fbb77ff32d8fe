//! Page → PDF rendering.
//!
//! [`Renderer`] is the seam the dispatch pipeline renders through;
//! [`chromium::ChromiumRenderer`] is the production implementation.

pub mod chromium;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::RenderError;

/// Rendered PDFs in the temp directory older than this are purged.
pub const TEMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Characters of the sanitized URL kept in a render filename.
const URL_STEM_CHARS: usize = 50;

/// Per-render options.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// CSS selector that must appear before printing.
    pub wait_for_selector: Option<String>,
}

/// Renders a URL into a PDF file and returns its path.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<PathBuf, RenderError>;

    /// Release the browser. Idempotent.
    async fn close(&self);
}

/// `<sanitized url>_<timestamp>.pdf`.
///
/// Every non-alphanumeric character of the URL becomes `_` and the result is
/// cut to 50 characters; the timestamp is RFC 3339 with `:` and `.`
/// replaced by `-`.
pub fn pdf_filename(url: &str, at: DateTime<Utc>) -> String {
    let stem: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(URL_STEM_CHARS)
        .collect();
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{stem}_{stamp}.pdf")
}

/// Delete `*.pdf` files in `dir` whose modification time is older than
/// `max_age`. Returns how many were removed. A missing directory is not an
/// error.
pub async fn cleanup_old_pdfs(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pdf") {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Could not stat temp PDF");
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                tracing::info!(file = %path.display(), "Deleted old PDF");
            }
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "Failed to delete old PDF"),
        }
    }

    if deleted > 0 {
        tracing::info!(deleted, "Cleaned up old PDF file(s)");
    }
    Ok(deleted)
}
