//! GitHub Pages publisher.
//!
//! Layout under the publish directory:
//! - `pdfs/<YYYY-MM-DD_HHMMSS>.pdf`: published files, local time
//! - `pdfs.json`: [`PublicationIndex`], newest first, bounded
//!
//! After each update the directory is committed and pushed with the `git`
//! CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::mail::message::DeliveryMetadata;
use crate::publish::{PublishedPdf, Publisher};

const INDEX_FILE: &str = "pdfs.json";
const PDFS_DIR: &str = "pdfs";
const UNKNOWN_SENDER: &str = "Unknown";
const NO_SUBJECT: &str = "No Subject";

/// The persisted list of published PDFs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationIndex {
    #[serde(default)]
    pub pdfs: Vec<PublicationEntry>,
    #[serde(default)]
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationEntry {
    pub filename: String,
    /// Human-readable date, e.g. `2025년 10월 14일`.
    pub date: String,
    /// Human-readable time, e.g. `오전 09:30:05`.
    pub time: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub sender: String,
    pub subject: String,
}

impl PublicationEntry {
    pub fn new(filename: impl Into<String>, at: DateTime<Local>, metadata: &DeliveryMetadata) -> Self {
        Self {
            filename: filename.into(),
            date: korean_date(at),
            time: korean_time(at),
            timestamp: at
                .with_timezone(&Utc)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            sender: non_empty_or(&metadata.sender, UNKNOWN_SENDER),
            subject: non_empty_or(&metadata.subject, NO_SUBJECT),
        }
    }
}

impl PublicationIndex {
    /// Read the index, starting fresh if it is missing or unreadable.
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "pdfs.json not found, creating new one");
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "pdfs.json unreadable, starting fresh");
                Self::default()
            }
        }
    }

    /// Insert `entry` first and drop everything beyond `max`.
    /// Returns the evicted entries, oldest last.
    pub fn push_front(&mut self, entry: PublicationEntry, max: usize) -> Vec<PublicationEntry> {
        self.pdfs.insert(0, entry);
        if self.pdfs.len() > max {
            self.pdfs.split_off(max)
        } else {
            Vec::new()
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), PublishError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// Publishes into a directory served by GitHub Pages.
pub struct PagesPublisher {
    publish_dir: PathBuf,
    max_pdfs: usize,
    page_url: String,
    git: Option<GitRepo>,
}

impl PagesPublisher {
    pub fn new(
        publish_dir: impl Into<PathBuf>,
        max_pdfs: usize,
        page_url: impl Into<String>,
        git: Option<GitRepo>,
    ) -> Self {
        Self {
            publish_dir: publish_dir.into(),
            max_pdfs: max_pdfs.max(1),
            page_url: page_url.into(),
            git,
        }
    }

    /// Build from config, committing from the current directory.
    pub fn from_config(config: &PublishConfig) -> Self {
        Self::new(
            config.publish_dir.clone(),
            config.max_pdfs,
            config.page_url.clone(),
            Some(GitRepo::new(".", config.git_push)),
        )
    }

    fn pdfs_dir(&self) -> PathBuf {
        self.publish_dir.join(PDFS_DIR)
    }

    fn index_path(&self) -> PathBuf {
        self.publish_dir.join(INDEX_FILE)
    }

    /// Publish with an explicit timestamp.
    pub async fn publish_at(
        &self,
        pdf: &Path,
        metadata: &DeliveryMetadata,
        at: DateTime<Local>,
    ) -> Result<PublishedPdf, PublishError> {
        info!("Publishing PDF to GitHub Pages");

        let pdfs_dir = self.pdfs_dir();
        tokio::fs::create_dir_all(&pdfs_dir).await?;

        let filename = published_filename(at);
        let dest = pdfs_dir.join(&filename);
        tokio::fs::copy(pdf, &dest).await?;
        info!(filename = %filename, "PDF copied to pdfs/");

        if let Err(e) = self.update_index(&filename, at, metadata).await {
            // A file the index does not list would never be evicted.
            if let Err(rm) = tokio::fs::remove_file(&dest).await {
                warn!(filename = %filename, error = %rm, "Failed to remove unindexed PDF");
            }
            return Err(e);
        }

        if let Some(git) = &self.git {
            git.commit_and_push(&self.publish_dir, &commit_message(&filename, metadata))
                .await?;
        }

        info!(filename = %filename, url = %self.page_url, "PDF published successfully");
        Ok(PublishedPdf {
            filename,
            path: dest,
        })
    }

    async fn update_index(
        &self,
        filename: &str,
        at: DateTime<Local>,
        metadata: &DeliveryMetadata,
    ) -> Result<(), PublishError> {
        let index_path = self.index_path();
        let mut index = PublicationIndex::load(&index_path).await;

        let evicted = index.push_front(PublicationEntry::new(filename, at, metadata), self.max_pdfs);
        index.last_update = Some(korean_timestamp(at));
        index.save(&index_path).await?;
        info!(total = index.pdfs.len(), "pdfs.json updated");

        for old in evicted {
            let old_path = self.pdfs_dir().join(&old.filename);
            match tokio::fs::remove_file(&old_path).await {
                Ok(()) => info!(filename = %old.filename, "Deleted old PDF"),
                Err(e) => warn!(filename = %old.filename, error = %e, "Failed to delete old PDF"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for PagesPublisher {
    async fn publish(
        &self,
        pdf: &Path,
        metadata: &DeliveryMetadata,
    ) -> Result<PublishedPdf, PublishError> {
        self.publish_at(pdf, metadata, Local::now()).await
    }

    fn page_url(&self) -> &str {
        &self.page_url
    }
}

// ── Git ─────────────────────────────────────────────────────────────

/// A working tree the publisher commits into.
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
    push: bool,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>, push: bool) -> Self {
        Self {
            workdir: workdir.into(),
            push,
        }
    }

    /// `git add <pathspec>`, `git commit -m <message>`, then `git push`.
    ///
    /// A commit that finds nothing to commit counts as success and skips the
    /// push.
    pub async fn commit_and_push(&self, pathspec: &Path, message: &str) -> Result<(), PublishError> {
        info!("Committing and pushing to GitHub");

        let pathspec = pathspec.to_string_lossy();
        self.run(&["add", pathspec.as_ref()]).await?;
        info!("Git add completed");

        match self.run(&["commit", "-m", message]).await {
            Ok(_) => info!("Git commit completed"),
            Err(PublishError::Git { stderr, .. }) if is_nothing_to_commit(&stderr) => {
                info!("No changes to commit");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if self.push {
            self.run(&["push"]).await?;
            info!("Git push completed");
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String, PublishError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        // git prints "nothing to commit" on stdout, so report both streams.
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PublishError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: format!("{}{}", stdout, stderr).trim().to_string(),
        })
    }
}

pub fn is_nothing_to_commit(output: &str) -> bool {
    output.contains("nothing to commit") || output.contains("no changes added to commit")
}

fn commit_message(filename: &str, metadata: &DeliveryMetadata) -> String {
    format!(
        "Add PDF: {filename}\n\nFrom: {}\nSubject: {}\n\nAuto-generated commit from email monitoring service",
        non_empty_or(&metadata.sender, UNKNOWN_SENDER),
        non_empty_or(&metadata.subject, NO_SUBJECT),
    )
}

// ── Formatting ──────────────────────────────────────────────────────

fn published_filename(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d_%H%M%S.pdf").to_string()
}

fn korean_date(at: DateTime<Local>) -> String {
    at.format("%Y년 %-m월 %-d일").to_string()
}

/// `오전 09:30:05` / `오후 01:05:00`.
fn korean_time(at: DateTime<Local>) -> String {
    let (pm, hour) = at.hour12();
    let meridiem = if pm { "오후" } else { "오전" };
    format!("{meridiem} {hour:02}:{:02}:{:02}", at.minute(), at.second())
}

/// `2025. 10. 14. 오전 9:30:05`.
fn korean_timestamp(at: DateTime<Local>) -> String {
    let (pm, hour) = at.hour12();
    let meridiem = if pm { "오후" } else { "오전" };
    format!(
        "{} {meridiem} {hour}:{:02}:{:02}",
        at.format("%Y. %-m. %-d."),
        at.minute(),
        at.second()
    )
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
