//! Dispatch pipeline — render → publish → notify for each accepted message.
//!
//! Stages run strictly in sequence. A failure at any stage ends the cycle
//! for that message; the watcher keeps listening regardless.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::mail::watcher::{AcceptedMessage, MessageHandler};
use crate::notify::{Notifier, document_caption};
use crate::publish::{PublishedPdf, Publisher};
use crate::render::{RenderOptions, Renderer, cleanup_old_pdfs};

/// How often the temp purge runs.
pub const TEMP_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct DispatchPipeline {
    renderer: Arc<dyn Renderer>,
    publisher: Arc<dyn Publisher>,
    notifier: Option<Arc<dyn Notifier>>,
    render_options: RenderOptions,
    notify_errors: bool,
}

impl DispatchPipeline {
    pub fn new(renderer: Arc<dyn Renderer>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            renderer,
            publisher,
            notifier: None,
            render_options: RenderOptions::default(),
            notify_errors: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_render_options(mut self, options: RenderOptions) -> Self {
        self.render_options = options;
        self
    }

    /// Also report failed cycles to the chat. Needs a notifier.
    pub fn with_error_notifications(mut self, enabled: bool) -> Self {
        self.notify_errors = enabled;
        self
    }

    /// Run every stage for one message.
    pub async fn process(&self, message: &AcceptedMessage) -> Result<PublishedPdf, PipelineError> {
        let meta = &message.metadata;
        info!(
            from = %meta.sender,
            subject = %meta.subject,
            link = %message.link,
            "Processing new email"
        );

        info!("Generating PDF from link");
        let pdf = self
            .renderer
            .render(&message.link, &self.render_options)
            .await?;

        info!("Publishing PDF");
        let published = self.publisher.publish(&pdf, meta).await?;

        info!("Cleaning up temporary file");
        remove_temp(&pdf).await;

        if let Some(notifier) = &self.notifier {
            let caption = document_caption(meta, Local::now());
            notifier.send_document(&published.path, &caption).await?;
        }

        info!(filename = %published.filename, "Email processed successfully");
        Ok(published)
    }

    async fn report_failure(&self, message: &AcceptedMessage, err: &PipelineError) {
        error!(
            stage = err.stage(),
            error = %err,
            from = %message.metadata.sender,
            subject = %message.metadata.subject,
            link = %message.link,
            seq = message.seq,
            "Error processing email"
        );

        if !self.notify_errors {
            return;
        }
        if let Some(notifier) = &self.notifier {
            let context = serde_json::json!({
                "stage": err.stage(),
                "sender": message.metadata.sender,
                "subject": message.metadata.subject,
                "link": message.link,
            });
            notifier.send_error(&err.to_string(), &context).await;
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchPipeline {
    async fn handle(&self, message: AcceptedMessage) -> Result<(), PipelineError> {
        match self.process(&message).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.report_failure(&message, &e).await;
                Err(e)
            }
        }
    }
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Temporary PDF removed"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary PDF"),
    }
}

/// Spawn a task that purges stale PDFs from `temp_dir` every `every`.
pub fn spawn_temp_purge(temp_dir: PathBuf, every: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = cleanup_old_pdfs(&temp_dir, max_age).await {
                error!(error = %e, "Error cleaning up old PDFs");
            }
        }
    })
}
