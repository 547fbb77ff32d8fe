//! Chat notifications for published PDFs and failures.

pub mod telegram;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::NotifyError;
use crate::mail::message::DeliveryMetadata;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a text message. HTML markup is interpreted.
    async fn send_message(&self, text: &str) -> Result<(), NotifyError>;

    /// Upload a file with a plain-text caption.
    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), NotifyError>;

    /// Report a failure. Delivery problems are logged, never returned.
    async fn send_error(&self, message: &str, context: &serde_json::Value);
}

/// Caption attached to a delivered PDF.
pub fn document_caption(metadata: &DeliveryMetadata, at: DateTime<Local>) -> String {
    let mut caption = String::from("📄 Email PDF\n\n");
    if !metadata.sender.is_empty() {
        caption.push_str(&format!("From: {}\n", decode_entities(&metadata.sender)));
    }
    if !metadata.subject.is_empty() {
        caption.push_str(&format!("Subject: {}\n", decode_entities(&metadata.subject)));
    }
    caption.push_str(&format!("\n{}", at.format("%Y. %-m. %-d. %H:%M:%S")));
    caption
}

/// HTML error report: bold title, message, then the context as JSON.
pub fn error_report(message: &str, context: &serde_json::Value) -> String {
    let mut report = format!("❌ <b>Error Occurred</b>\n\n{}\n\n", escape_html(message));
    let has_context = context.as_object().is_some_and(|o| !o.is_empty());
    if has_context {
        let pretty = serde_json::to_string_pretty(context).unwrap_or_default();
        report.push_str("<b>Context:</b>\n<code>");
        report.push_str(&escape_html(&pretty));
        report.push_str("</code>");
    }
    report
}

/// Undo the entity escaping some mail clients leave in header text.
fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
