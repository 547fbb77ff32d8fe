//! Parsed message view, sender classification and delivery metadata.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Characters of plain text kept in the metadata preview.
const PREVIEW_CHARS: usize = 100;

/// Structured view of one fetched message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// The From header as displayed, e.g. `Notices <notice@example.com>`.
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub text: String,
    pub html: Option<String>,
}

/// Sender/subject/link carried alongside every downstream artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub sender: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview: String,
    pub link: String,
}

impl DeliveryMetadata {
    pub fn new(message: &ParsedMessage, link: impl Into<String>) -> Self {
        Self {
            sender: message.from.clone(),
            subject: message.subject.clone(),
            date: message.date,
            preview: preview_of(&message.text),
            link: link.into(),
        }
    }
}

/// Parse raw RFC 5322 bytes.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse("not an RFC 5322 message".into()))?;

    let from = parsed
        .from()
        .map(format_address)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into());
    let to = parsed.to().map(format_address).unwrap_or_default();
    let subject = parsed
        .subject()
        .filter(|s| !s.is_empty())
        .unwrap_or("(no subject)")
        .to_string();
    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);
    let text = parsed
        .body_text(0)
        .map(|t| t.into_owned())
        .unwrap_or_default();
    let html = parsed
        .body_html(0)
        .map(|h| h.into_owned())
        .filter(|h| !h.trim().is_empty());

    tracing::info!(
        from = %from,
        subject = %subject,
        has_html = html.is_some(),
        has_text = !text.is_empty(),
        "Email parsed successfully"
    );

    Ok(ParsedMessage {
        from,
        to,
        subject,
        date,
        text,
        html,
    })
}

/// Case-insensitive substring match of the target against the From header.
///
/// Deliberately loose: no address grammar, so a target that happens to be a
/// substring of an unrelated address also matches.
pub fn is_from_target_sender(message: &ParsedMessage, target: &str) -> bool {
    let is_match = message
        .from
        .to_lowercase()
        .contains(&target.to_lowercase());

    if is_match {
        tracing::info!(from = %message.from, target, "Email from target sender detected");
    } else {
        tracing::debug!(from = %message.from, target, "Email not from target sender");
    }
    is_match
}

/// Render an address header the way mail clients display it.
fn format_address(addr: &mail_parser::Address) -> String {
    let entries: Vec<String> = match addr {
        mail_parser::Address::List(addrs) => addrs.iter().map(format_addr).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(format_addr))
            .collect(),
    };
    entries
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_addr(addr: &mail_parser::Addr) -> String {
    match (addr.name.as_deref(), addr.address.as_deref()) {
        (Some(name), Some(email)) if !name.is_empty() => format!("{name} <{email}>"),
        (_, Some(email)) => email.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

fn preview_of(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}
