//! RFC 822 normalization: raw message bytes to `EmailRecord`.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MailError;

/// One ingested message, immutable once written to the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Stable message identifier (RFC `Message-ID`, or generated when absent).
    pub message_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    /// Plain-text body, HTML stripped.
    pub body: String,
}

impl EmailRecord {
    /// The text submitted to the embedding model for this record.
    ///
    /// Subject and sender are folded in so that queries mentioning
    /// either land near the right messages.
    pub fn embedding_text(&self) -> String {
        format!(
            "From: {} Subject: {} Content: {}",
            self.sender, self.subject, self.body
        )
    }
}

/// Parse raw message bytes into a normalized record.
pub fn normalize(raw: &[u8]) -> Result<EmailRecord, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse {
            message_id: "(unparsed)".to_string(),
            reason: "not a valid RFC 822 message".to_string(),
        })?;

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let recipients = collect_addresses(parsed.to());
    let cc = collect_addresses(parsed.cc());

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();

    let timestamp = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body = extract_text(&parsed);

    Ok(EmailRecord {
        message_id,
        sender,
        recipients,
        cc,
        subject,
        timestamp,
        body,
    })
}

fn collect_addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    addr.map(|a| {
        a.iter()
            .filter_map(|entry| entry.address())
            .map(|s| s.to_string())
            .collect()
    })
    .unwrap_or_default()
}

/// Extract readable text from a parsed email, preferring the plain-text
/// part and falling back to stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

static STYLE_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(style|script)\b[^>]*>.*?</(style|script)>").expect("static regex")
});

/// Strip HTML down to readable text: style/script blocks removed whole,
/// remaining tags dropped, whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let cleaned = STYLE_SCRIPT_RE.replace_all(html, " ");

    let mut result = String::with_capacity(cleaned.len());
    let mut in_tag = false;
    for ch in cleaned.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
