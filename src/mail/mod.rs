//! Mailbox access: IMAP fetch plus RFC 822 normalization.

pub mod imap;
pub mod parse;

pub use imap::ImapSource;
pub use parse::{EmailRecord, normalize};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

/// One raw message as fetched from the mailbox, before normalization.
#[derive(Debug, Clone)]
pub struct RawMail {
    pub raw: Vec<u8>,
}

/// A source of raw mailbox messages.
///
/// `since` bounds the fetch to messages received at or after the given
/// instant; `None` means the whole mailbox.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawMail>, MailError>;
}
