//! Raw IMAP-over-TLS fetch (blocking, run via `spawn_blocking`).
//!
//! The indexer reads the mailbox without mutating flags: messages are
//! never marked `\Seen` here, so indexing stays invisible to other
//! clients of the same account.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::config::MailConfig;
use crate::error::MailError;
use crate::mail::{MailSource, RawMail};

/// IMAP-backed [`MailSource`].
pub struct ImapSource {
    config: MailConfig,
}

impl ImapSource {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawMail>, MailError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_imap(&config, since))
            .await
            .map_err(|e| MailError::TaskFailed(e.to_string()))?
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Fetch messages from the configured folder, optionally bounded to
/// those received on or after `since` (IMAP `SEARCH SINCE` has
/// day granularity; callers dedup by message id).
fn fetch_imap(config: &MailConfig, since: Option<DateTime<Utc>>) -> Result<Vec<RawMail>, MailError> {
    let mut tls = connect_tls(config)?;

    // Read greeting
    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", config.username, config.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailError::AuthFailed {
            username: config.username.clone(),
        });
    }

    let select_resp = send_cmd(&mut tls, "A2", &format!("SELECT \"{}\"", config.folder))?;
    if !select_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailError::Protocol(format!(
            "SELECT {} failed",
            config.folder
        )));
    }

    let search = match since {
        Some(ts) => format!("SEARCH SINCE {}", imap_date(ts)),
        None => "SEARCH ALL".to_string(),
    };
    let search_resp = send_cmd(&mut tls, "A3", &search)?;

    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }

    debug!(count = uids.len(), "IMAP search matched messages");

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {uid} RFC822"))?;

        // First line is the untagged FETCH header, last is the tagged
        // completion; everything between is message payload.
        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if !raw.is_empty() {
            results.push(RawMail {
                raw: raw.into_bytes(),
            });
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

fn connect_tls(config: &MailConfig) -> Result<TlsStream, MailError> {
    let tcp =
        TcpStream::connect((&*config.imap_host, config.imap_port)).map_err(|e| {
            MailError::Connect {
                host: config.imap_host.clone(),
                port: config.imap_port,
                reason: e.to_string(),
            }
        })?;
    tcp.set_read_timeout(Some(Duration::from_secs(config.read_timeout_secs)))
        .map_err(|e| MailError::Connect {
            host: config.imap_host.clone(),
            port: config.imap_port,
            reason: e.to_string(),
        })?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone()).map_err(|e| {
            MailError::Tls {
                host: config.imap_host.clone(),
                reason: e.to_string(),
            }
        })?;
    let conn =
        rustls::ClientConnection::new(tls_config, server_name).map_err(|e| MailError::Tls {
            host: config.imap_host.clone(),
            reason: e.to_string(),
        })?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn read_line(tls: &mut TlsStream) -> Result<String, MailError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailError::Protocol("connection closed".to_string())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                return Err(MailError::Timeout);
            }
            Err(e) => return Err(MailError::Protocol(e.to_string())),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, MailError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes()).map_err(|e| MailError::Protocol(e.to_string()))?;
    IoWrite::flush(tls).map_err(|e| MailError::Protocol(e.to_string()))?;

    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Format an instant as an IMAP search date, e.g. `06-Jan-2025`.
fn imap_date(ts: DateTime<Utc>) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    format!(
        "{:02}-{}-{}",
        ts.day(),
        MONTHS[ts.month0() as usize],
        ts.year()
    )
}
