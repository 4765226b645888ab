//! Configuration types, built from environment variables.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How `load_emails` decides what to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Fetch the whole mailbox on every run.
    Full,
    /// Fetch only messages received since the last successful run.
    Incremental,
}

/// IMAP mailbox configuration.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
    pub fetch_mode: FetchMode,
    /// Socket read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl MailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILRAG_IMAP_HOST` is not set (ingestion disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAILRAG_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("MAILRAG_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("MAILRAG_IMAP_USERNAME").unwrap_or_default();
        let password = std::env::var("MAILRAG_IMAP_PASSWORD").unwrap_or_default();
        let folder = std::env::var("MAILRAG_IMAP_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        let fetch_mode = match std::env::var("MAILRAG_FETCH_MODE").as_deref() {
            Ok("full") => FetchMode::Full,
            _ => FetchMode::Incremental,
        };

        let read_timeout_secs: u64 = std::env::var("MAILRAG_IMAP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            folder,
            fetch_mode,
            read_timeout_secs,
        })
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/v1/embeddings` HTTP endpoint.
    OpenAi,
    /// Deterministic local token-hash embedder (offline, no API key).
    Hash,
}

/// Embedding provider configuration.
///
/// The model id and dimension are stored alongside every index
/// generation; searches against a generation built with a different
/// model are rejected rather than returning misaligned neighbors.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub request_timeout_secs: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("MAILRAG_EMBED_BACKEND").as_deref() {
            Ok("hash") => EmbeddingBackend::Hash,
            _ => EmbeddingBackend::OpenAi,
        };

        let api_key = std::env::var("MAILRAG_EMBED_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .unwrap_or_default();

        if backend == EmbeddingBackend::OpenAi && api_key.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "MAILRAG_EMBED_API_KEY (or OPENAI_API_KEY)".to_string(),
            ));
        }

        let base_url = std::env::var("MAILRAG_EMBED_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let model = std::env::var("MAILRAG_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let dimension: usize = std::env::var("MAILRAG_EMBED_DIM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1536);

        if dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILRAG_EMBED_DIM".to_string(),
                message: "dimension must be > 0".to_string(),
            });
        }

        let request_timeout_secs: u64 = std::env::var("MAILRAG_EMBED_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            base_url,
            model,
            dimension,
            request_timeout_secs,
        })
    }
}

/// Search and chat tuning.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Default result count for the search endpoint.
    pub search_k: usize,
    /// Result count used when retrieving chat context.
    pub context_k: usize,
    /// Maximum prior turns forwarded to the LLM per chat call.
    pub max_history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_k: 25,
            context_k: 20,
            max_history_turns: 20,
        }
    }
}

impl RetrievalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            search_k: std::env::var("MAILRAG_SEARCH_K")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|k| *k > 0)
                .unwrap_or(defaults.search_k),
            context_k: std::env::var("MAILRAG_CONTEXT_K")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|k| *k > 0)
                .unwrap_or(defaults.context_k),
            max_history_turns: std::env::var("MAILRAG_MAX_HISTORY_TURNS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_history_turns),
        }
    }
}

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_path: PathBuf,
    /// Maximum live chat sessions before LRU eviction.
    pub session_capacity: usize,
    /// Periodic ingestion interval in seconds; 0 disables the scheduler.
    pub ingest_interval_secs: u64,
    /// Optional directory for file logging.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            http_port: std::env::var("MAILRAG_HTTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5000),
            db_path: std::env::var("MAILRAG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/mail-rag.db")),
            session_capacity: std::env::var("MAILRAG_SESSION_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|c| *c > 0)
                .unwrap_or(64),
            ingest_interval_secs: std::env::var("MAILRAG_INGEST_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            log_dir: std::env::var("MAILRAG_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}
