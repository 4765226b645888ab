//! Error types for the mail RAG core.
//!
//! One enum per failure origin (spelled out so callers can tell a
//! provider outage from a corrupted index), composed into a top-level
//! `Error` for the binary.

use crate::session::ConversationState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mail(#[from] MailError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox provider errors (IMAP fetch path).
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("IMAP login failed for {username}")]
    AuthFailed { username: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox fetch timed out")]
    Timeout,

    #[error("Failed to parse message {message_id}: {reason}")]
    Parse { message_id: String, reason: String },

    #[error("Fetch task failed: {0}")]
    TaskFailed(String),
}

/// Embedding provider errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Http(String),

    #[error("Invalid response from embedding provider: {0}")]
    InvalidResponse(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding input was empty")]
    EmptyInput,
}

/// Persisted index errors, including consistency violations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Index generation {generation} is corrupt: {reason}")]
    Corrupt { generation: i64, reason: String },

    #[error(
        "Index was built with embedding model {index_model}, but the active model is {active_model}"
    )]
    ModelMismatch {
        index_model: String,
        active_model: String,
    },

    #[error("Invalid embedding vector in row {ordinal}: {reason}")]
    InvalidVector { ordinal: i64, reason: String },

    #[error("An ingestion run is already in progress")]
    IngestionInProgress,

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Mailbox error: {0}")]
    Mail(#[from] MailError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// A failed conversational turn.
///
/// Carries the history with the user turn already recorded so the
/// caller can surface the failure without re-submitting the message.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Context retrieval failed: {source}")]
    Retrieval {
        history: ConversationState,
        source: IndexError,
    },

    #[error("Language model call failed: {source}")]
    Completion {
        history: ConversationState,
        source: LlmError,
    },
}

impl ChatError {
    /// The conversation history as recorded up to the failure, if the
    /// user turn was accepted before the error occurred.
    pub fn recorded_history(&self) -> Option<&ConversationState> {
        match self {
            ChatError::EmptyMessage => None,
            ChatError::Retrieval { history, .. } | ChatError::Completion { history, .. } => {
                Some(history)
            }
        }
    }
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
