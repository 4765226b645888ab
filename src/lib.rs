//! Mail RAG: mailbox retrieval core.
//!
//! Ingests a mailbox into a persisted vector index, answers semantic
//! searches over it, and runs retrieval-augmented chat turns against a
//! hosted LLM. The `http` module republishes the same three operations
//! as JSON endpoints.

pub mod config;
pub mod embedding;
pub mod error;
pub mod http;
pub mod index;
pub mod llm;
pub mod mail;
pub mod session;
