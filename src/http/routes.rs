//! HTTP endpoints over the retrieval core.
//!
//! Thin JSON adapter: parse, delegate to the core, shape the reply.
//! All retrieval semantics live below this layer.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::RetrievalConfig;
use crate::error::{ChatError, IndexError};
use crate::http::sessions::SessionTable;
use crate::index::{IndexStore, Indexer, SearchEngine};
use crate::session::SessionManager;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionTable>,
    pub manager: Arc<SessionManager>,
    pub search: Arc<SearchEngine>,
    pub store: Arc<IndexStore>,
    /// `None` when no mailbox is configured; the load endpoint reports
    /// that instead of silently doing nothing.
    pub indexer: Option<Arc<Indexer>>,
    pub retrieval: RetrievalConfig,
    pub llm_model: String,
    pub embed_model: String,
    pub mail_configured: bool,
}

/// Build the API router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat/message", post(chat_message))
        .route("/api/chat/sessions", get(list_sessions))
        .route("/api/chat/session/{id}", delete(delete_session))
        .route("/api/emails/load", post(load_emails))
        .route("/api/emails/search", post(search_emails))
        .route("/api/emails/status", get(email_status))
        .route("/api/system/status", get(system_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub k: Option<usize>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "service": "mail-rag",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

pub(crate) fn new_session_id() -> String {
    format!("session_{}", Utc::now().timestamp_millis())
}

async fn chat_message(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(message) = req.message else {
        return error_body(StatusCode::BAD_REQUEST, "Message is required");
    };
    if message.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Message cannot be empty");
    }

    let session_id = req.session_id.unwrap_or_else(new_session_id);
    let handle = state.sessions.get_or_create(&session_id).await;

    // Hold the per-session lock for the whole turn so concurrent
    // messages to one session cannot interleave histories.
    let mut guard = handle.lock().await;
    let history = if guard.is_empty() {
        None
    } else {
        Some(guard.clone())
    };

    match state.manager.ask_question(&message, history).await {
        Ok((updated, answer)) => {
            *guard = updated;
            Json(json!({
                "response": answer,
                "session_id": session_id,
                "timestamp": Utc::now().to_rfc3339(),
            }))
            .into_response()
        }
        Err(ChatError::EmptyMessage) => {
            error_body(StatusCode::BAD_REQUEST, "Message cannot be empty")
        }
        Err(e) => {
            // Keep the user turn that was recorded before the failure
            // so a retry does not double-submit it.
            if let Some(recorded) = e.recorded_history() {
                *guard = recorded.clone();
            }
            error!(%session_id, error = %e, "Chat turn failed");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to process message: {e}"),
            )
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    let sessions = state.sessions.summaries().await;
    Json(json!({ "sessions": sessions })).into_response()
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.sessions.remove(&id).await {
        Json(json!({ "message": "Session deleted successfully" })).into_response()
    } else {
        error_body(StatusCode::NOT_FOUND, "Session not found")
    }
}

async fn load_emails(State(state): State<AppState>) -> Response {
    let Some(indexer) = state.indexer.clone() else {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Email ingestion is not configured",
        );
    };

    // Claim the single-flight slot before answering so exactly one of
    // two simultaneous requests gets the 202.
    let permit = match indexer.try_begin() {
        Ok(permit) => permit,
        Err(_) => {
            return error_body(
                StatusCode::CONFLICT,
                "An ingestion run is already in progress",
            );
        }
    };

    tokio::spawn(async move {
        match indexer.run(permit).await {
            Ok(report) => info!(
                fetched = report.fetched,
                indexed = report.indexed,
                total = report.total,
                "Background ingestion finished"
            ),
            Err(e) => error!(error = %e, "Background ingestion failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "processing",
            "message": "Email loading started",
        })),
    )
        .into_response()
}

async fn search_emails(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> Response {
    let query = req.query.unwrap_or_default();
    let query = query.trim();
    if query.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Query is required");
    }

    let k = req.k.filter(|k| *k > 0).unwrap_or(state.retrieval.search_k);

    match state.search.vector_search(query, k).await {
        Ok(results) => Json(json!({
            "count": results.len(),
            "results": results,
            "query": query,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Search failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn email_status(State(state): State<AppState>) -> Response {
    let active = match state.store.active_generation().await {
        Ok(active) => active,
        Err(e) => return index_error_response(e),
    };
    let last_checked = match state.store.last_checked().await {
        Ok(ts) => ts,
        Err(e) => return index_error_response(e),
    };

    let in_progress = state
        .indexer
        .as_ref()
        .is_some_and(|i| i.ingestion_in_progress());

    Json(json!({
        "status": if active.is_some() { "ready" } else { "empty" },
        "indexed_emails": active.as_ref().and_then(|g| g.email_count).unwrap_or(0),
        "last_checked": last_checked.map(|ts| ts.to_rfc3339()),
        "ingestion_in_progress": in_progress,
    }))
    .into_response()
}

async fn system_status(State(state): State<AppState>) -> Response {
    let index_ready = matches!(state.store.active_generation().await, Ok(Some(_)));
    Json(json!({
        "status": "running",
        "model": state.llm_model,
        "embedding_model": state.embed_model,
        "mail_configured": state.mail_configured,
        "index_ready": index_ready,
        "active_sessions": state.sessions.len().await,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

fn index_error_response(e: IndexError) -> Response {
    error!(error = %e, "Index status query failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchMode;
    use crate::embedding::HashEmbedder;
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use async_trait::async_trait;

    struct StubLlm;

    #[async_trait]
    impl LlmProvider for StubLlm {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: "stub answer".to_string(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }

        fn model_name(&self) -> &str {
            "stub-model"
        }
    }

    async fn test_state() -> AppState {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let search = Arc::new(SearchEngine::new(
            Arc::clone(&store),
            Arc::new(HashEmbedder::new(64)),
        ));
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&search),
            Arc::new(StubLlm),
            RetrievalConfig::default(),
        ));
        AppState {
            sessions: Arc::new(SessionTable::new(8)),
            manager,
            search,
            store,
            indexer: None,
            retrieval: RetrievalConfig::default(),
            llm_model: "stub-model".to_string(),
            embed_model: "token-hash-v1".to_string(),
            mail_configured: false,
        }
    }

    #[tokio::test]
    async fn chat_without_message_is_rejected() {
        let state = test_state().await;
        let response = chat_message(
            State(state),
            Json(ChatRequest {
                message: None,
                session_id: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_creates_session_and_records_turns() {
        let state = test_state().await;
        let response = chat_message(
            State(state.clone()),
            Json(ChatRequest {
                message: Some("hello".to_string()),
                session_id: Some("session_1".to_string()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let handle = state.sessions.get("session_1").await.unwrap();
        assert_eq!(handle.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn delete_unknown_session_is_404() {
        let state = test_state().await;
        let response = delete_session(State(state), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_requires_a_query() {
        let state = test_state().await;
        let response = search_emails(
            State(state),
            Json(SearchRequest {
                query: Some("   ".to_string()),
                k: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_on_empty_index_is_ok() {
        let state = test_state().await;
        let response = search_emails(
            State(state),
            Json(SearchRequest {
                query: Some("invoice".to_string()),
                k: Some(5),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn load_without_mailbox_is_unavailable() {
        let state = test_state().await;
        let response = load_emails(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn busy_indexer_is_reported_as_conflict() {
        use crate::index::Indexer;
        use crate::mail::{MailSource, RawMail};
        use chrono::{DateTime, Utc};
        use std::time::Duration;

        struct SlowSource;

        #[async_trait]
        impl MailSource for SlowSource {
            async fn fetch(
                &self,
                _since: Option<DateTime<Utc>>,
            ) -> Result<Vec<RawMail>, crate::error::MailError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Vec::new())
            }
        }

        let mut state = test_state().await;
        let indexer = Arc::new(Indexer::new(
            Arc::new(SlowSource),
            Arc::new(HashEmbedder::new(64)),
            Arc::clone(&state.store),
            FetchMode::Full,
        ));
        state.indexer = Some(Arc::clone(&indexer));

        let busy = Arc::clone(&indexer);
        let running = tokio::spawn(async move { busy.load_emails().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = load_emails(State(state)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn simultaneous_load_requests_get_exactly_one_accept() {
        use crate::index::Indexer;
        use crate::mail::{MailSource, RawMail};
        use chrono::{DateTime, Utc};
        use std::time::Duration;

        struct SlowSource;

        #[async_trait]
        impl MailSource for SlowSource {
            async fn fetch(
                &self,
                _since: Option<DateTime<Utc>>,
            ) -> Result<Vec<RawMail>, crate::error::MailError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Vec::new())
            }
        }

        let mut state = test_state().await;
        state.indexer = Some(Arc::new(Indexer::new(
            Arc::new(SlowSource),
            Arc::new(HashEmbedder::new(64)),
            Arc::clone(&state.store),
            FetchMode::Full,
        )));

        // The first request claims the single-flight slot before it
        // answers, so the second one is rejected with no sleep needed.
        let first = load_emails(State(state.clone())).await;
        let second = load_emails(State(state)).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn session_ids_carry_the_prefix() {
        assert!(new_session_id().starts_with("session_"));
    }
}
