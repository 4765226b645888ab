//! Conversational session manager: one RAG turn per call.
//!
//! Stateless across calls: the caller owns the `ConversationState` and
//! threads it through. On success exactly two turns are appended (user
//! then assistant); on failure the error carries the history with the
//! user turn recorded so callers can report without re-submitting.

use std::sync::Arc;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::error::ChatError;
use crate::index::SearchEngine;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::session::{ChatTurn, ConversationState, Role};

const SYSTEM_INSTRUCTIONS: &str = "You are a helpful assistant that answers questions about \
the user's email inbox. Ground every answer in the email excerpts provided below. If the \
excerpts do not contain the answer, say that you could not find it in the indexed emails \
instead of guessing.";

pub struct SessionManager {
    search: Arc<SearchEngine>,
    llm: Arc<dyn LlmProvider>,
    retrieval: RetrievalConfig,
}

impl SessionManager {
    pub fn new(
        search: Arc<SearchEngine>,
        llm: Arc<dyn LlmProvider>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            search,
            llm,
            retrieval,
        }
    }

    /// Run one conversational turn: record the user message, retrieve
    /// supporting emails, ask the LLM, record the answer.
    pub async fn ask_question(
        &self,
        message: &str,
        history: Option<ConversationState>,
    ) -> Result<(ConversationState, String), ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let mut history = history.unwrap_or_default();
        history.push(ChatTurn::user(message));

        let context = match self
            .search
            .vector_search(message, self.retrieval.context_k)
            .await
        {
            Ok(blocks) => blocks,
            Err(source) => return Err(ChatError::Retrieval { history, source }),
        };

        debug!(context_blocks = context.len(), "Retrieved chat context");

        let request = self.build_request(&history, &context);

        let answer = match self.llm.complete(request).await {
            Ok(response) => response.content,
            Err(source) => return Err(ChatError::Completion { history, source }),
        };

        history.push(ChatTurn::assistant(answer.clone()));
        Ok((history, answer))
    }

    fn build_request(&self, history: &ConversationState, context: &[String]) -> CompletionRequest {
        let context_section = if context.is_empty() {
            "(no matching emails found in the index)".to_string()
        } else {
            context.join("\n\n")
        };

        let system = format!("{SYSTEM_INSTRUCTIONS}\n\nRelevant emails:\n{context_section}");

        let mut messages = vec![ChatMessage::system(system)];
        for turn in history.last_n(self.retrieval.max_history_turns) {
            match turn.role {
                Role::User => messages.push(ChatMessage::user(&turn.content)),
                Role::Assistant => messages.push(ChatMessage::assistant(&turn.content)),
                // System turns are rebuilt fresh each call.
                Role::System => {}
            }
        }

        CompletionRequest::new(messages)
    }
}
