//! Bridge from rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{Chat, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};

/// Wraps any rig completion model as an [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Clone + Send + Sync,
{
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // Split the request into rig's shape: preamble (system), prior
        // turns, and the prompt (final user message).
        let mut preamble = String::new();
        let mut turns: Vec<Message> = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !preamble.is_empty() {
                        preamble.push_str("\n\n");
                    }
                    preamble.push_str(&msg.content);
                }
                Role::User => turns.push(Message::user(msg.content.clone())),
                Role::Assistant => turns.push(Message::assistant(msg.content.clone())),
            }
        }

        let prompt = match turns.pop() {
            Some(last) => last,
            None => {
                return Err(LlmError::InvalidResponse {
                    provider: "rig".to_string(),
                    reason: "completion request had no user messages".to_string(),
                });
            }
        };

        let mut builder = AgentBuilder::new(self.model.clone());
        if !preamble.is_empty() {
            builder = builder.preamble(&preamble);
        }
        let agent = builder.build();

        let content = agent
            .chat(prompt, turns)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "rig".to_string(),
                reason: e.to_string(),
            })?;

        // Token usage is not surfaced through the chat path.
        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
