use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::completion::{CompletionClients, CompletionError, CompletionRequest};
use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::render;
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::task::AssistantKind;
use crate::models::template::{non_empty, NodeData};

/// Send one prompt to `kind` on behalf of the running instance. The
/// instance id doubles as the conversation session.
pub(super) async fn ask_assistant(
    clients: &CompletionClients,
    kind: AssistantKind,
    ctx: &ExecutionContext,
    system_prompt: Option<String>,
    user_prompt: String,
    timeout: Duration,
) -> Result<String, CompletionError> {
    let request = CompletionRequest::new(ctx.instance_id(), user_prompt, timeout)
        .with_system_prompt(system_prompt);
    let response = clients.complete(kind, request).await?;
    if !response.completed {
        return Err(CompletionError::Incomplete);
    }
    Ok(response.content)
}

/// Map a node's `model` field to a backing assistant.
pub(super) fn assistant_for_model(model: Option<&str>, instance_id: &str) -> AssistantKind {
    match non_empty(model).map(|m| m.to_lowercase()).as_deref() {
        None | Some("openclaw") => AssistantKind::OpenClaw,
        Some("claude") | Some("claude-code") => AssistantKind::Claude,
        Some("kimi") => AssistantKind::Kimi,
        Some(other) => {
            tracing::warn!(
                "[Flowchart:{}] Unknown model '{}', falling back to openclaw",
                instance_id,
                other
            );
            AssistantKind::OpenClaw
        }
    }
}

/// Generic assistant call; `model` selects the assistant.
pub struct LlmNodeHandler {
    clients: CompletionClients,
    timeout: Duration,
}

impl LlmNodeHandler {
    pub fn new(clients: CompletionClients, timeout: Duration) -> Self {
        Self { clients, timeout }
    }
}

#[async_trait]
impl NodeHandler for LlmNodeHandler {
    fn node_type(&self) -> &'static str {
        "llm"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let Some(user_template) = non_empty(data.user_prompt.as_deref()) else {
            return NodeResult::failure("LLM node requires userPrompt");
        };
        let system_prompt = data.system_prompt.as_deref().map(|s| render(s, ctx.variables()));
        let user_prompt = render(user_template, ctx.variables());
        let kind = assistant_for_model(data.model.as_deref(), ctx.instance_id());

        tracing::info!(
            "[Flowchart:{}] LLM node executing: assistant={}, systemPromptLength={}, userPromptLength={}",
            ctx.instance_id(),
            kind,
            system_prompt.as_ref().map_or(0, |s| s.len()),
            user_prompt.len()
        );

        match ask_assistant(&self.clients, kind, ctx, system_prompt, user_prompt, self.timeout).await {
            Ok(reply) => {
                if let Some(var) = data.output_var() {
                    ctx.set(var, Value::String(reply.clone()));
                }
                tracing::info!(
                    "[Flowchart:{}] LLM node completed: responseLength={}",
                    ctx.instance_id(),
                    reply.len()
                );
                NodeResult::success(reply)
            }
            Err(e) => {
                tracing::error!("[Flowchart:{}] LLM call failed: {}", ctx.instance_id(), e);
                NodeResult::failure(format!("LLM call failed: {}", e))
            }
        }
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        if non_empty(data.user_prompt.as_deref()).is_none() {
            return ValidationResult::invalid("userPrompt must not be empty");
        }
        ValidationResult::valid()
    }

    fn description(&self) -> &'static str {
        "Call a backing assistant (openclaw, claude or kimi) with rendered prompts"
    }
}
