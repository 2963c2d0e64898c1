use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::llm::ask_assistant;
use crate::completion::CompletionClients;
use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::render;
use crate::flowchart::result::NodeResult;
use crate::models::task::AssistantKind;
use crate::models::template::{non_empty, NodeData};

/// Assistant call pinned to OpenClaw. The prompt falls back to the label.
pub struct OpenClawNodeHandler {
    clients: CompletionClients,
    timeout: Duration,
}

impl OpenClawNodeHandler {
    pub fn new(clients: CompletionClients, timeout: Duration) -> Self {
        Self { clients, timeout }
    }
}

#[async_trait]
impl NodeHandler for OpenClawNodeHandler {
    fn node_type(&self) -> &'static str {
        "openclaw"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let Some(prompt) = non_empty(data.user_prompt.as_deref()).or(non_empty(data.label.as_deref()))
        else {
            return NodeResult::failure("OpenClaw node requires userPrompt or label");
        };
        let user_prompt = render(prompt, ctx.variables());
        let system_prompt = data.system_prompt.as_deref().map(|s| render(s, ctx.variables()));

        tracing::info!(
            "[Flowchart:{}] OpenClaw node executing: promptLength={}",
            ctx.instance_id(),
            user_prompt.len()
        );

        match ask_assistant(
            &self.clients,
            AssistantKind::OpenClaw,
            ctx,
            system_prompt,
            user_prompt,
            self.timeout,
        )
        .await
        {
            Ok(reply) => {
                if let Some(var) = data.output_var() {
                    ctx.set(var, Value::String(reply.clone()));
                }
                NodeResult::success(reply)
            }
            Err(e) => {
                tracing::error!("[Flowchart:{}] OpenClaw call failed: {}", ctx.instance_id(), e);
                NodeResult::failure(format!("OpenClaw call failed: {}", e))
            }
        }
    }

    fn description(&self) -> &'static str {
        "Send a rendered prompt to OpenClaw"
    }
}
