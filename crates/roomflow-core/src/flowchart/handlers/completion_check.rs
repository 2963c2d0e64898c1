use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::llm::ask_assistant;
use crate::completion::CompletionClients;
use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::{render, value_to_string};
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::task::AssistantKind;
use crate::models::template::{non_empty, NodeData};

const DEFAULT_SYSTEM_PROMPT: &str = "You judge whether a piece of text says that something is \
finished. Reply COMPLETED if the text states the task is done, completed, finished or \
succeeded. Reply INCOMPLETE if it is pending, in progress, failed, waiting or not started. \
Reply with exactly one of those two words and nothing else.";

const COMPLETED_MARKERS: [&str; 4] = ["COMPLETED", "完成", "DONE", "SUCCESS"];

/// Negated forms that contain a completed marker.
const NEGATED_MARKERS: [&str; 6] = ["INCOMPLETE", "NOT COMPLETE", "NOT DONE", "未完成", "没有完成", "没完成"];

/// `reply` is already trimmed and upper-cased. An exact verdict wins;
/// otherwise any negation rules completion out before markers are tried.
fn is_completed(reply: &str) -> bool {
    match reply.trim_matches(|c: char| !c.is_alphanumeric()) {
        "COMPLETED" => true,
        "INCOMPLETE" => false,
        _ => {
            !NEGATED_MARKERS.iter().any(|m| reply.contains(m))
                && COMPLETED_MARKERS.iter().any(|m| reply.contains(m))
        }
    }
}

/// Classifies `checkVar` as COMPLETED or INCOMPLETE and follows the
/// `completed` / `incomplete` handle.
pub struct CompletionCheckNodeHandler {
    clients: CompletionClients,
    timeout: Duration,
}

impl CompletionCheckNodeHandler {
    pub fn new(clients: CompletionClients, timeout: Duration) -> Self {
        Self { clients, timeout }
    }

    fn verdict(ctx: &ExecutionContext, completed: bool) -> NodeResult {
        let (result, handle) = if completed {
            ("COMPLETED", "completed")
        } else {
            ("INCOMPLETE", "incomplete")
        };
        let next = ctx
            .current_node_id
            .as_deref()
            .and_then(|id| ctx.find_edge_by_handle(id, handle))
            .map(|e| e.target.clone());
        NodeResult::success(result).with_next(next)
    }
}

#[async_trait]
impl NodeHandler for CompletionCheckNodeHandler {
    fn node_type(&self) -> &'static str {
        "completion_check"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let Some(check_var) = non_empty(data.check_var.as_deref()) else {
            return NodeResult::failure("Completion check requires checkVar");
        };

        let content = ctx
            .get(check_var)
            .map(value_to_string)
            .filter(|s| !s.trim().is_empty());
        let Some(content) = content else {
            tracing::warn!(
                "[Flowchart:{}] Check variable '{}' is empty, treating as incomplete",
                ctx.instance_id(),
                check_var
            );
            return Self::verdict(ctx, false);
        };

        let user_prompt = match non_empty(data.check_prompt.as_deref()) {
            Some(custom) => format!("{}\n\nContent to judge:\n{}", render(custom, ctx.variables()), content),
            None => format!("Does the following content say the work is completed?\n\n{}", content),
        };

        tracing::info!(
            "[Flowchart:{}] Completion check executing: checkVar={}, contentLength={}",
            ctx.instance_id(),
            check_var,
            content.len()
        );

        let reply = match ask_assistant(
            &self.clients,
            AssistantKind::OpenClaw,
            ctx,
            Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            user_prompt,
            self.timeout,
        )
        .await
        {
            Ok(r) => r.trim().to_uppercase(),
            Err(e) => {
                tracing::error!("[Flowchart:{}] Completion check failed: {}", ctx.instance_id(), e);
                return NodeResult::failure(format!("Completion check failed: {}", e));
            }
        };

        let completed = is_completed(&reply);
        let result = if completed { "COMPLETED" } else { "INCOMPLETE" };
        if let Some(var) = data.output_var() {
            ctx.set(var, Value::from(result));
        }
        ctx.set(format!("{}_check_result", check_var), Value::from(result));
        ctx.set(format!("{}_check_raw", check_var), Value::String(reply));

        tracing::info!(
            "[Flowchart:{}] Completion check result: {} -> {}",
            ctx.instance_id(),
            check_var,
            result
        );
        Self::verdict(ctx, completed)
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        match non_empty(data.check_var.as_deref()) {
            Some(_) => ValidationResult::valid(),
            None => ValidationResult::invalid("checkVar must not be empty"),
        }
    }

    fn description(&self) -> &'static str {
        "Ask an assistant whether a variable's content means the work is done"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::ScriptedClient;
    use crate::flowchart::context::tests::context_for;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = context_for(json!({
            "nodes": [
                { "id": "chk", "type": "completion_check" },
                { "id": "yes", "type": "end" },
                { "id": "no", "type": "end" }
            ],
            "edges": [
                { "id": "1", "source": "chk", "target": "yes", "sourceHandle": "completed" },
                { "id": "2", "source": "chk", "target": "no", "sourceHandle": "incomplete" }
            ]
        }));
        ctx.current_node_id = Some("chk".to_string());
        ctx
    }

    fn handler(client: std::sync::Arc<ScriptedClient>) -> CompletionCheckNodeHandler {
        CompletionCheckNodeHandler::new(
            CompletionClients::new().with(AssistantKind::OpenClaw, client),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_empty_variable_short_circuits() {
        let client = ScriptedClient::replying(&["COMPLETED"]);
        let h = handler(client.clone());
        let mut ctx = ctx();
        ctx.set("report", json!("  "));
        let data: NodeData = serde_json::from_value(json!({ "checkVar": "report" })).unwrap();

        let result = h.execute(&data, &mut ctx).await;
        assert!(result.success);
        assert_eq!(result.output, json!("INCOMPLETE"));
        assert_eq!(result.next_node_id.as_deref(), Some("no"));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_classifies_reply_and_records_variables() {
        let client = ScriptedClient::replying(&[" completed ", "incomplete"]);
        let h = handler(client.clone());
        let mut ctx = ctx();
        ctx.set("report", json!("shipped the release"));
        let data: NodeData =
            serde_json::from_value(json!({ "checkVar": "report", "outputVar": "status" })).unwrap();

        let result = h.execute(&data, &mut ctx).await;
        assert_eq!(result.next_node_id.as_deref(), Some("yes"));
        assert_eq!(ctx.get("status"), Some(&json!("COMPLETED")));
        assert_eq!(ctx.get("report_check_result"), Some(&json!("COMPLETED")));
        assert_eq!(ctx.get("report_check_raw"), Some(&json!("COMPLETED")));

        let result = h.execute(&data, &mut ctx).await;
        assert_eq!(result.next_node_id.as_deref(), Some("no"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_negated_reply_is_incomplete() {
        let client = ScriptedClient::replying(&["未完成", "任务已完成", "Not done yet"]);
        let h = handler(client.clone());
        let mut ctx = ctx();
        ctx.set("report", json!("还在处理"));
        let data: NodeData = serde_json::from_value(json!({ "checkVar": "report" })).unwrap();

        let result = h.execute(&data, &mut ctx).await;
        assert_eq!(result.output, json!("INCOMPLETE"));
        assert_eq!(result.next_node_id.as_deref(), Some("no"));

        let result = h.execute(&data, &mut ctx).await;
        assert_eq!(result.output, json!("COMPLETED"));

        let result = h.execute(&data, &mut ctx).await;
        assert_eq!(result.output, json!("INCOMPLETE"));
    }

    #[test]
    fn test_is_completed_markers() {
        assert!(is_completed("COMPLETED."));
        assert!(is_completed("DONE"));
        assert!(!is_completed("INCOMPLETE"));
        assert!(!is_completed("没有完成"));
        assert!(!is_completed("IN PROGRESS"));
    }
}
