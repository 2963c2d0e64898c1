use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::render;
use crate::flowchart::result::NodeResult;
use crate::models::template::NodeData;

/// Entry step. Seeds the reserved `__*` variables.
pub struct StartNodeHandler;

#[async_trait]
impl NodeHandler for StartNodeHandler {
    fn node_type(&self) -> &'static str {
        "start"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        tracing::info!("[Flowchart:{}] Starting execution from start node", ctx.instance_id());

        let instance = ctx.instance();
        let instance_id = instance.instance_id.clone();
        let template_id = instance.template_id.clone();
        let room_id = instance.room_id.clone().map(Value::String).unwrap_or(Value::Null);
        ctx.set("__instanceId", Value::String(instance_id));
        ctx.set("__templateId", Value::String(template_id));
        ctx.set("__roomId", room_id);
        ctx.set("__startedAt", Value::from(Utc::now().timestamp_millis()));

        if let (Some(name), Some(value)) = (data.var_name.as_deref(), data.var_value.as_deref()) {
            let rendered = render(value, ctx.variables());
            ctx.set(name, Value::String(rendered));
        }

        NodeResult::success("Started")
    }

    fn description(&self) -> &'static str {
        "Flow entry point; initializes the execution scope"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::context::tests::context_for;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_seeds_reserved_variables() {
        let mut ctx = context_for(json!({ "nodes": [{ "id": "s", "type": "start" }], "edges": [] }));
        ctx.set("who", json!("Ada"));
        let data: NodeData =
            serde_json::from_value(json!({ "varName": "greeting", "varValue": "hi {{who}}" })).unwrap();
        let result = StartNodeHandler.execute(&data, &mut ctx).await;

        assert!(result.success);
        assert_eq!(result.output, json!("Started"));
        assert_eq!(ctx.get("__instanceId"), Some(&json!("inst-1")));
        assert_eq!(ctx.get("__templateId"), Some(&json!("tpl")));
        assert_eq!(ctx.get("__roomId"), Some(&json!("room-1")));
        assert!(ctx.get("__startedAt").and_then(|v| v.as_i64()).is_some());
        assert_eq!(ctx.get("greeting"), Some(&json!("hi Ada")));
    }
}
