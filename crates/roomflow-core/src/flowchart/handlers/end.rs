use async_trait::async_trait;
use serde_json::Value;

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::render;
use crate::flowchart::result::NodeResult;
use crate::models::template::NodeData;

/// Terminal step. The final output is `outputVar`'s value when set,
/// otherwise the rendered label.
pub struct EndNodeHandler;

#[async_trait]
impl NodeHandler for EndNodeHandler {
    fn node_type(&self) -> &'static str {
        "end"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let mut output = data
            .output_var()
            .and_then(|name| ctx.get(name).cloned())
            .filter(|v| !v.is_null());
        if output.is_none() {
            output = data
                .label
                .as_deref()
                .map(|label| Value::String(render(label, ctx.variables())));
        }

        let instance = ctx.instance_mut();
        instance.stamp_completion();
        tracing::info!(
            "[Flowchart:{}] Reached end node, completed in {}ms",
            instance.instance_id,
            instance.duration_ms.unwrap_or(0)
        );

        NodeResult::success(output.unwrap_or(Value::Null)).halt()
    }

    fn description(&self) -> &'static str {
        "Flow exit point; resolves the final output"
    }
}
