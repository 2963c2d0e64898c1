use async_trait::async_trait;

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::{coerce_scalar, render};
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::template::{non_empty, NodeData};

pub struct VariableNodeHandler;

#[async_trait]
impl NodeHandler for VariableNodeHandler {
    fn node_type(&self) -> &'static str {
        "variable"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let Some(name) = non_empty(data.var_name.as_deref()) else {
            return NodeResult::failure("Variable node requires varName");
        };
        let rendered = render(data.var_value.as_deref().unwrap_or_default(), ctx.variables());
        let value = coerce_scalar(&rendered);
        tracing::info!(
            "[Flowchart:{}] Set variable {} = {}",
            ctx.instance_id(),
            name,
            value
        );
        ctx.set(name, value.clone());
        NodeResult::success(value)
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        match non_empty(data.var_name.as_deref()) {
            Some(_) => ValidationResult::valid(),
            None => ValidationResult::invalid("varName must not be empty"),
        }
    }

    fn description(&self) -> &'static str {
        "Assign a rendered value to a variable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::context::tests::context_for;
    use serde_json::json;

    #[tokio::test]
    async fn test_assigns_coerced_value() {
        let mut ctx = context_for(json!({ "nodes": [], "edges": [] }));
        ctx.set("base", json!(2));
        for (raw, expected) in [("{{base}}0", json!(20)), ("1.5", json!(1.5)), ("n={{base}}", json!("n=2"))] {
            let data: NodeData =
                serde_json::from_value(json!({ "varName": "x", "varValue": raw })).unwrap();
            let result = VariableNodeHandler.execute(&data, &mut ctx).await;
            assert!(result.success);
            assert_eq!(ctx.get("x"), Some(&expected));
        }
    }

    #[tokio::test]
    async fn test_missing_name_fails() {
        let mut ctx = context_for(json!({ "nodes": [], "edges": [] }));
        let result = VariableNodeHandler.execute(&NodeData::default(), &mut ctx).await;
        assert!(!result.success);
        assert!(!VariableNodeHandler.validate(&NodeData::default()).valid);
    }
}
