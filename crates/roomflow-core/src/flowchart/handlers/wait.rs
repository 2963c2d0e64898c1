use async_trait::async_trait;
use std::time::Duration;

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::template::NodeData;

const MAX_WAIT_SECONDS: i64 = 3600;

/// Sleeps for `waitSeconds` (default 1, clamped to 1..=3600). A stop request
/// drops the sleep; the engine records that as a failed step.
pub struct WaitNodeHandler;

#[async_trait]
impl NodeHandler for WaitNodeHandler {
    fn node_type(&self) -> &'static str {
        "wait"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let seconds = data.wait_seconds.unwrap_or(1).clamp(1, MAX_WAIT_SECONDS);
        tracing::info!("[Flowchart:{}] Waiting for {} seconds", ctx.instance_id(), seconds);
        tokio::time::sleep(Duration::from_secs(seconds as u64)).await;
        tracing::info!("[Flowchart:{}] Wait completed", ctx.instance_id());
        NodeResult::success(seconds)
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        match data.wait_seconds {
            Some(s) if s <= 0 => ValidationResult::invalid("waitSeconds must be greater than 0"),
            Some(s) if s > MAX_WAIT_SECONDS => {
                ValidationResult::invalid("waitSeconds must not exceed 3600")
            }
            _ => ValidationResult::valid(),
        }
    }

    fn description(&self) -> &'static str {
        "Delay for a number of seconds"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::context::tests::context_for;
    use serde_json::json;

    #[tokio::test]
    async fn test_wait_clamps_to_minimum() {
        let mut ctx = context_for(json!({ "nodes": [], "edges": [] }));
        let data: NodeData = serde_json::from_value(json!({ "waitSeconds": -5 })).unwrap();
        let started = std::time::Instant::now();
        let result = WaitNodeHandler.execute(&data, &mut ctx).await;
        assert!(result.success);
        assert_eq!(result.output, json!(1));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_validate_bounds() {
        let v = |s: i64| WaitNodeHandler.validate(&serde_json::from_value(json!({ "waitSeconds": s })).unwrap());
        assert!(!v(0).valid);
        assert!(v(30).valid);
        assert!(!v(3601).valid);
    }
}
