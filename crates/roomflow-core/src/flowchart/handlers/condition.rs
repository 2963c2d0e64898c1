use async_trait::async_trait;
use serde_json::Value;

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::expr;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::render::value_to_string;
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::template::{non_empty, NodeData, SwitchBranch};

/// Branching step with three modes:
/// - `boolean` (default): evaluate `conditionExpr`, follow handle `true`/`false`.
/// - `switch`: first matching entry `i` of `branches` follows `branch_<i>`.
/// - `range`: first range containing `rangeVar` follows its `handleId`.
pub struct ConditionNodeHandler;

impl ConditionNodeHandler {
    fn next_by_handle(ctx: &ExecutionContext, handle: &str) -> Option<String> {
        let node_id = ctx.current_node_id.as_deref()?;
        ctx.find_edge_by_handle(node_id, handle).map(|e| e.target.clone())
    }

    fn boolean_mode(data: &NodeData, ctx: &ExecutionContext) -> NodeResult {
        let Some(source) = non_empty(data.condition_expr.as_deref()) else {
            return NodeResult::failure("Condition expression must not be empty");
        };
        match expr::evaluate_condition(source, ctx.variables()) {
            Ok(outcome) => {
                tracing::info!(
                    "[Flowchart:{}] Condition evaluated: {} = {}",
                    ctx.instance_id(),
                    source,
                    outcome
                );
                let handle = if outcome { "true" } else { "false" };
                NodeResult::success(outcome).with_next(Self::next_by_handle(ctx, handle))
            }
            Err(e) => {
                tracing::warn!(
                    "[Flowchart:{}] Failed to evaluate condition '{}': {}",
                    ctx.instance_id(),
                    source,
                    e
                );
                NodeResult::failure(format!("Condition evaluation failed: {}", e))
            }
        }
    }

    fn switch_mode(data: &NodeData, ctx: &ExecutionContext) -> NodeResult {
        let Some(var) = non_empty(data.switch_var.as_deref()) else {
            return NodeResult::failure("Switch variable must not be empty");
        };
        let branches = match data.branches.as_deref() {
            Some(b) if !b.is_empty() => b,
            _ => return NodeResult::failure("Branch list must not be empty"),
        };
        let value = ctx.get(var).cloned().unwrap_or(Value::Null);
        for (i, branch) in branches.iter().enumerate() {
            if matches_branch(&value, branch) {
                tracing::info!(
                    "[Flowchart:{}] Branch {} matched: {} {} {}",
                    ctx.instance_id(),
                    i,
                    value,
                    branch.operator,
                    branch.value
                );
                return NodeResult::success(i as u64)
                    .with_next(Self::next_by_handle(ctx, &format!("branch_{}", i)));
            }
        }
        NodeResult::failure(format!("No branch matched {} = {}", var, value))
    }

    fn range_mode(data: &NodeData, ctx: &ExecutionContext) -> NodeResult {
        let Some(var) = non_empty(data.range_var.as_deref()) else {
            return NodeResult::failure("Range variable must not be empty");
        };
        let value = ctx.get(var).cloned().unwrap_or(Value::Null);
        let Ok(number) = value_to_string(&value).trim().parse::<f64>() else {
            return NodeResult::failure(format!("Range variable {} is not numeric: {}", var, value));
        };
        let branches = data.range_branches.as_deref().unwrap_or_default();
        let matched = branches
            .iter()
            .enumerate()
            .find(|(_, b)| b.contains(number))
            .map(|(i, b)| {
                b.handle_id
                    .clone()
                    .unwrap_or_else(|| format!("range_{}", i))
            });
        let handle = match matched.or_else(|| data.range_default_branch.clone()) {
            Some(h) => h,
            None => return NodeResult::failure(format!("No range matched {} = {}", var, number)),
        };
        tracing::info!(
            "[Flowchart:{}] Range {} = {} -> {}",
            ctx.instance_id(),
            var,
            number,
            handle
        );
        let next = Self::next_by_handle(ctx, &handle);
        NodeResult::success(handle).with_next(next)
    }
}

fn matches_branch(value: &Value, branch: &SwitchBranch) -> bool {
    if value.is_null() {
        return false;
    }
    let text = value_to_string(value);
    let expected = branch.value.as_str();
    match branch.operator.as_str() {
        "eq" => text == expected,
        "ne" => text != expected,
        "gt" => compare(&text, expected).is_gt(),
        "gte" => compare(&text, expected).is_ge(),
        "lt" => compare(&text, expected).is_lt(),
        "lte" => compare(&text, expected).is_le(),
        "contains" => text.contains(expected),
        "regex" => regex::Regex::new(&format!("^(?:{})$", expected))
            .map(|re| re.is_match(&text))
            .unwrap_or(false),
        _ => false,
    }
}

/// Numeric when both sides parse, lexical otherwise.
fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[async_trait]
impl NodeHandler for ConditionNodeHandler {
    fn node_type(&self) -> &'static str {
        "condition"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        match data.condition_mode.as_deref() {
            None | Some("boolean") => Self::boolean_mode(data, ctx),
            Some("range") => Self::range_mode(data, ctx),
            Some(_) => Self::switch_mode(data, ctx),
        }
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        match data.condition_mode.as_deref() {
            None | Some("boolean") => {
                let Some(source) = non_empty(data.condition_expr.as_deref()) else {
                    return ValidationResult::invalid("conditionExpr must not be empty");
                };
                match expr::check_syntax(source) {
                    Ok(_) => ValidationResult::valid(),
                    Err(e) => ValidationResult::invalid(format!("conditionExpr: {}", e)),
                }
            }
            Some("range") => {
                if non_empty(data.range_var.as_deref()).is_none() {
                    ValidationResult::invalid("rangeVar must not be empty")
                } else if data.range_branches.as_ref().map_or(true, |b| b.is_empty()) {
                    ValidationResult::invalid("rangeBranches must not be empty")
                } else {
                    ValidationResult::valid()
                }
            }
            Some(_) => {
                if non_empty(data.switch_var.as_deref()).is_none() {
                    ValidationResult::invalid("switchVar must not be empty")
                } else if data.branches.as_ref().map_or(true, |b| b.is_empty()) {
                    ValidationResult::invalid("branches must not be empty")
                } else {
                    ValidationResult::valid()
                }
            }
        }
    }

    fn description(&self) -> &'static str {
        "Conditional branch: boolean expression, switch or numeric range"
    }
}
