use std::collections::{HashMap, HashSet};

use super::registry::HandlerRegistry;
use crate::error::EngineError;
use crate::models::template::FlowchartDefinition;

/// Authoring-time checks on a template graph. Collects every problem and
/// reports them together as one `Validation` error.
pub fn validate_definition(
    definition: &FlowchartDefinition,
    registry: &HandlerRegistry,
) -> Result<(), EngineError> {
    let mut problems = Vec::new();

    let starts = definition
        .nodes
        .iter()
        .filter(|n| n.node_type == "start")
        .count();
    if starts != 1 {
        problems.push(format!("expected exactly one start node, found {}", starts));
    }

    let mut ids = HashSet::new();
    for node in &definition.nodes {
        if !ids.insert(node.id.as_str()) {
            problems.push(format!("duplicate node id '{}'", node.id));
        }
        match registry.get(&node.node_type) {
            Ok(handler) => {
                let verdict = handler.validate(&node.data);
                if !verdict.valid {
                    problems.push(format!(
                        "node '{}' ({}): {}",
                        node.id,
                        node.node_type,
                        verdict.message.unwrap_or_else(|| "invalid configuration".to_string())
                    ));
                }
            }
            Err(_) => problems.push(format!(
                "node '{}' has unknown type '{}'",
                node.id, node.node_type
            )),
        }
    }

    let mut unlabeled: HashMap<&str, usize> = HashMap::new();
    for edge in &definition.edges {
        if !ids.contains(edge.source.as_str()) {
            problems.push(format!("edge '{}' has unknown source '{}'", edge.id, edge.source));
        }
        if !ids.contains(edge.target.as_str()) {
            problems.push(format!("edge '{}' has unknown target '{}'", edge.id, edge.target));
        }
        if edge.is_default() {
            *unlabeled.entry(edge.source.as_str()).or_default() += 1;
        }
    }
    let mut ambiguous: Vec<_> = unlabeled
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(source, _)| source)
        .collect();
    ambiguous.sort_unstable();
    for source in ambiguous {
        problems.push(format!(
            "node '{}' has more than one unlabeled outgoing edge",
            source
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionClients;
    use crate::flowchart::handlers::HandlerSettings;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::with_builtins(CompletionClients::new(), HandlerSettings::default())
    }

    fn def(v: serde_json::Value) -> FlowchartDefinition {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_valid_graph_passes() {
        let d = def(json!({
            "nodes": [
                { "id": "s", "type": "start" },
                { "id": "v", "type": "variable", "data": { "varName": "x", "varValue": "5" } },
                { "id": "e", "type": "end" }
            ],
            "edges": [
                { "id": "1", "source": "s", "target": "v" },
                { "id": "2", "source": "v", "target": "e" }
            ]
        }));
        validate_definition(&d, &registry()).unwrap();
    }

    #[test]
    fn test_reports_every_problem() {
        let d = def(json!({
            "nodes": [
                { "id": "s", "type": "start" },
                { "id": "x", "type": "mystery" },
                { "id": "v", "type": "variable", "data": {} },
                { "id": "a", "type": "end" },
                { "id": "b", "type": "end" }
            ],
            "edges": [
                { "id": "1", "source": "s", "target": "a" },
                { "id": "2", "source": "s", "target": "b" },
                { "id": "3", "source": "a", "target": "ghost" }
            ]
        }));
        let msg = validate_definition(&d, &registry()).unwrap_err().to_string();
        assert!(msg.contains("unknown type 'mystery'"));
        assert!(msg.contains("node 'v' (variable)"));
        assert!(msg.contains("unknown target 'ghost'"));
        assert!(msg.contains("node 's' has more than one unlabeled outgoing edge"));
    }

    #[test]
    fn test_requires_single_start() {
        let d = def(json!({ "nodes": [{ "id": "e", "type": "end" }], "edges": [] }));
        let msg = validate_definition(&d, &registry()).unwrap_err().to_string();
        assert!(msg.contains("exactly one start node, found 0"));
    }
}
