//! Node handler contract and the type-tag registry the engine dispatches through.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::ExecutionContext;
use super::handlers::{self, HandlerSettings};
use super::result::{NodeResult, ValidationResult};
use crate::completion::CompletionClients;
use crate::error::EngineError;
use crate::models::template::NodeData;

/// One step type. Handlers are stateless; everything a run needs lives in
/// the `ExecutionContext`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Tag matched against `Node::node_type`.
    fn node_type(&self) -> &'static str;

    /// Expected failures come back as `NodeResult::failure`, never as panics.
    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult;

    /// Authoring-time configuration check.
    fn validate(&self, _data: &NodeData) -> ValidationResult {
        ValidationResult::valid()
    }

    fn description(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    pub node_type: String,
    pub description: String,
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in step type.
    pub fn with_builtins(clients: CompletionClients, settings: HandlerSettings) -> Self {
        let mut registry = Self::new();
        for handler in handlers::builtin_handlers(clients, settings) {
            if let Err(e) = registry.register(handler) {
                tracing::warn!("[HandlerRegistry] Skipping built-in handler: {}", e);
            }
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Result<(), EngineError> {
        let tag = handler.node_type();
        if self.handlers.contains_key(tag) {
            return Err(EngineError::Handler(format!(
                "Handler for node type '{}' is already registered",
                tag
            )));
        }
        tracing::debug!("[HandlerRegistry] Registered node handler: {}", tag);
        self.handlers.insert(tag.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeHandler>, EngineError> {
        self.handlers.get(node_type).cloned().ok_or_else(|| {
            EngineError::Handler(format!(
                "Unknown node type '{}'. Available: {}",
                node_type,
                self.node_types().join(", ")
            ))
        })
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    pub fn node_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn describe(&self) -> Vec<HandlerInfo> {
        self.handlers
            .values()
            .map(|h| HandlerInfo {
                node_type: h.node_type().to_string(),
                description: h.description().to_string(),
            })
            .collect()
    }
}
