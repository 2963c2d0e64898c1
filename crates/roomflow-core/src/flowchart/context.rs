//! Live state of one instance run: the variable scope, graph lookups and
//! debug controls. Owned by the run's worker task; no interior locking.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::EngineError;
use crate::models::instance::FlowchartInstance;
use crate::models::template::{Edge, FlowchartTemplate, Node};

pub struct ExecutionContext {
    instance: FlowchartInstance,
    template: Arc<FlowchartTemplate>,
    variables: HashMap<String, Value>,
    call_stack: Vec<String>,
    breakpoints: HashSet<String>,
    paused: bool,
    interrupt: Arc<AtomicBool>,
    pub current_node_id: Option<String>,
}

impl ExecutionContext {
    /// Build the run scope. Template defaults fill in first, then the
    /// instance's own variables override them.
    pub fn from_instance(instance: FlowchartInstance, template: Arc<FlowchartTemplate>) -> Self {
        let mut variables = HashMap::new();
        for def in &template.variables {
            if let Some(default) = &def.default_value {
                variables.insert(def.name.clone(), default.clone());
            }
        }
        for (k, v) in &instance.variables {
            variables.insert(k.clone(), v.clone());
        }
        let current_node_id = instance.current_node_id.clone();
        Self {
            instance,
            template,
            variables,
            call_stack: Vec::new(),
            breakpoints: HashSet::new(),
            paused: false,
            interrupt: Arc::new(AtomicBool::new(false)),
            current_node_id,
        }
    }

    pub fn instance(&self) -> &FlowchartInstance {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut FlowchartInstance {
        &mut self.instance
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn template(&self) -> &FlowchartTemplate {
        &self.template
    }

    // ── Variables ───────────────────────────────────────────────────────

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.variables.get(name).cloned().unwrap_or(default)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn has(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Copy the working scope onto the instance so it is persisted.
    pub fn commit_variables(&mut self) {
        self.instance.variables = self.variables.clone();
    }

    // ── Graph lookups ───────────────────────────────────────────────────

    pub fn find_node(&self, node_id: &str) -> Option<&Node> {
        self.template.definition.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn find_start_node(&self) -> Option<&Node> {
        self.template
            .definition
            .nodes
            .iter()
            .find(|n| n.node_type == "start")
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.template
            .definition
            .edges
            .iter()
            .filter(|e| e.source == node_id)
            .collect()
    }

    /// First outgoing edge of `node_id` whose `sourceHandle` is `handle`.
    pub fn find_edge_by_handle(&self, node_id: &str, handle: &str) -> Option<&Edge> {
        self.outgoing_edges(node_id)
            .into_iter()
            .find(|e| e.source_handle.as_deref() == Some(handle))
    }

    pub fn find_edge_by_condition(&self, node_id: &str, condition: bool) -> Option<&Edge> {
        self.find_edge_by_handle(node_id, if condition { "true" } else { "false" })
    }

    /// The single outgoing edge without a branch label. More than one such
    /// edge makes the continuation ambiguous and is rejected.
    pub fn find_default_edge(&self, node_id: &str) -> Result<Option<&Edge>, EngineError> {
        let mut defaults = self
            .outgoing_edges(node_id)
            .into_iter()
            .filter(|e| e.is_default());
        let first = defaults.next();
        if defaults.next().is_some() {
            return Err(EngineError::IllegalState(format!(
                "Node '{}' has more than one unlabeled outgoing edge",
                node_id
            )));
        }
        Ok(first)
    }

    // ── Debug controls ──────────────────────────────────────────────────

    pub fn add_breakpoint(&mut self, node_id: impl Into<String>) {
        self.breakpoints.insert(node_id.into());
    }

    pub fn remove_breakpoint(&mut self, node_id: &str) -> bool {
        self.breakpoints.remove(node_id)
    }

    pub fn has_breakpoint(&self, node_id: &str) -> bool {
        self.breakpoints.contains(node_id)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Share the run's stop flag so blocking work can poll it.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = flag;
    }

    /// Raised when the run is stopped while a step is in flight.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn push_call(&mut self, node_id: impl Into<String>) {
        self.call_stack.push(node_id.into());
    }

    pub fn pop_call(&mut self) -> Option<String> {
        self.call_stack.pop()
    }

    pub fn call_stack(&self) -> &[String] {
        &self.call_stack
    }
}
