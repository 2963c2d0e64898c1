use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One immutable version of a flowchart template.
///
/// `id` is the row id of this particular version; `template_id` is the
/// stable business id shared by every version in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowchartTemplate {
    #[serde(default)]
    pub id: i64,
    pub template_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_version_id: Option<i64>,
    pub is_latest: bool,
    pub definition: FlowchartDefinition,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub allowed_room_ids: Vec<String>,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowchartTemplate {
    /// Whether the template may be used in the given room.
    pub fn is_visible_in(&self, room_id: &str) -> bool {
        self.is_public || self.allowed_room_ids.iter().any(|r| r == room_id)
    }
}

/// The graph of a template. Unknown editor fields (viewport and the like)
/// are kept in `extra` so a definition round-trips unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowchartDefinition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub data: NodeData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    /// Display label, falling back to the node id.
    pub fn label(&self) -> &str {
        self.data.label.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    /// An edge without a branch label is the node's default continuation.
    pub fn is_default(&self) -> bool {
        self.source_handle.is_none()
    }
}

/// Type-specific node configuration. Each handler reads the fields it
/// needs and ignores the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // llm / openclaw
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    // condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<SwitchBranch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_branches: Option<Vec<RangeBranch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_default_branch: Option<String>,

    // code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    // completion_check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_prompt: Option<String>,

    // wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<i64>,

    // variable / start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_value: Option<String>,

    // shared
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NodeData {
    fn default() -> Self {
        Self {
            label: None,
            description: None,
            system_prompt: None,
            user_prompt: None,
            model: None,
            temperature: None,
            max_tokens: None,
            condition_expr: None,
            condition_mode: None,
            switch_var: None,
            branches: None,
            range_var: None,
            range_branches: None,
            range_default_branch: None,
            code: None,
            language: None,
            check_var: None,
            check_prompt: None,
            wait_seconds: None,
            var_name: None,
            var_value: None,
            stop_on_error: true,
            output_var: None,
            on_error: None,
            retry_count: None,
            extra: Map::new(),
        }
    }
}

impl NodeData {
    /// Error policy for this node. `stopOnError = false` behaves like `continue`.
    pub fn error_policy(&self) -> ErrorPolicy {
        match self.on_error.as_deref() {
            Some("retry") => ErrorPolicy::Retry(self.retry_count.unwrap_or(0)),
            Some("continue") => ErrorPolicy::Continue,
            _ if !self.stop_on_error => ErrorPolicy::Continue,
            _ => ErrorPolicy::Stop,
        }
    }

    /// Non-empty `outputVar`, if any.
    pub fn output_var(&self) -> Option<&str> {
        non_empty(self.output_var.as_deref())
    }
}

pub(crate) fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.trim().is_empty())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Stop,
    Continue,
    /// Re-run the node up to this many extra times before giving up.
    Retry(u32),
}

/// One arm of a switch-mode condition node. Selected arm `i` follows the
/// edge whose `sourceHandle` is `branch_<i>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchBranch {
    pub operator: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default = "default_true")]
    pub min_inclusive: bool,
    #[serde(default = "default_true")]
    pub max_inclusive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,
}

impl RangeBranch {
    pub fn contains(&self, value: f64) -> bool {
        let above_min = match self.min {
            Some(min) if self.min_inclusive => value >= min,
            Some(min) => value > min,
            None => true,
        };
        let below_max = match self.max {
            Some(max) if self.max_inclusive => value <= max,
            Some(max) => value < max,
            None => true,
        };
        above_min && below_max
    }
}

/// A declared template variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    pub name: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn default_var_type() -> String {
    "string".to_string()
}

/// Input for creating the first version of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateInput {
    /// Optional caller-chosen id; a fresh one is generated when absent.
    #[serde(default)]
    pub template_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub definition: FlowchartDefinition,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub allowed_room_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Input for publishing a new version. Omitted fields inherit from the
/// current latest version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplateInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub icon: Option<String>,
    pub definition: Option<FlowchartDefinition>,
    pub variables: Option<Vec<VariableDef>>,
    pub allowed_room_ids: Option<Vec<String>>,
    pub is_public: Option<bool>,
    pub updated_by: Option<String>,
}
