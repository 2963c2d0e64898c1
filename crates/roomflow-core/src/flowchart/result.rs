use serde::Serialize;
use serde_json::Value;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub should_continue: bool,
    /// Explicit successor, overriding the default edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    pub logs: Vec<String>,
}

impl NodeResult {
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            should_continue: true,
            next_node_id: None,
            logs: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            should_continue: false,
            next_node_id: None,
            logs: Vec::new(),
        }
    }

    pub fn with_next(mut self, next_node_id: Option<String>) -> Self {
        self.next_node_id = next_node_id;
        self
    }

    pub fn halt(mut self) -> Self {
        self.should_continue = false;
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn full_log(&self) -> String {
        self.logs.join("\n")
    }
}

/// Authoring-time verdict on a node's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}
