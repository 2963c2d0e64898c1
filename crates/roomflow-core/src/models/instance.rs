use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::template::FlowchartTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "PAUSED" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` respects the instance state machine.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

/// One execution of a specific template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowchartInstance {
    pub instance_id: String,
    pub template_id: String,
    pub template_version: i64,
    pub template_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    /// Working memory. Holds only caller overrides until the run starts,
    /// then the full variable scope after every step.
    pub variables: HashMap<String, Value>,
    pub node_executions: Vec<NodeExecution>,
    pub outputs: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_queue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowchartInstance {
    pub fn node_execution(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.iter().rev().find(|e| e.node_id == node_id)
    }

    pub fn latest_node_execution(&self) -> Option<&NodeExecution> {
        self.node_executions.last()
    }

    /// Percentage (0-100) of template nodes that have completed at least once.
    pub fn progress(&self, template: &FlowchartTemplate) -> u8 {
        let total = template.definition.nodes.len();
        if total == 0 {
            return 0;
        }
        let done = template
            .definition
            .nodes
            .iter()
            .filter(|n| {
                self.node_executions
                    .iter()
                    .any(|e| e.node_id == n.id && e.status == ExecutionStatus::Completed)
            })
            .count();
        ((done * 100) / total) as u8
    }

    /// Stamp `completed_at` and derive `duration_ms` from `started_at`.
    pub fn stamp_completion(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }
}

/// Audit record for one executed step. Closed once `completed_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub node_id: String,
    pub node_type: String,
    pub node_label: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_snapshot: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl NodeExecution {
    pub fn open(node_id: &str, node_type: &str, node_label: &str, input_snapshot: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            node_label: node_label.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            input_snapshot: Some(input_snapshot),
            output_snapshot: None,
            logs: Vec::new(),
            error: None,
            retry_count: 0,
            result: None,
        }
    }

    pub fn close(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }

    pub fn is_closed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Input for creating a new instance of the latest version of a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceInput {
    pub template_id: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub triggered_by_message_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Paused,
        ] {
            assert_eq!(ExecutionStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(ExecutionStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_states_never_move() {
        use ExecutionStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled, Paused] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Paused.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_node_execution_close_sets_duration() {
        let mut exec = NodeExecution::open("n1", "start", "Start", "{}".to_string());
        assert!(!exec.is_closed());
        exec.close(ExecutionStatus::Completed);
        assert!(exec.is_closed());
        assert!(exec.duration_ms.unwrap_or(-1) >= 0);
    }
}
