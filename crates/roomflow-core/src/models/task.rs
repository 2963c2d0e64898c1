use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The backing assistant a task (or an assistant-call step) talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssistantKind {
    #[serde(rename = "OPENCLAW")]
    OpenClaw,
    Kimi,
    Claude,
}

impl AssistantKind {
    pub const ALL: [AssistantKind; 3] = [Self::OpenClaw, Self::Kimi, Self::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenClaw => "OPENCLAW",
            Self::Kimi => "KIMI",
            Self::Claude => "CLAUDE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OPENCLAW" => Some(Self::OpenClaw),
            "KIMI" => Some(Self::Kimi),
            "CLAUDE" => Some(Self::Claude),
            _ => None,
        }
    }
}

impl fmt::Display for AssistantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Chat,
    Flowchart,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::Flowchart => "FLOWCHART",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CHAT" => Some(Self::Chat),
            "FLOWCHART" => Some(Self::Flowchart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// The queue's unit of mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub room_id: String,
    pub assistant: AssistantKind,
}

impl PartitionKey {
    pub fn new(room_id: impl Into<String>, assistant: AssistantKind) -> Self {
        Self {
            room_id: room_id.into(),
            assistant,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.assistant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// One durable unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub task_id: String,
    pub room_id: String,
    pub assistant_type: AssistantKind,
    pub task_type: TaskType,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flowchart_instance_id: Option<String>,
    pub status: TaskStatus,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.room_id.clone(), self.assistant_type)
    }
}

/// Input for enqueueing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueTaskInput {
    pub room_id: String,
    pub assistant_type: AssistantKind,
    #[serde(default = "default_task_type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub source_message_id: Option<String>,
    #[serde(default)]
    pub flowchart_instance_id: Option<String>,
}

fn default_task_type() -> TaskType {
    TaskType::Chat
}

impl EnqueueTaskInput {
    /// A plain chat request for the given partition.
    pub fn chat(room_id: impl Into<String>, assistant: AssistantKind, content: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            assistant_type: assistant,
            task_type: TaskType::Chat,
            content: content.into(),
            attachments: Vec::new(),
            user_info: None,
            source_message_id: None,
            flowchart_instance_id: None,
        }
    }
}
