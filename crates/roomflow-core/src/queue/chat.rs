use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::processor::{Disposition, TaskProcessor};
use super::TaskQueue;
use crate::completion::{CompletionClients, CompletionRequest};
use crate::error::EngineError;
use crate::models::task::{AssistantKind, QueuedTask, TaskType};

/// An assistant's answer to a queued chat task.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub task_id: String,
    pub room_id: String,
    pub assistant: AssistantKind,
    pub source_message_id: Option<String>,
    pub content: String,
}

/// Sends CHAT tasks to the assistant of their partition. Replies go to the
/// optional channel; delivering them to the room is up to the receiver.
pub struct ChatTaskProcessor {
    clients: CompletionClients,
    timeout: Duration,
    replies: Option<mpsc::UnboundedSender<ChatReply>>,
}

impl ChatTaskProcessor {
    pub fn new(clients: CompletionClients, timeout: Duration) -> Self {
        Self {
            clients,
            timeout,
            replies: None,
        }
    }

    pub fn with_replies(mut self, replies: mpsc::UnboundedSender<ChatReply>) -> Self {
        self.replies = Some(replies);
        self
    }
}

#[async_trait]
impl TaskProcessor for ChatTaskProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::Chat
    }

    async fn process(&self, task: QueuedTask, _queue: TaskQueue) -> Result<Disposition, EngineError> {
        let mut request = CompletionRequest::new(task.room_id.clone(), task.content.clone(), self.timeout);
        if let Some(user) = &task.user_info {
            request.user_id = user.user_id.clone();
            request.user_name = user.user_name.clone();
        }

        let response = self
            .clients
            .complete(task.assistant_type, request)
            .await
            .map_err(|e| EngineError::Completion(e.to_string()))?;
        tracing::info!(
            "[TaskQueue] {} answered task {} ({} chars)",
            task.assistant_type,
            task.task_id,
            response.content.chars().count()
        );

        if let Some(replies) = &self.replies {
            let _ = replies.send(ChatReply {
                task_id: task.task_id,
                room_id: task.room_id,
                assistant: task.assistant_type,
                source_message_id: task.source_message_id,
                content: response.content,
            });
        }
        Ok(Disposition::Done)
    }
}
