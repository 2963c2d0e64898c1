use async_trait::async_trait;

use super::TaskQueue;
use crate::error::EngineError;
use crate::models::task::{QueuedTask, TaskType};

/// What the queue should do once `process` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The task is finished; the queue marks it COMPLETED and releases the
    /// partition.
    Done,
    /// Work continues in the background. The processor must later call
    /// `mark_task_completed`/`mark_task_failed` and then `on_task_complete`.
    Deferred,
}

/// Executes tasks of one `TaskType`. An `Err` return marks the task FAILED
/// and releases the partition.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn process(&self, task: QueuedTask, queue: TaskQueue) -> Result<Disposition, EngineError>;
}
