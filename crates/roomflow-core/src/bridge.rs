//! Glue between the task queue and the flowchart engine.
//!
//! FLOWCHART tasks hold an instance id. Dispatching one starts (or resumes)
//! the instance with a per-run listener; the listener turns the run's
//! terminal event into a task outcome and releases the partition.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::flowchart::{FlowchartEngine, FlowchartEvent, RunOptions};
use crate::models::instance::{CreateInstanceInput, ExecutionStatus};
use crate::models::task::{AssistantKind, EnqueueTaskInput, PartitionKey, QueuedTask, TaskType, UserInfo};
use crate::queue::{Disposition, TaskProcessor, TaskQueue};
use crate::store::InstanceStore;

/// Runs FLOWCHART tasks through the engine.
pub struct FlowchartTaskProcessor {
    engine: FlowchartEngine,
    instances: InstanceStore,
}

impl FlowchartTaskProcessor {
    pub fn new(engine: FlowchartEngine, instances: InstanceStore) -> Self {
        Self { engine, instances }
    }
}

#[async_trait]
impl TaskProcessor for FlowchartTaskProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::Flowchart
    }

    async fn process(&self, task: QueuedTask, queue: TaskQueue) -> Result<Disposition, EngineError> {
        let instance_id = task.flowchart_instance_id.clone().ok_or_else(|| {
            EngineError::Validation(format!("Task {} has no flowchart instance", task.task_id))
        })?;
        let mut instance = self
            .instances
            .get(&instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Instance not found: {}", instance_id)))?;

        // A task replayed after a restart may point at an instance that
        // already finished.
        match instance.status {
            ExecutionStatus::Completed => return Ok(Disposition::Done),
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                return Err(EngineError::IllegalState(format!(
                    "Instance {} already ended as {}",
                    instance_id,
                    instance.status.as_str()
                )))
            }
            _ => {}
        }

        instance.task_queue_id = Some(task.task_id.clone());
        self.instances.save(&instance).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let options = RunOptions::with_listener(tx);
        if instance.status == ExecutionStatus::Pending {
            self.engine.start_execution(&instance_id, options).await?;
        } else {
            self.engine.resume_execution(&instance_id, options).await?;
        }
        tracing::info!(
            "[FlowchartBridge] Task {} started instance {}",
            task.task_id,
            instance_id
        );

        tokio::spawn(relay_outcome(task, queue, rx));
        Ok(Disposition::Deferred)
    }
}

/// Forward one run's events into the queue until the run ends.
async fn relay_outcome(task: QueuedTask, queue: TaskQueue, mut events: mpsc::UnboundedReceiver<FlowchartEvent>) {
    let partition = task.partition();
    let mut succeeded = false;
    while let Some(event) = events.recv().await {
        match &event {
            FlowchartEvent::NodeStarted { label, node_type, .. } => {
                tracing::info!(
                    "[FlowchartBridge] Room {}: step '{}' ({}) started",
                    task.room_id,
                    label,
                    node_type
                );
            }
            FlowchartEvent::NodeCompleted { node_id, .. } => {
                tracing::info!("[FlowchartBridge] Room {}: step {} done", task.room_id, node_id);
            }
            FlowchartEvent::Completed { final_output, .. } => {
                tracing::info!(
                    "[FlowchartBridge] Room {}: flowchart finished: {}",
                    task.room_id,
                    final_output.as_deref().unwrap_or("")
                );
                succeeded = true;
            }
            FlowchartEvent::Paused { node_id, .. } => {
                // The run yields the partition; resuming is an explicit call.
                tracing::info!("[FlowchartBridge] Room {}: flowchart paused at {}", task.room_id, node_id);
                succeeded = true;
            }
            FlowchartEvent::Failed { error, .. } => {
                tracing::warn!("[FlowchartBridge] Room {}: flowchart failed: {}", task.room_id, error);
            }
            FlowchartEvent::Cancelled { .. } => {
                tracing::info!("[FlowchartBridge] Room {}: flowchart cancelled", task.room_id);
            }
            FlowchartEvent::Started { .. } => {}
        }
        if event.ends_run() {
            break;
        }
    }

    let result = if succeeded {
        queue.mark_task_completed(&task.task_id).await
    } else {
        queue.mark_task_failed(&task.task_id).await
    };
    if let Err(e) = result {
        tracing::error!("[FlowchartBridge] Failed to record outcome of {}: {}", task.task_id, e);
    }
    queue.on_task_complete(&partition).await;
}

/// Entry point for triggering flowcharts through the queue.
#[derive(Clone)]
pub struct FlowchartQueueBridge {
    engine: FlowchartEngine,
    queue: TaskQueue,
}

impl FlowchartQueueBridge {
    /// Registers a `FlowchartTaskProcessor` on `queue`.
    pub fn new(engine: FlowchartEngine, queue: TaskQueue, instances: InstanceStore) -> Self {
        queue.register_processor(std::sync::Arc::new(FlowchartTaskProcessor::new(
            engine.clone(),
            instances,
        )));
        Self { engine, queue }
    }

    /// Create an instance of the latest version of `template_id` and queue
    /// it on the room's OPENCLAW partition. Returns `(task_id, instance_id)`.
    pub async fn enqueue_flowchart(
        &self,
        room_id: &str,
        template_id: &str,
        variables: HashMap<String, Value>,
        user_info: Option<UserInfo>,
        source_message_id: Option<String>,
    ) -> Result<(String, String), EngineError> {
        let instance = self
            .engine
            .create_instance(CreateInstanceInput {
                template_id: template_id.to_string(),
                room_id: Some(room_id.to_string()),
                triggered_by: user_info.as_ref().map(|u| u.user_id.clone()),
                triggered_by_message_id: source_message_id.clone(),
                variables,
            })
            .await?;

        let task = self
            .queue
            .enqueue(EnqueueTaskInput {
                room_id: room_id.to_string(),
                assistant_type: AssistantKind::OpenClaw,
                task_type: TaskType::Flowchart,
                content: instance.template_name.clone(),
                attachments: Vec::new(),
                user_info,
                source_message_id,
                flowchart_instance_id: Some(instance.instance_id.clone()),
            })
            .await?;
        tracing::info!(
            "[FlowchartBridge] Queued '{}' as task {} (instance {})",
            instance.template_name,
            task.task_id,
            instance.instance_id
        );

        self.queue
            .try_process_next(&PartitionKey::new(room_id, AssistantKind::OpenClaw))
            .await?;
        Ok((task.task_id, instance.instance_id))
    }
}
