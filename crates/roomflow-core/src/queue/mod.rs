//! Durable per-partition task queue.
//!
//! Every `(room, assistant)` partition has an in-memory FIFO and a
//! processing flag. A compare-and-swap on the flag decides which caller
//! dispatches the next task, so at most one task per partition is ever
//! PROCESSING. Rows in `bot_task_queue` mirror the in-memory state and are
//! replayed by `recover` after a restart.

pub mod chat;
pub mod processor;

pub use chat::{ChatReply, ChatTaskProcessor};
pub use processor::{Disposition, TaskProcessor};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::task::{AssistantKind, EnqueueTaskInput, PartitionKey, QueuedTask, TaskStatus, TaskType};
use crate::store::TaskStore;

#[derive(Default)]
struct PartitionState {
    pending: VecDeque<QueuedTask>,
    current: Option<QueuedTask>,
    processing: Arc<AtomicBool>,
}

impl PartitionState {
    fn contents(&self) -> Vec<QueuedTask> {
        self.current.iter().chain(self.pending.iter()).cloned().collect()
    }

    /// Queue order as persisted positions, the processing task first.
    fn positions(&self) -> Vec<(String, i64)> {
        self.current
            .iter()
            .chain(self.pending.iter())
            .enumerate()
            .map(|(i, t)| (t.task_id.clone(), i as i64))
            .collect()
    }

    fn renumber(&mut self) {
        let offset = self.current.is_some() as i64;
        for (i, task) in self.pending.iter_mut().enumerate() {
            task.position = offset + i as i64;
        }
        if let Some(current) = self.current.as_mut() {
            current.position = 0;
        }
    }

    fn holds(&self, task_id: &str) -> bool {
        self.current.as_ref().is_some_and(|t| t.task_id == task_id)
            || self.pending.iter().any(|t| t.task_id == task_id)
    }
}

struct QueueInner {
    store: TaskStore,
    partitions: Mutex<HashMap<PartitionKey, PartitionState>>,
    processors: RwLock<HashMap<TaskType, Arc<dyn TaskProcessor>>>,
    settle_delay: Duration,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// `settle_delay` is the pause between one task finishing and the next
    /// one in the same partition starting.
    pub fn new(store: TaskStore, settle_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                partitions: Mutex::new(HashMap::new()),
                processors: RwLock::new(HashMap::new()),
                settle_delay,
            }),
        }
    }

    /// Register the processor for its task type, replacing any previous one.
    pub fn register_processor(&self, processor: Arc<dyn TaskProcessor>) {
        let task_type = processor.task_type();
        self.inner
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type, processor);
        tracing::info!("[TaskQueue] Registered processor for {} tasks", task_type.as_str());
    }

    fn processor(&self, task_type: TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.inner
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_type)
            .cloned()
    }

    /// Persist a new PENDING task and append it to its partition.
    /// Processing does not start until `try_process_next` is called.
    pub async fn enqueue(&self, input: EnqueueTaskInput) -> Result<QueuedTask, EngineError> {
        let partition = PartitionKey::new(input.room_id.clone(), input.assistant_type);
        let mut partitions = self.inner.partitions.lock().await;
        let position = partitions
            .get(&partition)
            .map_or(0, |s| s.pending.len() + s.current.is_some() as usize) as i64;
        let task = self.inner.store.create(input, position).await?;
        partitions
            .entry(partition.clone())
            .or_default()
            .pending
            .push_back(task.clone());
        tracing::info!(
            "[TaskQueue] Enqueued {} task {} on {} at position {}",
            task.task_type.as_str(),
            task.task_id,
            partition,
            position
        );
        Ok(task)
    }

    /// Dispatch the head of `partition` unless another task there is already
    /// processing. Returns whether a task was dispatched.
    pub async fn try_process_next(&self, partition: &PartitionKey) -> Result<bool, EngineError> {
        let flag = {
            let mut partitions = self.inner.partitions.lock().await;
            partitions.entry(partition.clone()).or_default().processing.clone()
        };
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("[TaskQueue] {} is busy", partition);
            return Ok(false);
        }

        let mut partitions = self.inner.partitions.lock().await;
        let Some(state) = partitions.get_mut(partition) else {
            flag.store(false, Ordering::SeqCst);
            return Ok(false);
        };
        let Some(mut task) = state.pending.pop_front() else {
            flag.store(false, Ordering::SeqCst);
            return Ok(false);
        };
        if let Err(e) = self
            .inner
            .store
            .update_status(&task.task_id, TaskStatus::Processing)
            .await
        {
            state.pending.push_front(task);
            flag.store(false, Ordering::SeqCst);
            return Err(e);
        }
        task.status = TaskStatus::Processing;
        state.current = Some(task.clone());
        drop(partitions);

        tracing::info!("[TaskQueue] Processing task {} on {}", task.task_id, partition);
        let queue = self.clone();
        tokio::spawn(async move {
            queue.dispatch(task).await;
        });
        Ok(true)
    }

    // Returns a boxed `Send` future to break the recursive async cycle
    // (try_process_next -> dispatch -> on_task_complete -> try_process_next).
    fn dispatch(&self, task: QueuedTask) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let partition = task.partition();
            let task_id = task.task_id.clone();
            let outcome = match self.processor(task.task_type) {
                Some(processor) => {
                    let queue = self.clone();
                    match tokio::spawn(async move { processor.process(task, queue).await }).await {
                        Ok(result) => result,
                        Err(e) => Err(EngineError::Internal(format!("Processor aborted: {}", e))),
                    }
                }
                None => Err(EngineError::Handler(format!(
                    "No processor registered for {} tasks",
                    task.task_type.as_str()
                ))),
            };

            match outcome {
                Ok(Disposition::Done) => {
                    if let Err(e) = self.mark_task_completed(&task_id).await {
                        tracing::error!("[TaskQueue] Failed to complete task {}: {}", task_id, e);
                    }
                    self.on_task_complete(&partition).await;
                }
                Ok(Disposition::Deferred) => {
                    tracing::debug!("[TaskQueue] Task {} handed off", task_id);
                }
                Err(e) => {
                    tracing::warn!("[TaskQueue] Task {} failed: {}", task_id, e);
                    if let Err(e) = self.mark_task_failed(&task_id).await {
                        tracing::error!("[TaskQueue] Failed to fail task {}: {}", task_id, e);
                    }
                    self.on_task_complete(&partition).await;
                }
            }
        })
    }

    /// Release `partition` and, after the settle delay, start its next task.
    pub async fn on_task_complete(&self, partition: &PartitionKey) {
        {
            let mut partitions = self.inner.partitions.lock().await;
            if let Some(state) = partitions.get_mut(partition) {
                state.current = None;
                state.processing.store(false, Ordering::SeqCst);
            }
        }
        let queue = self.clone();
        let partition = partition.clone();
        let delay = self.inner.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.try_process_next(&partition).await {
                tracing::error!("[TaskQueue] Failed to continue {}: {}", partition, e);
            }
        });
    }

    pub async fn mark_task_completed(&self, task_id: &str) -> Result<bool, EngineError> {
        self.inner.store.update_status(task_id, TaskStatus::Completed).await
    }

    pub async fn mark_task_failed(&self, task_id: &str) -> Result<bool, EngineError> {
        self.inner.store.update_status(task_id, TaskStatus::Failed).await
    }

    /// Remove a task that has not been dispatched yet and mark it CANCELLED.
    /// Returns false when the task is processing, finished or unknown.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let mut partitions = self.inner.partitions.lock().await;
        let Some(state) = partitions
            .values_mut()
            .find(|s| s.pending.iter().any(|t| t.task_id == task_id))
        else {
            return Ok(false);
        };
        state.pending.retain(|t| t.task_id != task_id);
        state.renumber();
        let positions = state.positions();
        drop(partitions);

        self.inner.store.update_status(task_id, TaskStatus::Cancelled).await?;
        self.inner.store.set_positions(positions).await?;
        tracing::info!("[TaskQueue] Cancelled task {}", task_id);
        Ok(true)
    }

    /// Reorder the pending tasks of a partition. Listed ids come first in
    /// the given order; pending tasks left out keep their relative order
    /// after them. A processing task stays at the front. Unknown ids are
    /// ignored.
    pub async fn reorder_queue(
        &self,
        partition: &PartitionKey,
        task_ids: &[String],
    ) -> Result<Vec<QueuedTask>, EngineError> {
        let mut partitions = self.inner.partitions.lock().await;
        let Some(state) = partitions.get_mut(partition) else {
            return Ok(Vec::new());
        };

        let mut rest = std::mem::take(&mut state.pending);
        let mut ordered = VecDeque::with_capacity(rest.len());
        let mut seen = HashSet::new();
        for id in task_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if let Some(i) = rest.iter().position(|t| &t.task_id == id) {
                if let Some(task) = rest.remove(i) {
                    ordered.push_back(task);
                }
            }
        }
        ordered.extend(rest);
        state.pending = ordered;
        state.renumber();
        let positions = state.positions();
        let contents = state.contents();
        drop(partitions);

        self.inner.store.set_positions(positions).await?;
        tracing::info!("[TaskQueue] Reordered {}", partition);
        Ok(contents)
    }

    /// Number of tasks waiting in `partition`, not counting the one
    /// being processed.
    pub async fn queue_size(&self, partition: &PartitionKey) -> usize {
        let partitions = self.inner.partitions.lock().await;
        partitions.get(partition).map_or(0, |s| s.pending.len())
    }

    /// The processing task (if any) followed by the pending ones.
    pub async fn queue_contents(&self, partition: &PartitionKey) -> Vec<QueuedTask> {
        let partitions = self.inner.partitions.lock().await;
        partitions.get(partition).map(|s| s.contents()).unwrap_or_default()
    }

    pub async fn is_processing(&self, partition: &PartitionKey) -> bool {
        let partitions = self.inner.partitions.lock().await;
        partitions
            .get(partition)
            .is_some_and(|s| s.processing.load(Ordering::SeqCst))
    }

    pub async fn current_processing_task(&self, partition: &PartitionKey) -> Option<QueuedTask> {
        let partitions = self.inner.partitions.lock().await;
        partitions.get(partition).and_then(|s| s.current.clone())
    }

    /// Non-empty queues of every assistant in a room.
    pub async fn room_task_queues(&self, room_id: &str) -> BTreeMap<AssistantKind, Vec<QueuedTask>> {
        let partitions = self.inner.partitions.lock().await;
        partitions
            .iter()
            .filter(|(key, _)| key.room_id == room_id)
            .map(|(key, state)| (key.assistant, state.contents()))
            .filter(|(_, tasks)| !tasks.is_empty())
            .collect()
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<QueuedTask>, EngineError> {
        self.inner.store.get(task_id).await
    }

    /// Reload unfinished tasks after a restart. PROCESSING rows are demoted
    /// to PENDING and keep their place at the head of their partition.
    /// Call once at startup, before new tasks are enqueued.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut partitions = self.inner.partitions.lock().await;
        let tasks = self.inner.store.list_unfinished().await?;
        let demoted = self.inner.store.demote_processing().await?;

        let mut recovered = 0;
        for mut task in tasks {
            let state = partitions.entry(task.partition()).or_default();
            if state.holds(&task.task_id) {
                continue;
            }
            task.status = TaskStatus::Pending;
            state.pending.push_back(task);
            recovered += 1;
        }
        tracing::info!(
            "[TaskQueue] Recovered {} tasks ({} were processing)",
            recovered,
            demoted
        );
        Ok(recovered)
    }

    /// Kick every partition that has queued work. Returns how many started.
    pub async fn drain_all(&self) -> Result<usize, EngineError> {
        let waiting: Vec<PartitionKey> = {
            let partitions = self.inner.partitions.lock().await;
            partitions
                .iter()
                .filter(|(_, s)| !s.pending.is_empty())
                .map(|(key, _)| key.clone())
                .collect()
        };
        let mut started = 0;
        for partition in waiting {
            if self.try_process_next(&partition).await? {
                started += 1;
            }
        }
        Ok(started)
    }
}
