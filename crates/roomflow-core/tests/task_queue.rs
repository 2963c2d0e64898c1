//! Queue behavior across partitions and across a process restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use roomflow_core::models::{AssistantKind, EnqueueTaskInput, PartitionKey, QueuedTask, TaskStatus, TaskType};
use roomflow_core::queue::{Disposition, TaskProcessor, TaskQueue};
use roomflow_core::store::TaskStore;
use roomflow_core::{Database, EngineError};

/// Records completion order and how many tasks of each partition overlap.
#[derive(Default)]
struct Probe {
    running: Mutex<Vec<PartitionKey>>,
    overlaps: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskProcessor for Probe {
    fn task_type(&self) -> TaskType {
        TaskType::Chat
    }

    async fn process(&self, task: QueuedTask, _queue: TaskQueue) -> Result<Disposition, EngineError> {
        let partition = task.partition();
        {
            let mut running = self.running.lock().unwrap();
            if running.contains(&partition) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            running.push(partition.clone());
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        {
            let mut running = self.running.lock().unwrap();
            if let Some(i) = running.iter().position(|p| p == &partition) {
                running.remove(i);
            }
        }
        self.finished.lock().unwrap().push(task.content);
        Ok(Disposition::Done)
    }
}

/// Accepts a task and never reports back, like a crash mid-run.
struct Stuck;

#[async_trait]
impl TaskProcessor for Stuck {
    fn task_type(&self) -> TaskType {
        TaskType::Chat
    }

    async fn process(&self, _task: QueuedTask, _queue: TaskQueue) -> Result<Disposition, EngineError> {
        Ok(Disposition::Deferred)
    }
}

fn input(room: &str, assistant: AssistantKind, content: &str) -> EnqueueTaskInput {
    EnqueueTaskInput::chat(room, assistant, content)
}

async fn wait_until_done(queue: &TaskQueue, ids: &[String]) {
    for _ in 0..300 {
        let mut done = true;
        for id in ids {
            let status = queue.get_task(id).await.unwrap().unwrap().status;
            done &= matches!(status, TaskStatus::Completed | TaskStatus::Failed);
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tasks did not finish");
}

#[tokio::test]
async fn test_partitions_are_exclusive_but_independent() {
    let queue = TaskQueue::new(
        TaskStore::new(Database::open_in_memory().unwrap()),
        Duration::from_millis(5),
    );
    let probe = Arc::new(Probe::default());
    queue.register_processor(probe.clone());

    let mut ids = Vec::new();
    for (room, assistant, content) in [
        ("room-1", AssistantKind::OpenClaw, "r1-1"),
        ("room-1", AssistantKind::OpenClaw, "r1-2"),
        ("room-1", AssistantKind::OpenClaw, "r1-3"),
        ("room-1", AssistantKind::Kimi, "k-1"),
        ("room-2", AssistantKind::OpenClaw, "r2-1"),
    ] {
        let task = queue.enqueue(input(room, assistant, content)).await.unwrap();
        ids.push(task.task_id);
    }

    // Several callers racing to drain the same partitions.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let q = queue.clone();
        handles.push(tokio::spawn(async move { q.drain_all().await.unwrap() }));
    }
    let mut started = 0;
    for h in handles {
        started += h.await.unwrap();
    }
    // Every partition is dispatched; a late caller may pick up a freed one.
    assert!(started >= 3);

    wait_until_done(&queue, &ids).await;
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);

    let finished = probe.finished.lock().unwrap().clone();
    let room1: Vec<_> = finished.iter().filter(|c| c.starts_with("r1-")).cloned().collect();
    assert_eq!(room1, vec!["r1-1", "r1-2", "r1-3"]);
    assert_eq!(finished.len(), 5);
}

#[tokio::test]
async fn test_processing_task_survives_restart_as_pending() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let path = path.to_string_lossy().to_string();
    let partition = PartitionKey::new("room-1", AssistantKind::OpenClaw);

    let (first, second) = {
        let queue = TaskQueue::new(TaskStore::new(Database::open(&path).unwrap()), Duration::from_millis(5));
        queue.register_processor(Arc::new(Stuck));
        let first = queue.enqueue(input("room-1", AssistantKind::OpenClaw, "first")).await.unwrap();
        let second = queue.enqueue(input("room-1", AssistantKind::OpenClaw, "second")).await.unwrap();
        assert!(queue.try_process_next(&partition).await.unwrap());
        let stored = queue.get_task(&first.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        (first.task_id, second.task_id)
    };

    // A fresh process over the same file.
    let queue = TaskQueue::new(TaskStore::new(Database::open(&path).unwrap()), Duration::from_millis(5));
    assert_eq!(queue.recover().await.unwrap(), 2);

    let recovered = queue.get_task(&first).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending);
    let order: Vec<_> = queue
        .queue_contents(&partition)
        .await
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    assert_eq!(order, vec![first.clone(), second.clone()]);
    assert!(!queue.is_processing(&partition).await);

    let probe = Arc::new(Probe::default());
    queue.register_processor(probe.clone());
    assert_eq!(queue.drain_all().await.unwrap(), 1);
    wait_until_done(&queue, &[first, second]).await;
    assert_eq!(*probe.finished.lock().unwrap(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_cancelled_task_leaves_room_queue() {
    let queue = TaskQueue::new(
        TaskStore::new(Database::open_in_memory().unwrap()),
        Duration::from_millis(5),
    );
    queue.register_processor(Arc::new(Stuck));
    let partition = PartitionKey::new("room-1", AssistantKind::Claude);

    let busy = queue.enqueue(input("room-1", AssistantKind::Claude, "busy")).await.unwrap();
    let waiting = queue.enqueue(input("room-1", AssistantKind::Claude, "waiting")).await.unwrap();
    queue.try_process_next(&partition).await.unwrap();

    assert!(!queue.cancel_task(&busy.task_id).await.unwrap());
    assert!(queue.cancel_task(&waiting.task_id).await.unwrap());

    let queues = queue.room_task_queues("room-1").await;
    let claude = &queues[&AssistantKind::Claude];
    assert_eq!(claude.len(), 1);
    assert_eq!(claude[0].task_id, busy.task_id);
    assert_eq!(claude[0].status, TaskStatus::Processing);

    let cancelled = queue.get_task(&waiting.task_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(queue.queue_size(&partition).await, 0);
}
