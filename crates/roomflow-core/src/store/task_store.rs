use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::task::{AssistantKind, EnqueueTaskInput, QueuedTask, TaskStatus, TaskType};

const TASK_COLUMNS: &str = "task_id, room_id, assistant_type, task_type, content, attachments, \
     user_info, source_message_id, flowchart_instance_id, status, position, created_at, updated_at";

/// Durable rows behind the in-memory task queue.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: EnqueueTaskInput, position: i64) -> Result<QueuedTask, EngineError> {
        let now = Utc::now();
        let task = QueuedTask {
            task_id: Uuid::new_v4().to_string(),
            room_id: input.room_id,
            assistant_type: input.assistant_type,
            task_type: input.task_type,
            content: input.content,
            attachments: input.attachments,
            user_info: input.user_info,
            source_message_id: input.source_message_id,
            flowchart_instance_id: input.flowchart_instance_id,
            status: TaskStatus::Pending,
            position,
            created_at: now,
            updated_at: now,
        };
        let tc = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO bot_task_queue ({}) VALUES \
                         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        TASK_COLUMNS
                    ),
                    rusqlite::params![
                        tc.task_id,
                        tc.room_id,
                        tc.assistant_type.as_str(),
                        tc.task_type.as_str(),
                        tc.content,
                        serde_json::to_string(&tc.attachments).unwrap_or_else(|_| "[]".into()),
                        tc.user_info
                            .as_ref()
                            .and_then(|u| serde_json::to_string(u).ok()),
                        tc.source_message_id,
                        tc.flowchart_instance_id,
                        tc.status.as_str(),
                        tc.position,
                        tc.created_at.timestamp_millis(),
                        tc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<QueuedTask>, EngineError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM bot_task_queue WHERE task_id = ?1", TASK_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_task(row)),
                )
                .optional()
            })
            .await
    }

    /// Persist a status transition. Returns false when the task is unknown.
    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<bool, EngineError> {
        let id = task_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE bot_task_queue SET status = ?2, updated_at = ?3 WHERE task_id = ?1",
                    rusqlite::params![id, status.as_str(), now],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Rewrite positions for a set of tasks in one transaction.
    pub async fn set_positions(&self, positions: Vec<(String, i64)>) -> Result<(), EngineError> {
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE bot_task_queue SET position = ?2, updated_at = ?3 WHERE task_id = ?1",
                    )?;
                    for (task_id, position) in &positions {
                        stmt.execute(rusqlite::params![task_id, position, now])?;
                    }
                }
                tx.commit()
            })
            .await
    }

    /// Every unfinished task. Per partition, a task that was PROCESSING
    /// comes first since it had already left the head of the queue.
    pub async fn list_unfinished(&self) -> Result<Vec<QueuedTask>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM bot_task_queue WHERE status IN ('PENDING', 'PROCESSING') \
                     ORDER BY room_id, assistant_type, \
                     CASE status WHEN 'PROCESSING' THEN 0 ELSE 1 END, position ASC, created_at ASC",
                    TASK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Demote every PROCESSING task back to PENDING. Returns how many moved.
    pub async fn demote_processing(&self) -> Result<usize, EngineError> {
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE bot_task_queue SET status = 'PENDING', updated_at = ?1 WHERE status = 'PROCESSING'",
                    rusqlite::params![now],
                )
            })
            .await
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> QueuedTask {
    use chrono::TimeZone;
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    QueuedTask {
        task_id: row.get(0).unwrap_or_default(),
        room_id: row.get(1).unwrap_or_default(),
        assistant_type: AssistantKind::from_str(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(AssistantKind::OpenClaw),
        task_type: TaskType::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(TaskType::Chat),
        content: row.get(4).unwrap_or_default(),
        attachments: serde_json::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or_default(),
        user_info: row
            .get::<_, Option<String>>(6)
            .unwrap_or(None)
            .and_then(|s| serde_json::from_str(&s).ok()),
        source_message_id: row.get(7).unwrap_or(None),
        flowchart_instance_id: row.get(8).unwrap_or(None),
        status: TaskStatus::from_str(&row.get::<_, String>(9).unwrap_or_default())
            .unwrap_or(TaskStatus::Pending),
        position: row.get(10).unwrap_or(0),
        created_at: to_dt(row.get(11).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(12).ok()).unwrap_or_else(Utc::now),
    }
}
