use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::instance::{ExecutionStatus, FlowchartInstance};

const INSTANCE_COLUMNS: &str = "instance_id, template_id, template_version, template_name, room_id, \
     status, current_node_id, variables, node_executions, outputs, final_output, error_message, \
     error_node_id, task_queue_id, triggered_by, triggered_by_message_id, started_at, completed_at, \
     duration_ms, created_at, updated_at";

#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the full instance row, node history included.
    pub async fn save(&self, instance: &FlowchartInstance) -> Result<(), EngineError> {
        let mut ic = instance.clone();
        ic.updated_at = Utc::now();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO flowchart_instances ({}) VALUES \
                         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                        INSTANCE_COLUMNS
                    ),
                    rusqlite::params![
                        ic.instance_id,
                        ic.template_id,
                        ic.template_version,
                        ic.template_name,
                        ic.room_id,
                        ic.status.as_str(),
                        ic.current_node_id,
                        serde_json::to_string(&ic.variables).unwrap_or_else(|_| "{}".into()),
                        serde_json::to_string(&ic.node_executions).unwrap_or_else(|_| "[]".into()),
                        serde_json::to_string(&ic.outputs).unwrap_or_else(|_| "{}".into()),
                        ic.final_output,
                        ic.error_message,
                        ic.error_node_id,
                        ic.task_queue_id,
                        ic.triggered_by,
                        ic.triggered_by_message_id,
                        ic.started_at.map(|t| t.timestamp_millis()),
                        ic.completed_at.map(|t| t.timestamp_millis()),
                        ic.duration_ms,
                        ic.created_at.timestamp_millis(),
                        ic.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<FlowchartInstance>, EngineError> {
        let id = instance_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM flowchart_instances WHERE instance_id = ?1",
                        INSTANCE_COLUMNS
                    ),
                    rusqlite::params![id],
                    |row| Ok(row_to_instance(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_room(&self, room_id: &str) -> Result<Vec<FlowchartInstance>, EngineError> {
        let room = room_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flowchart_instances WHERE room_id = ?1 ORDER BY created_at DESC",
                    INSTANCE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![room], |row| Ok(row_to_instance(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<FlowchartInstance>, EngineError> {
        let status = status.as_str();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flowchart_instances WHERE status = ?1 ORDER BY created_at ASC",
                    INSTANCE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status], |row| Ok(row_to_instance(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count_running_for_template(&self, template_id: &str) -> Result<i64, EngineError> {
        let id = template_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM flowchart_instances WHERE template_id = ?1 AND status = 'RUNNING'",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
            })
            .await
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> FlowchartInstance {
    use chrono::TimeZone;
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let json = |idx: usize| row.get::<_, String>(idx).unwrap_or_default();

    FlowchartInstance {
        instance_id: row.get(0).unwrap_or_default(),
        template_id: row.get(1).unwrap_or_default(),
        template_version: row.get(2).unwrap_or(1),
        template_name: row.get(3).unwrap_or_default(),
        room_id: row.get(4).unwrap_or(None),
        status: ExecutionStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(ExecutionStatus::Pending),
        current_node_id: row.get(6).unwrap_or(None),
        variables: serde_json::from_str(&json(7)).unwrap_or_default(),
        node_executions: serde_json::from_str(&json(8)).unwrap_or_default(),
        outputs: serde_json::from_str(&json(9)).unwrap_or_default(),
        final_output: row.get(10).unwrap_or(None),
        error_message: row.get(11).unwrap_or(None),
        error_node_id: row.get(12).unwrap_or(None),
        task_queue_id: row.get(13).unwrap_or(None),
        triggered_by: row.get(14).unwrap_or(None),
        triggered_by_message_id: row.get(15).unwrap_or(None),
        started_at: to_dt(row.get(16).unwrap_or(None)),
        completed_at: to_dt(row.get(17).unwrap_or(None)),
        duration_ms: row.get(18).unwrap_or(None),
        created_at: to_dt(row.get(19).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(20).ok()).unwrap_or_else(Utc::now),
    }
}
