use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::flowchart::registry::HandlerRegistry;
use crate::flowchart::validate::validate_definition;
use crate::models::template::{CreateTemplateInput, FlowchartTemplate, UpdateTemplateInput};

use super::InstanceStore;

const TEMPLATE_COLUMNS: &str = "id, template_id, version, parent_version_id, is_latest, name, \
     description, category, icon, definition, variables, allowed_room_ids, is_public, \
     created_by, updated_by, created_at, updated_at";

/// Versioned template persistence. Rows are never edited in place except
/// to clear `is_latest` on the version being superseded.
#[derive(Clone)]
pub struct TemplateStore {
    db: Database,
    registry: Option<Arc<HandlerRegistry>>,
}

impl TemplateStore {
    pub fn new(db: Database) -> Self {
        Self { db, registry: None }
    }

    /// Validate every definition against the registered handlers before it
    /// is written.
    pub fn with_validation(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn validate(&self, template: &FlowchartTemplate) -> Result<(), EngineError> {
        match &self.registry {
            Some(registry) => validate_definition(&template.definition, registry),
            None => Ok(()),
        }
    }

    pub async fn create(&self, input: CreateTemplateInput) -> Result<FlowchartTemplate, EngineError> {
        let template_id = input.template_id.unwrap_or_else(new_template_id);
        if self.get_latest(&template_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "Template already exists: {}",
                template_id
            )));
        }

        let now = Utc::now();
        let mut t = FlowchartTemplate {
            id: 0,
            template_id,
            name: input.name,
            description: input.description,
            category: input.category,
            icon: input.icon,
            version: 1,
            parent_version_id: None,
            is_latest: true,
            definition: input.definition,
            variables: input.variables,
            allowed_room_ids: input.allowed_room_ids,
            is_public: input.is_public,
            created_by: input.created_by.clone(),
            updated_by: input.created_by,
            created_at: now,
            updated_at: now,
        };
        self.validate(&t)?;

        let tc = t.clone();
        t.id = self
            .db
            .with_conn_async(move |conn| {
                insert_template(conn, &tc)?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::info!(
            "[TemplateStore] Created template {} v{} ({})",
            t.template_id,
            t.version,
            t.name
        );
        Ok(t)
    }

    /// Publish a new version on top of the current latest one.
    pub async fn update(
        &self,
        template_id: &str,
        input: UpdateTemplateInput,
    ) -> Result<FlowchartTemplate, EngineError> {
        let current = self
            .get_latest(template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Template not found: {}", template_id)))?;

        let now = Utc::now();
        let mut next = FlowchartTemplate {
            id: 0,
            template_id: current.template_id.clone(),
            name: input.name.unwrap_or(current.name),
            description: input.description.or(current.description),
            category: input.category.or(current.category),
            icon: input.icon.or(current.icon),
            version: current.version + 1,
            parent_version_id: Some(current.id),
            is_latest: true,
            definition: input.definition.unwrap_or(current.definition),
            variables: input.variables.unwrap_or(current.variables),
            allowed_room_ids: input.allowed_room_ids.unwrap_or(current.allowed_room_ids),
            is_public: input.is_public.unwrap_or(current.is_public),
            created_by: current.created_by,
            updated_by: input.updated_by,
            created_at: now,
            updated_at: now,
        };
        self.validate(&next)?;

        let previous_id = current.id;
        let nc = next.clone();
        let inserted = self
            .db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction()?;
                let demoted = tx.execute(
                    "UPDATE flowchart_templates SET is_latest = 0, updated_at = ?2 \
                     WHERE id = ?1 AND is_latest = 1",
                    rusqlite::params![previous_id, nc.updated_at.timestamp_millis()],
                )?;
                if demoted == 0 {
                    return Ok(None);
                }
                insert_template(&tx, &nc)?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Some(id))
            })
            .await?;

        next.id = inserted.ok_or_else(|| {
            EngineError::Conflict(format!(
                "Template {} was updated concurrently; reload and retry",
                template_id
            ))
        })?;

        tracing::info!(
            "[TemplateStore] Published template {} v{} (parent row {})",
            next.template_id,
            next.version,
            previous_id
        );
        Ok(next)
    }

    pub async fn get_latest(&self, template_id: &str) -> Result<Option<FlowchartTemplate>, EngineError> {
        let template_id = template_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM flowchart_templates WHERE template_id = ?1 AND is_latest = 1",
                        TEMPLATE_COLUMNS
                    ),
                    rusqlite::params![template_id],
                    |row| Ok(row_to_template(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn get_version(
        &self,
        template_id: &str,
        version: i64,
    ) -> Result<Option<FlowchartTemplate>, EngineError> {
        let template_id = template_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM flowchart_templates WHERE template_id = ?1 AND version = ?2",
                        TEMPLATE_COLUMNS
                    ),
                    rusqlite::params![template_id, version],
                    |row| Ok(row_to_template(row)),
                )
                .optional()
            })
            .await
    }

    /// Every version of a template, newest first.
    pub async fn version_history(&self, template_id: &str) -> Result<Vec<FlowchartTemplate>, EngineError> {
        self.query_list(
            "WHERE template_id = ?1 ORDER BY version DESC",
            vec![template_id.to_string()],
        )
        .await
    }

    /// Latest version of every template, most recently updated first.
    pub async fn list_latest(&self) -> Result<Vec<FlowchartTemplate>, EngineError> {
        self.query_list("WHERE is_latest = 1 ORDER BY updated_at DESC", vec![])
            .await
    }

    pub async fn list_by_category(&self, category: &str) -> Result<Vec<FlowchartTemplate>, EngineError> {
        self.query_list(
            "WHERE is_latest = 1 AND category = ?1 ORDER BY updated_at DESC",
            vec![category.to_string()],
        )
        .await
    }

    pub async fn list_by_owner(&self, created_by: &str) -> Result<Vec<FlowchartTemplate>, EngineError> {
        self.query_list(
            "WHERE is_latest = 1 AND created_by = ?1 ORDER BY updated_at DESC",
            vec![created_by.to_string()],
        )
        .await
    }

    /// Templates usable in a room: public ones plus those whose allow-list
    /// names the room, one entry (the latest version) per template.
    pub async fn list_for_room(&self, room_id: &str) -> Result<Vec<FlowchartTemplate>, EngineError> {
        let mut by_id: BTreeMap<String, FlowchartTemplate> = BTreeMap::new();
        for t in self.list_latest().await? {
            if !t.is_visible_in(room_id) {
                continue;
            }
            match by_id.get(&t.template_id) {
                Some(existing) if existing.version >= t.version => {}
                _ => {
                    by_id.insert(t.template_id.clone(), t);
                }
            }
        }
        let mut templates: Vec<_> = by_id.into_values().collect();
        templates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(templates)
    }

    /// Delete every version of a template. Refused while any instance of it
    /// is still running.
    pub async fn delete(&self, template_id: &str) -> Result<bool, EngineError> {
        let running = InstanceStore::new(self.db.clone())
            .count_running_for_template(template_id)
            .await?;
        if running > 0 {
            return Err(EngineError::Conflict(format!(
                "Template {} has {} running instance(s)",
                template_id, running
            )));
        }

        let id = template_id.to_string();
        let removed = self
            .db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM flowchart_templates WHERE template_id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n)
            })
            .await?;
        if removed > 0 {
            tracing::info!("[TemplateStore] Deleted template {} ({} versions)", template_id, removed);
        }
        Ok(removed > 0)
    }

    async fn query_list(
        &self,
        clause: &'static str,
        params: Vec<String>,
    ) -> Result<Vec<FlowchartTemplate>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flowchart_templates {}",
                    TEMPLATE_COLUMNS, clause
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                        Ok(row_to_template(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Short random business id, e.g. `3f9a0c1b7d2e`.
fn new_template_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn insert_template(conn: &rusqlite::Connection, t: &FlowchartTemplate) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO flowchart_templates (template_id, version, parent_version_id, is_latest, name, \
         description, category, icon, definition, variables, allowed_room_ids, is_public, \
         created_by, updated_by, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            t.template_id,
            t.version,
            t.parent_version_id,
            t.is_latest as i64,
            t.name,
            t.description,
            t.category,
            t.icon,
            serde_json::to_string(&t.definition).unwrap_or_else(|_| "{}".into()),
            serde_json::to_string(&t.variables).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&t.allowed_room_ids).unwrap_or_else(|_| "[]".into()),
            t.is_public as i64,
            t.created_by,
            t.updated_by,
            t.created_at.timestamp_millis(),
            t.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn row_to_template(row: &rusqlite::Row<'_>) -> FlowchartTemplate {
    use chrono::TimeZone;
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let json = |idx: usize| row.get::<_, String>(idx).unwrap_or_default();

    FlowchartTemplate {
        id: row.get(0).unwrap_or_default(),
        template_id: row.get(1).unwrap_or_default(),
        version: row.get(2).unwrap_or(1),
        parent_version_id: row.get(3).unwrap_or(None),
        is_latest: row.get::<_, i64>(4).unwrap_or(0) != 0,
        name: row.get(5).unwrap_or_default(),
        description: row.get(6).unwrap_or(None),
        category: row.get(7).unwrap_or(None),
        icon: row.get(8).unwrap_or(None),
        definition: serde_json::from_str(&json(9)).unwrap_or_default(),
        variables: serde_json::from_str(&json(10)).unwrap_or_default(),
        allowed_room_ids: serde_json::from_str(&json(11)).unwrap_or_default(),
        is_public: row.get::<_, i64>(12).unwrap_or(1) != 0,
        created_by: row.get(13).unwrap_or(None),
        updated_by: row.get(14).unwrap_or(None),
        created_at: to_dt(row.get(15).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(16).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::template::FlowchartDefinition;

    fn input(name: &str) -> CreateTemplateInput {
        CreateTemplateInput {
            template_id: None,
            name: name.to_string(),
            description: None,
            category: Some("report".to_string()),
            icon: None,
            definition: FlowchartDefinition::default(),
            variables: vec![],
            allowed_room_ids: vec![],
            is_public: true,
            created_by: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_first_version() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let t = store.create(input("Daily report")).await.unwrap();
        assert_eq!(t.template_id.len(), 12);
        assert_eq!(t.version, 1);
        assert!(t.is_latest);
        assert!(t.id > 0);

        let fetched = store.get_latest(&t.template_id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Daily report");
        assert_eq!(fetched.created_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_update_inherits_omitted_fields() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let v1 = store.create(input("Sync")).await.unwrap();

        let v2 = store
            .update(
                &v1.template_id,
                UpdateTemplateInput {
                    description: Some("nightly".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.name, "Sync");
        assert_eq!(v2.category.as_deref(), Some("report"));
        assert_eq!(v2.description.as_deref(), Some("nightly"));
        assert_eq!(v2.parent_version_id, Some(v1.id));

        let old = store.get_version(&v1.template_id, 1).await.unwrap().unwrap();
        assert!(!old.is_latest);
        assert_eq!(old.description, None);
    }

    #[tokio::test]
    async fn test_update_missing_template_is_not_found() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let err = store
            .update("nope", UpdateTemplateInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_with_existing_id_conflicts() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let mut i = input("A");
        i.template_id = Some("daily-report".to_string());
        store.create(i.clone()).await.unwrap();
        let err = store.create(i).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_for_room_visibility() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let public = store.create(input("Public")).await.unwrap();

        let mut private = input("Private");
        private.is_public = false;
        private.allowed_room_ids = vec!["room-1".to_string()];
        let private = store.create(private).await.unwrap();
        store
            .update(&private.template_id, UpdateTemplateInput::default())
            .await
            .unwrap();

        let in_room_1 = store.list_for_room("room-1").await.unwrap();
        assert_eq!(in_room_1.len(), 2);
        let p = in_room_1
            .iter()
            .find(|t| t.template_id == private.template_id)
            .unwrap();
        assert_eq!(p.version, 2);

        let in_room_2 = store.list_for_room("room-2").await.unwrap();
        assert_eq!(in_room_2.len(), 1);
        assert_eq!(in_room_2[0].template_id, public.template_id);
    }

    #[tokio::test]
    async fn test_list_by_category_and_owner() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        store.create(input("A")).await.unwrap();
        let mut other = input("B");
        other.category = Some("notification".to_string());
        other.created_by = Some("bob".to_string());
        store.create(other).await.unwrap();

        assert_eq!(store.list_by_category("report").await.unwrap().len(), 1);
        assert_eq!(store.list_by_owner("bob").await.unwrap().len(), 1);
        assert_eq!(store.list_latest().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_all_versions() {
        let store = TemplateStore::new(Database::open_in_memory().unwrap());
        let t = store.create(input("Gone")).await.unwrap();
        store
            .update(&t.template_id, UpdateTemplateInput::default())
            .await
            .unwrap();
        assert!(store.delete(&t.template_id).await.unwrap());
        assert!(store.version_history(&t.template_id).await.unwrap().is_empty());
        assert!(!store.delete(&t.template_id).await.unwrap());
    }
}
