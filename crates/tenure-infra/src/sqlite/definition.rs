//! SQLite workflow definition repository implementation.
//!
//! Definitions are stored as JSON blobs. Lookup fields (code, process type)
//! and the engine-maintained fields (active/default flags, usage statistics)
//! also have their own columns; on read the column values win over the blob,
//! so statistics can be bumped with a single UPDATE.

use chrono::Utc;
use sqlx::Row;
use tenure_core::repository::definition::DefinitionRepository;
use tenure_types::error::RepositoryError;
use tenure_types::workflow::{ProcessType, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, map_write_error, parse_json, query_error, to_json};

/// SQLite-backed implementation of `DefinitionRepository`.
pub struct SqliteDefinitionRepository {
    pool: DatabasePool,
}

impl SqliteDefinitionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "SELECT definition, is_active, is_default, usage_count, success_rate, average_completion_minutes FROM workflow_definitions";

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
    is_active: bool,
    is_default: bool,
    usage_count: i64,
    success_rate: Option<f64>,
    average_completion_minutes: Option<f64>,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
            is_active: row.try_get("is_active")?,
            is_default: row.try_get("is_default")?,
            usage_count: row.try_get("usage_count")?,
            success_rate: row.try_get("success_rate")?,
            average_completion_minutes: row.try_get("average_completion_minutes")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = parse_json(&self.definition, "workflow definition")?;
        def.is_active = self.is_active;
        def.is_default = self.is_default;
        def.stats.usage_count = self.usage_count.max(0) as u64;
        def.stats.success_rate = self.success_rate;
        def.stats.average_completion_minutes = self.average_completion_minutes;
        Ok(def)
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    DefinitionRow::from_row(row)
        .map_err(query_error)?
        .into_definition()
}

fn ensure_found(rows_affected: u64) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        Err(RepositoryError::NotFound)
    } else {
        Ok(())
    }
}

impl SqliteDefinitionRepository {
    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: String,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let sql = format!("{SELECT_COLUMNS} WHERE {clause}");
        let row = sqlx::query(&sql)
            .bind(bind)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode).transpose()
    }
}

// ---------------------------------------------------------------------------
// DefinitionRepository impl
// ---------------------------------------------------------------------------

impl DefinitionRepository for SqliteDefinitionRepository {
    async fn get_by_id(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.fetch_one_where("id = ?", id.to_string()).await
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.fetch_one_where("code = ?", code.to_string()).await
    }

    async fn get_default_for_type(
        &self,
        process_type: ProcessType,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.fetch_one_where(
            "process_type = ? AND is_default = 1 AND is_active = 1 ORDER BY updated_at DESC LIMIT 1",
            process_type.as_str().to_string(),
        )
        .await
    }

    async fn create(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let json = to_json(definition, "definition")?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, code, title, process_type, version, is_active, is_default,
                usage_count, success_rate, average_completion_minutes, definition,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(definition.id.to_string())
        .bind(&definition.code)
        .bind(&definition.title)
        .bind(definition.process_type.as_str())
        .bind(i64::from(definition.version))
        .bind(definition.is_active)
        .bind(definition.is_default)
        .bind(definition.stats.usage_count as i64)
        .bind(definition.stats.success_rate)
        .bind(definition.stats.average_completion_minutes)
        .bind(&json)
        .bind(format_datetime(&definition.created_at))
        .bind(format_datetime(&definition.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            map_write_error(e, || {
                format!("definition code '{}' already exists", definition.code)
            })
        })?;

        Ok(definition.clone())
    }

    async fn update(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let json = to_json(definition, "definition")?;

        let result = sqlx::query(
            r#"UPDATE workflow_definitions SET
                 code = ?, title = ?, process_type = ?, version = ?,
                 is_active = ?, is_default = ?, usage_count = ?, success_rate = ?,
                 average_completion_minutes = ?, definition = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&definition.code)
        .bind(&definition.title)
        .bind(definition.process_type.as_str())
        .bind(i64::from(definition.version))
        .bind(definition.is_active)
        .bind(definition.is_default)
        .bind(definition.stats.usage_count as i64)
        .bind(definition.stats.success_rate)
        .bind(definition.stats.average_completion_minutes)
        .bind(&json)
        .bind(format_datetime(&definition.updated_at))
        .bind(definition.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            map_write_error(e, || {
                format!("definition code '{}' already exists", definition.code)
            })
        })?;

        ensure_found(result.rows_affected())?;
        Ok(definition.clone())
    }

    async fn list_by_type(
        &self,
        process_type: Option<ProcessType>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = match process_type {
            Some(t) => {
                let sql = format!("{SELECT_COLUMNS} WHERE process_type = ? ORDER BY code");
                sqlx::query(&sql)
                    .bind(t.as_str())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let sql = format!("{SELECT_COLUMNS} ORDER BY code");
                sqlx::query(&sql).fetch_all(&self.pool.reader).await
            }
        }
        .map_err(query_error)?;

        rows.iter().map(decode).collect()
    }

    async fn increment_usage_count(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_definitions SET usage_count = usage_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn update_success_rate(&self, id: &Uuid, success_rate: f64) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_definitions SET success_rate = ? WHERE id = ?")
            .bind(success_rate)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn update_average_completion_time(
        &self,
        id: &Uuid,
        average_minutes: f64,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_definitions SET average_completion_minutes = ? WHERE id = ?",
        )
        .bind(average_minutes)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
