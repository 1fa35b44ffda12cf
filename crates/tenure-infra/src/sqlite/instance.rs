//! SQLite workflow instance repository implementation.
//!
//! Implements `InstanceRepository` from `tenure-core`. Instances, step
//! records and audit logs live in three tables; JSON columns hold the
//! free-form parts (process context, variables, step outputs).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use tenure_core::repository::instance::{InstanceRepository, ProgressUpdate};
use tenure_types::error::RepositoryError;
use tenure_types::instance::{
    InstanceLogEntry, InstanceStatus, ParentLink, StepRecord, StepStatus, WorkflowInstance,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, parse_datetime, parse_enum, parse_json, parse_optional_datetime, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `InstanceRepository`.
pub struct SqliteInstanceRepository {
    pool: DatabasePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_version, process_id, status, current_step_id, current_step_name, total_steps, completed_steps, progress_percentage, context, variables, parent_instance_id, parent_step_id, started_by, started_at, estimated_completion_at, completed_at, error_message, updated_at";

const STEP_COLUMNS: &str = "instance_id, step_id, step_name, step_type, status, retry_count, error_message, created_item_ids, output, started_at, completed_at";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_version: i64,
    process_id: String,
    status: String,
    current_step_id: Option<String>,
    current_step_name: Option<String>,
    total_steps: i64,
    completed_steps: i64,
    progress_percentage: i64,
    context: String,
    variables: String,
    parent_instance_id: Option<String>,
    parent_step_id: Option<String>,
    started_by: Option<String>,
    started_at: String,
    estimated_completion_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            process_id: row.try_get("process_id")?,
            status: row.try_get("status")?,
            current_step_id: row.try_get("current_step_id")?,
            current_step_name: row.try_get("current_step_name")?,
            total_steps: row.try_get("total_steps")?,
            completed_steps: row.try_get("completed_steps")?,
            progress_percentage: row.try_get("progress_percentage")?,
            context: row.try_get("context")?,
            variables: row.try_get("variables")?,
            parent_instance_id: row.try_get("parent_instance_id")?,
            parent_step_id: row.try_get("parent_step_id")?,
            started_by: row.try_get("started_by")?,
            started_at: row.try_get("started_at")?,
            estimated_completion_at: row.try_get("estimated_completion_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let parent = match (self.parent_instance_id, self.parent_step_id) {
            (Some(instance_id), Some(step_id)) => Some(ParentLink {
                instance_id: parse_uuid(&instance_id)?,
                step_id,
            }),
            _ => None,
        };

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_version: self.definition_version as u32,
            process_id: self.process_id,
            status: parse_enum(&self.status, "instance status")?,
            current_step_id: self.current_step_id,
            current_step_name: self.current_step_name,
            total_steps: self.total_steps as u32,
            completed_steps: self.completed_steps as u32,
            progress_percentage: self.progress_percentage.clamp(0, 100) as u8,
            context: parse_json(&self.context, "context")?,
            variables: parse_json(&self.variables, "variables")?,
            parent,
            started_by: self.started_by,
            started_at: parse_datetime(&self.started_at)?,
            estimated_completion_at: parse_optional_datetime(
                self.estimated_completion_at.as_deref(),
            )?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            error_message: self.error_message,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    instance_id: String,
    step_id: String,
    step_name: String,
    step_type: String,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
    created_item_ids: String,
    output: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            step_type: row.try_get("step_type")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
            created_item_ids: row.try_get("created_item_ids")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            step_name: self.step_name,
            step_type: parse_enum(&self.step_type, "step type")?,
            status: parse_enum(&self.status, "step status")?,
            retry_count: self.retry_count.max(0) as u32,
            error_message: self.error_message,
            created_item_ids: parse_json(&self.created_item_ids, "created_item_ids")?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            started_at: parse_optional_datetime(self.started_at.as_deref())?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
        })
    }
}

struct LogRow {
    id: String,
    instance_id: String,
    step_id: Option<String>,
    step_name: Option<String>,
    event: String,
    level: String,
    message: String,
    data: Option<String>,
    user_id: Option<String>,
    created_at: String,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            event: row.try_get("event")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            data: row.try_get("data")?,
            user_id: row.try_get("user_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<InstanceLogEntry, RepositoryError> {
        Ok(InstanceLogEntry {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            step_name: self.step_name,
            event: self.event,
            level: parse_enum(&self.level, "log level")?,
            message: self.message,
            data: self
                .data
                .as_deref()
                .map(|s| parse_json(s, "log data"))
                .transpose()?,
            user_id: self.user_id,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn decode_instance(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    InstanceRow::from_row(row)
        .map_err(query_error)?
        .into_instance()
}

fn decode_step(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, RepositoryError> {
    StepRow::from_row(row).map_err(query_error)?.into_record()
}

fn optional_json(value: Option<&Value>, what: &str) -> Result<Option<String>, RepositoryError> {
    value.map(|v| to_json(v, what)).transpose()
}

fn ensure_found(rows_affected: u64) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        Err(RepositoryError::NotFound)
    } else {
        Ok(())
    }
}

fn now() -> String {
    format_datetime(&Utc::now())
}

impl SqliteInstanceRepository {
    /// Set a step's terminal status in one statement.
    async fn settle_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        status: StepStatus,
        error_message: Option<&str>,
        output: Option<Option<String>>,
    ) -> Result<(), RepositoryError> {
        // `output: None` leaves the column untouched.
        let result = match output {
            Some(output) => {
                sqlx::query(
                    "UPDATE step_records SET status = ?, error_message = ?, output = ?, completed_at = ? WHERE instance_id = ? AND step_id = ?",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(output)
                .bind(now())
                .bind(instance_id.to_string())
                .bind(step_id)
                .execute(&self.pool.writer)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE step_records SET status = ?, error_message = ?, completed_at = ? WHERE instance_id = ? AND step_id = ?",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(now())
                .bind(instance_id.to_string())
                .bind(step_id)
                .execute(&self.pool.writer)
                .await
            }
        }
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// InstanceRepository impl
// ---------------------------------------------------------------------------

impl InstanceRepository for SqliteInstanceRepository {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let sql = format!(
            "INSERT INTO workflow_instances ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(instance.id.to_string())
            .bind(instance.definition_id.to_string())
            .bind(i64::from(instance.definition_version))
            .bind(&instance.process_id)
            .bind(instance.status.as_str())
            .bind(&instance.current_step_id)
            .bind(&instance.current_step_name)
            .bind(i64::from(instance.total_steps))
            .bind(i64::from(instance.completed_steps))
            .bind(i64::from(instance.progress_percentage))
            .bind(to_json(&instance.context, "context")?)
            .bind(to_json(&instance.variables, "variables")?)
            .bind(instance.parent.as_ref().map(|p| p.instance_id.to_string()))
            .bind(instance.parent.as_ref().map(|p| p.step_id.clone()))
            .bind(&instance.started_by)
            .bind(format_datetime(&instance.started_at))
            .bind(instance.estimated_completion_at.as_ref().map(format_datetime))
            .bind(instance.completed_at.as_ref().map(format_datetime))
            .bind(&instance.error_message)
            .bind(format_datetime(&instance.updated_at))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode_instance).transpose()
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?, current_step_id = ?, current_step_name = ?,
                 total_steps = ?, completed_steps = ?, progress_percentage = ?,
                 context = ?, variables = ?, estimated_completion_at = ?,
                 completed_at = ?, error_message = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(&instance.current_step_name)
        .bind(i64::from(instance.total_steps))
        .bind(i64::from(instance.completed_steps))
        .bind(i64::from(instance.progress_percentage))
        .bind(to_json(&instance.context, "context")?)
        .bind(to_json(&instance.variables, "variables")?)
        .bind(instance.estimated_completion_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.error_message)
        .bind(now())
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn update_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let completed_at = status.is_terminal().then(now);
        // Leaving Failed/Cancelled drops the stale message.
        let keep_error = status.carries_error();
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?,
                 error_message = COALESCE(?, CASE WHEN ? THEN error_message END),
                 completed_at = COALESCE(?, completed_at),
                 updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(keep_error)
        .bind(completed_at)
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn update_progress(
        &self,
        id: &Uuid,
        progress: &ProgressUpdate,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 current_step_id = ?, current_step_name = ?,
                 completed_steps = ?, progress_percentage = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&progress.current_step_id)
        .bind(&progress.current_step_name)
        .bind(i64::from(progress.completed_steps))
        .bind(i64::from(progress.progress_percentage))
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn update_variables(
        &self,
        id: &Uuid,
        variables: &Map<String, Value>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE workflow_instances SET variables = ?, updated_at = ? WHERE id = ?")
                .bind(to_json(variables, "variables")?)
                .bind(now())
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn get_active_for_process(
        &self,
        process_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            r#"SELECT {INSTANCE_COLUMNS} FROM workflow_instances
               WHERE process_id = ? AND parent_instance_id IS NULL
                 AND status NOT IN ('completed', 'failed', 'cancelled')
               ORDER BY started_at DESC LIMIT 1"#
        );
        let row = sqlx::query(&sql)
            .bind(process_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode_instance).transpose()
    }

    async fn list_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE definition_id = ? ORDER BY started_at"
        );
        let rows = sqlx::query(&sql)
            .bind(definition_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(decode_instance).collect()
    }

    // -- Step records --

    async fn create_step_record(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        // Re-creating a record resets it in place and keeps its position.
        let sql = format!(
            r#"INSERT INTO step_records ({STEP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_id) DO UPDATE SET
                 step_name = excluded.step_name,
                 step_type = excluded.step_type,
                 status = excluded.status,
                 retry_count = excluded.retry_count,
                 error_message = excluded.error_message,
                 created_item_ids = excluded.created_item_ids,
                 output = excluded.output,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#
        );
        sqlx::query(&sql)
            .bind(record.instance_id.to_string())
            .bind(&record.step_id)
            .bind(&record.step_name)
            .bind(record.step_type.as_str())
            .bind(record.status.as_str())
            .bind(i64::from(record.retry_count))
            .bind(&record.error_message)
            .bind(to_json(&record.created_item_ids, "created_item_ids")?)
            .bind(optional_json(record.output.as_ref(), "step output")?)
            .bind(record.started_at.as_ref().map(format_datetime))
            .bind(record.completed_at.as_ref().map(format_datetime))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn get_step_record(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let sql =
            format!("SELECT {STEP_COLUMNS} FROM step_records WHERE instance_id = ? AND step_id = ?");
        let row = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode_step).transpose()
    }

    async fn get_step_records(&self, instance_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let sql =
            format!("SELECT {STEP_COLUMNS} FROM step_records WHERE instance_id = ? ORDER BY seq");
        let rows = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(decode_step).collect()
    }

    async fn start_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE step_records SET status = ?, started_at = COALESCE(started_at, ?) WHERE instance_id = ? AND step_id = ?",
        )
        .bind(StepStatus::InProgress.as_str())
        .bind(format_datetime(&started_at))
        .bind(instance_id.to_string())
        .bind(step_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    async fn complete_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        output: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        let output = optional_json(output, "step output")?;
        self.settle_step(instance_id, step_id, StepStatus::Completed, None, Some(output))
            .await
    }

    async fn skip_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.settle_step(instance_id, step_id, StepStatus::Skipped, reason, None)
            .await
    }

    async fn fail_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        error_message: &str,
        output: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        let output = optional_json(output, "step output")?;
        self.settle_step(
            instance_id,
            step_id,
            StepStatus::Failed,
            Some(error_message),
            Some(output),
        )
        .await
    }

    async fn update_step_record(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE step_records SET
                 step_name = ?, step_type = ?, status = ?, retry_count = ?,
                 error_message = ?, created_item_ids = ?, output = ?,
                 started_at = ?, completed_at = ?
               WHERE instance_id = ? AND step_id = ?"#,
        )
        .bind(&record.step_name)
        .bind(record.step_type.as_str())
        .bind(record.status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(&record.error_message)
        .bind(to_json(&record.created_item_ids, "created_item_ids")?)
        .bind(optional_json(record.output.as_ref(), "step output")?)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.instance_id.to_string())
        .bind(&record.step_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_found(result.rows_affected())
    }

    // -- Logs --

    async fn add_log(&self, entry: &InstanceLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO instance_logs
               (id, instance_id, step_id, step_name, event, level, message, data, user_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.instance_id.to_string())
        .bind(&entry.step_id)
        .bind(&entry.step_name)
        .bind(&entry.event)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(optional_json(entry.data.as_ref(), "log data")?)
        .bind(&entry.user_id)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_logs(&self, instance_id: &Uuid) -> Result<Vec<InstanceLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, instance_id, step_id, step_name, event, level, message, data, user_id, created_at FROM instance_logs WHERE instance_id = ? ORDER BY created_at, id",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| LogRow::from_row(row).map_err(query_error)?.into_entry())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
