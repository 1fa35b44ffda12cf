//! SQLite store for tasks and approvals created by workflow steps.
//!
//! This is the host-side record behind `create_task`, `assign_tasks` and
//! `approval` steps. The engine only sees item IDs and statuses through
//! `StepExecutionContext`; the CLI closes items here and then asks the
//! engine to poll or complete the waiting step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite};
use tenure_core::workflow::collaborators::{WorkItemKind, WorkItemRequest};
use tenure_types::error::RepositoryError;
use tenure_types::instance::WorkItemStatus;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_enum, parse_optional_datetime, parse_uuid, query_error};

/// A persisted task or approval.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkItemKind,
    pub instance_id: Uuid,
    pub process_id: String,
    pub step_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub status: WorkItemStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, kind, instance_id, process_id, step_id, title, description, assignee, due_at, priority, status, created_at, closed_at";

struct WorkItemRow {
    id: String,
    kind: String,
    instance_id: String,
    process_id: String,
    step_id: String,
    title: String,
    description: Option<String>,
    assignee: Option<String>,
    due_at: Option<String>,
    priority: Option<String>,
    status: String,
    created_at: String,
    closed_at: Option<String>,
}

impl WorkItemRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            instance_id: row.try_get("instance_id")?,
            process_id: row.try_get("process_id")?,
            step_id: row.try_get("step_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            assignee: row.try_get("assignee")?,
            due_at: row.try_get("due_at")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }

    fn into_item(self) -> Result<WorkItem, RepositoryError> {
        Ok(WorkItem {
            id: self.id,
            kind: parse_enum(&self.kind, "work item kind")?,
            instance_id: parse_uuid(&self.instance_id)?,
            process_id: self.process_id,
            step_id: self.step_id,
            title: self.title,
            description: self.description,
            assignee: self.assignee,
            due_at: parse_optional_datetime(self.due_at.as_deref())?,
            priority: self.priority,
            status: parse_enum(&self.status, "work item status")?,
            created_at: parse_datetime(&self.created_at)?,
            closed_at: parse_optional_datetime(self.closed_at.as_deref())?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkItem, RepositoryError> {
    WorkItemRow::from_row(row).map_err(query_error)?.into_item()
}

fn enum_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// SQLite-backed work item store.
#[derive(Clone)]
pub struct SqliteWorkItemStore {
    pool: DatabasePool,
}

impl SqliteWorkItemStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persist a new open item and return it.
    pub async fn create(&self, request: &WorkItemRequest) -> Result<WorkItem, RepositoryError> {
        let item = WorkItem {
            id: Uuid::now_v7().to_string(),
            kind: request.kind,
            instance_id: request.instance_id,
            process_id: request.process_id.clone(),
            step_id: request.step_id.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            assignee: request.assignee.clone(),
            due_at: request.due_at,
            priority: request.priority.clone(),
            status: WorkItemStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
        };

        let sql = format!(
            "INSERT INTO work_items ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&item.id)
            .bind(enum_str(&item.kind))
            .bind(item.instance_id.to_string())
            .bind(&item.process_id)
            .bind(&item.step_id)
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.assignee)
            .bind(item.due_at.as_ref().map(format_datetime))
            .bind(&item.priority)
            .bind(enum_str(&item.status))
            .bind(format_datetime(&item.created_at))
            .bind(None::<String>)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkItem>, RepositoryError> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode).transpose()
    }

    /// Status of each known ID. Unknown IDs are omitted.
    pub async fn statuses(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, WorkItemStatus>, RepositoryError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, status FROM work_items WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = builder
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                let status: String = row.try_get("status").map_err(query_error)?;
                Ok((id, parse_enum(&status, "work item status")?))
            })
            .collect()
    }

    /// Close (or reopen) an item. Returns the updated item.
    pub async fn set_status(
        &self,
        id: &str,
        status: WorkItemStatus,
    ) -> Result<WorkItem, RepositoryError> {
        let closed_at = status.is_closed().then(|| format_datetime(&Utc::now()));
        let result = sqlx::query("UPDATE work_items SET status = ?, closed_at = ? WHERE id = ?")
            .bind(enum_str(&status))
            .bind(closed_at)
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        self.get(id).await?.ok_or(RepositoryError::NotFound)
    }

    pub async fn list_for_instance(&self, instance_id: &Uuid) -> Result<Vec<WorkItem>, RepositoryError> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE instance_id = ? ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(decode).collect()
    }

    /// Every open item, oldest first.
    pub async fn list_open(&self) -> Result<Vec<WorkItem>, RepositoryError> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE status = 'open' ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(decode).collect()
    }
}
