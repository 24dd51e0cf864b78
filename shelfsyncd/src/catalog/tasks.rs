use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{CatalogError, CatalogStore, now_unix};

const TASK_COLUMNS: &str =
    "id, source_token, filename, destination_dir, created_at, state, error, target_name";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error(String),
}

impl TaskState {
    fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Error(_) => "error",
        }
    }

    fn parse(value: &str, error: Option<String>) -> Result<Self, CatalogError> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "done" => Ok(TaskState::Done),
            "error" => Ok(TaskState::Error(error.unwrap_or_default())),
            other => Err(CatalogError::InvalidTaskState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTaskRecord {
    pub id: i64,
    pub source_token: Vec<u8>,
    pub filename: String,
    pub destination_dir: String,
    pub created_at: i64,
    pub state: TaskState,
    /// File name picked inside `destination_dir` once copying started.
    pub target_name: Option<String>,
}

fn task_from_row(row: &SqliteRow) -> Result<CopyTaskRecord, CatalogError> {
    let state: String = row.try_get("state")?;
    let error: Option<String> = row.try_get("error")?;
    Ok(CopyTaskRecord {
        id: row.try_get("id")?,
        source_token: row.try_get("source_token")?,
        filename: row.try_get("filename")?,
        destination_dir: row.try_get("destination_dir")?,
        created_at: row.try_get("created_at")?,
        state: TaskState::parse(&state, error)?,
        target_name: row.try_get("target_name")?,
    })
}

impl CatalogStore {
    pub async fn insert_task(
        &self,
        source_token: &[u8],
        filename: &str,
        destination_dir: &str,
    ) -> Result<i64, CatalogError> {
        let result = sqlx::query(
            "INSERT INTO copy_tasks (source_token, filename, destination_dir, created_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(source_token)
        .bind(filename)
        .bind(destination_dir)
        .bind(now_unix())
        .bind(TaskState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        self.record_mutation(result.rows_affected());
        Ok(result.last_insert_rowid())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<CopyTaskRecord>, CatalogError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM copy_tasks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<CopyTaskRecord>, CatalogError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM copy_tasks ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn next_pending_task(&self) -> Result<Option<CopyTaskRecord>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM copy_tasks WHERE state = 'pending' ORDER BY id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Claims a pending task. Returns false if it was removed or already claimed.
    pub async fn mark_task_running(&self, id: i64) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE copy_tasks SET state = 'running', error = NULL WHERE id = ?1 AND state = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn set_task_target(&self, id: i64, target_name: &str) -> Result<bool, CatalogError> {
        let result = sqlx::query("UPDATE copy_tasks SET target_name = ?2 WHERE id = ?1")
            .bind(id)
            .bind(target_name)
            .execute(&self.pool)
            .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    /// A failed copy never reached its target, so the chosen name is released.
    pub async fn set_task_error(&self, id: i64, message: &str) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE copy_tasks SET state = 'error', error = ?2, target_name = NULL WHERE id = ?1",
        )
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    /// Moves a failed task back to pending.
    pub async fn retry_task(&self, id: i64) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE copy_tasks SET state = 'pending', error = NULL WHERE id = ?1 AND state = 'error'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, CatalogError> {
        let result = sqlx::query("DELETE FROM copy_tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn count_tasks(&self) -> Result<i64, CatalogError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM copy_tasks")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Tasks the worker still has to process.
    pub async fn count_open_tasks(&self) -> Result<i64, CatalogError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM copy_tasks WHERE state IN ('pending', 'running')",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Progress of a previous run is not trusted: running rows start over,
    /// keeping their target name.
    pub async fn reset_running_tasks(&self) -> Result<u64, CatalogError> {
        let result =
            sqlx::query("UPDATE copy_tasks SET state = 'pending' WHERE state = 'running'")
                .execute(&self.pool)
                .await?;
        self.record_mutation(result.rows_affected());
        Ok(result.rows_affected())
    }
}
