//! Download rows: upsert, read, list, remove and startup recovery.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::path::PathBuf;
use uuid::Uuid;

use super::db::TaskStore;
use super::StoredDownload;
use crate::types::{DownloadSnapshot, DownloadStatus, ModelRef, TaskId};

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_row(row: &SqliteRow) -> Result<StoredDownload> {
    let id: String = row.get("id");
    let source: String = row.get("source");
    let priority: String = row.get("priority");
    let status: String = row.get("status");
    let descriptor_json: Option<String> = row.get("descriptor_json");

    let model = ModelRef {
        id: row.get("model_id"),
        source: source.parse().map_err(anyhow::Error::msg)?,
        artifact: row.get("artifact"),
    };
    let mut snapshot = DownloadSnapshot::new(
        Uuid::parse_str(&id).with_context(|| format!("bad task id {id:?}"))?,
        model,
        priority.parse().map_err(anyhow::Error::msg)?,
    );
    snapshot.status = status.parse().map_err(anyhow::Error::msg)?;
    snapshot.bytes_transferred = row.get::<i64, _>("bytes_transferred").max(0) as u64;
    snapshot.total_bytes = row.get::<Option<i64>, _>("total_bytes").map(|v| v.max(0) as u64);
    snapshot.progress = snapshot.fraction();
    snapshot.target_path = row.get::<Option<String>, _>("target_path").map(PathBuf::from);
    snapshot.error = row.get("error");
    snapshot.restarts = row.get::<i64, _>("restarts").max(0) as u32;
    snapshot.created_at = from_millis(row.get("created_at"));
    snapshot.updated_at = from_millis(row.get("updated_at"));
    snapshot.started_at = row.get::<Option<i64>, _>("started_at").map(from_millis);
    snapshot.completed_at = row.get::<Option<i64>, _>("completed_at").map(from_millis);

    let descriptor = descriptor_json
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(serde_json::from_str)
        .transpose()?;
    Ok(StoredDownload {
        snapshot,
        descriptor,
    })
}

impl TaskStore {
    /// Insert or replace the row for this task.
    pub async fn save(&self, record: &StoredDownload) -> Result<()> {
        let s = &record.snapshot;
        let descriptor_json = record
            .descriptor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, model_id, source, artifact, priority, status,
                bytes_transferred, total_bytes, target_path, error, restarts,
                descriptor_json, created_at, updated_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                bytes_transferred = excluded.bytes_transferred,
                total_bytes = excluded.total_bytes,
                target_path = excluded.target_path,
                error = excluded.error,
                restarts = excluded.restarts,
                descriptor_json = excluded.descriptor_json,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(s.id.to_string())
        .bind(&s.model.id)
        .bind(s.model.source.as_str())
        .bind(s.model.artifact.as_deref())
        .bind(s.priority.as_str())
        .bind(s.status.as_str())
        .bind(s.bytes_transferred as i64)
        .bind(s.total_bytes.map(|v| v as i64))
        .bind(s.target_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(s.error.as_deref())
        .bind(s.restarts as i64)
        .bind(descriptor_json)
        .bind(millis(s.created_at))
        .bind(millis(s.updated_at))
        .bind(s.started_at.map(millis))
        .bind(s.completed_at.map(millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<StoredDownload>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    /// All rows, oldest first.
    pub async fn list(&self) -> Result<Vec<StoredDownload>> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_row).collect()
    }

    /// Returns whether a row was deleted.
    pub async fn remove(&self, id: TaskId) -> Result<bool> {
        let done = sqlx::query("DELETE FROM downloads WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Non-terminal rows after a restart. Transfers that were running when the
    /// daemon went away come back `paused` at their persisted offset; `pending`
    /// rows are returned unchanged for re-queueing.
    pub async fn recover(&self) -> Result<Vec<StoredDownload>> {
        let now = millis(Utc::now());
        sqlx::query(
            r#"
            UPDATE downloads SET status = 'paused', updated_at = ?1
            WHERE status = 'downloading'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let mut out = Vec::new();
        for record in self.list().await? {
            if !record.snapshot.status.is_terminal() {
                out.push(record);
            }
        }
        let (pending, paused): (Vec<_>, Vec<_>) = out
            .iter()
            .partition(|r| r.snapshot.status == DownloadStatus::Pending);
        tracing::info!(pending = pending.len(), paused = paused.len(), "recovered downloads");
        Ok(out)
    }
}
