use async_trait::async_trait;
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{Job, JobId, JobStore};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::database_error;

/// SQLite任务存储，整条任务记录以JSON保存在body列
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Job> {
        let body: String = row.try_get("body").map_err(database_error)?;
        serde_json::from_str(&body).map_err(|e| {
            SchedulerError::Serialization(format!("解析任务记录失败: {e}"))
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(
        job_id = %job.id,
        status = %job.status,
        revision = job.revision,
    ))]
    async fn save(&self, job: &Job) -> SchedulerResult<()> {
        let body = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, status, revision, body, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                revision = excluded.revision,
                body = excluded.body,
                updated_at = excluded.updated_at
            WHERE excluded.revision >= jobs.revision
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(job.revision as i64)
        .bind(body)
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() == 0 {
            debug!("忽略过期写入: {} (revision {})", job.id, job.revision);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: JobId) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query("SELECT body FROM jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

        let mut jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<SchedulerResult<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        debug!("从SQLite加载了 {} 条任务记录", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: JobId) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }
}
