use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, ScheduledJob, ScheduledJobId, ScheduledJobStatus};

use super::Storage;

pub(crate) struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub(crate) async fn connect(database_url: &str) -> Result<Self> {
        // A single connection keeps writes serialized and keeps
        // `sqlite::memory:` databases alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.configure().await?;
        storage.migrate().await?;
        Ok(storage)
    }

    async fn configure(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                processing_at INTEGER,
                done_at INTEGER,
                failed_at INTEGER,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs(type, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status_processing_at ON jobs(status, processing_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL UNIQUE,
                cron_expression TEXT NOT NULL,
                status TEXT NOT NULL,
                next_run INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_status_next_run
                ON scheduled_jobs(status, next_run)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Job {
        let status: String = row.get("status");

        Job {
            id: JobId(row.get("id")),
            job_type: row.get("type"),
            data: row.get("data"),
            status: JobStatus::from_db(&status),
            created_at: row.get("created_at"),
            processing_at: row.get("processing_at"),
            done_at: row.get("done_at"),
            failed_at: row.get("failed_at"),
            error: row.get("error"),
        }
    }

    fn row_to_scheduled_job(&self, row: sqlx::sqlite::SqliteRow) -> ScheduledJob {
        let status: String = row.get("status");

        ScheduledJob {
            id: ScheduledJobId(row.get("id")),
            job_type: row.get("type"),
            cron_expression: row.get("cron_expression"),
            status: ScheduledJobStatus::from_db(&status),
            next_run: row.get("next_run"),
        }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job_type: &str, data: &str, created_at: i64) -> Result<JobId> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (type, data, status, created_at)
            VALUES (?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(job_type)
        .bind(data)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId(row.get("id")))
    }

    async fn insert_jobs(
        &self,
        job_type: &str,
        data: &[String],
        created_at: i64,
    ) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(data.len());

        for payload in data {
            let row = sqlx::query(
                r#"
                INSERT INTO jobs (type, data, status, created_at)
                VALUES (?, ?, 'pending', ?)
                RETURNING id
                "#,
            )
            .bind(job_type)
            .bind(payload)
            .bind(created_at)
            .fetch_one(&mut *tx)
            .await?;

            ids.push(JobId(row.get("id")));
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn claim_job(&self, job_type: &str, now: i64) -> Result<Option<Job>> {
        // Single-statement claim: the subselect picks the oldest pending row
        // and the outer status guard eliminates double dispatch under
        // contention.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', processing_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE type = ? AND status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| self.row_to_job(row)))
    }

    async fn mark_done(&self, id: JobId, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', done_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_failed(&self, id: JobId, error: &str, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', failed_at = ?, error = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(error)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| self.row_to_job(row)))
    }

    async fn count_jobs(&self, job_type: Option<&str>, status: Option<JobStatus>) -> Result<u64> {
        let mut sql = "SELECT COUNT(*) FROM jobs".to_string();

        match (job_type, status) {
            (Some(_), Some(_)) => sql.push_str(" WHERE type = ? AND status = ?"),
            (Some(_), None) => sql.push_str(" WHERE type = ?"),
            (None, Some(_)) => sql.push_str(" WHERE status = ?"),
            (None, None) => {}
        }

        let mut query = sqlx::query_scalar::<_, i64>(&sql);

        if let Some(job_type) = job_type {
            query = query.bind(job_type);
        }

        if let Some(status) = status {
            query = query.bind(status.as_str());
        }

        let count = query.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn job_types(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT type FROM jobs ORDER BY type")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("type")).collect())
    }

    async fn upsert_scheduled_job(
        &self,
        job_type: &str,
        cron_expression: &str,
        next_run: i64,
    ) -> Result<ScheduledJobId> {
        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (type, cron_expression, status, next_run)
            VALUES (?, ?, 'idle', ?)
            ON CONFLICT(type) DO UPDATE SET
                cron_expression = excluded.cron_expression,
                next_run = excluded.next_run
            RETURNING id
            "#,
        )
        .bind(job_type)
        .bind(cron_expression)
        .bind(next_run)
        .fetch_one(&self.pool)
        .await?;

        Ok(ScheduledJobId(row.get("id")))
    }

    async fn get_scheduled_job(&self, id: ScheduledJobId) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| self.row_to_scheduled_job(row)))
    }

    async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| self.row_to_scheduled_job(row))
            .collect())
    }

    async fn claim_due_scheduled_job(&self, now: i64) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'processing'
            WHERE id = (
                SELECT id FROM scheduled_jobs
                WHERE status = 'idle' AND next_run <= ?
                ORDER BY next_run ASC
                LIMIT 1
            )
            AND status = 'idle'
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| self.row_to_scheduled_job(row)))
    }

    async fn mark_scheduled_job_idle(&self, id: ScheduledJobId, next_run: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'idle', next_run = ?
            WHERE id = ?
            "#,
        )
        .bind(next_run)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn has_due_scheduled_job(&self, job_type: &str, now: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduled_jobs WHERE type = ? AND next_run <= ?",
        )
        .bind(job_type)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn remove_done_jobs(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND done_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn remove_failed_jobs(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'failed' AND failed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_timed_out_jobs(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', processing_at = NULL
            WHERE status = 'processing' AND processing_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
