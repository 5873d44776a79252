use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};

use unitscout_core::error::AppError;
use unitscout_core::job::{
    BackoffPolicy, FailureDisposition, Job, JobKind, JobPayload, JobState, NewJob, QueueCounts,
};
use unitscout_core::job_queue::{JobQueue, dedup_by_id};

/// Rows per INSERT statement; keeps bind parameters under the protocol limit.
const INSERT_BATCH_ROWS: usize = 1_000;

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct CrawlJobRepository {
    pool: Pool<Postgres>,
}

impl CrawlJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct CrawlJobRow {
    id: String,
    kind: String,
    university_id: String,
    unit_code: Option<String>,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    backoff_base_ms: i64,
    run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    worker_id: Option<String>,
}

impl From<CrawlJobRow> for Job {
    fn from(row: CrawlJobRow) -> Self {
        Job {
            id: row.id,
            kind: row.kind.parse().unwrap_or(JobKind::Scrape),
            payload: JobPayload {
                university_id: row.university_id,
                unit_code: row.unit_code,
            },
            state: row.state.parse().unwrap_or(JobState::Waiting),
            attempts_made: row.attempts_made.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            backoff: BackoffPolicy::from_base_ms(row.backoff_base_ms.max(0) as u64),
            run_at: row.run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            worker_id: row.worker_id,
        }
    }
}

/// Multi-row upsert. A conflicting id is only overwritten when the stored job
/// is terminal; the statement returns the ids it actually recorded.
fn build_upsert<'a>(jobs: &[&'a NewJob]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO crawl_jobs \
         (id, kind, university_id, unit_code, state, max_attempts, backoff_base_ms, run_at) ",
    );

    builder.push_values(jobs.iter().copied(), |mut row, job: &'a NewJob| {
        let delay_ms = job.delay.map(|d| d.as_millis() as f64);
        row.push_bind(job.id.as_str())
            .push_bind(job.kind.as_str())
            .push_bind(job.payload.university_id.as_str())
            .push_bind(job.payload.unit_code.as_deref())
            .push_bind(job.initial_state().as_str())
            .push_bind(job.max_attempts as i32)
            .push_bind(job.backoff.base_ms() as i64)
            .push("NOW() + (")
            .push_bind_unseparated(delay_ms)
            .push_unseparated("::float8 * INTERVAL '1 millisecond')");
    });

    builder.push(
        r#"
        ON CONFLICT (id) DO UPDATE SET
            kind = EXCLUDED.kind,
            university_id = EXCLUDED.university_id,
            unit_code = EXCLUDED.unit_code,
            state = EXCLUDED.state,
            attempts_made = 0,
            max_attempts = EXCLUDED.max_attempts,
            backoff_base_ms = EXCLUDED.backoff_base_ms,
            run_at = EXCLUDED.run_at,
            created_at = NOW(),
            updated_at = NOW(),
            started_at = NULL,
            finished_at = NULL,
            last_error = NULL,
            worker_id = NULL
        WHERE crawl_jobs.state IN ('completed', 'failed')
        RETURNING id
        "#,
    );
    builder
}

impl JobQueue for CrawlJobRepository {
    async fn enqueue(&self, job: NewJob) -> Result<bool, AppError> {
        let recorded = self.enqueue_bulk(std::slice::from_ref(&job)).await?;
        Ok(recorded > 0)
    }

    async fn enqueue_bulk(&self, jobs: &[NewJob]) -> Result<u64, AppError> {
        let unique = dedup_by_id(jobs);
        if unique.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut recorded = 0u64;
        for batch in unique.chunks(INSERT_BATCH_ROWS) {
            let ids: Vec<(String,)> = build_upsert(batch)
                .build_query_as()
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
            recorded += ids.len() as u64;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(recorded)
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, CrawlJobRow>(
            r#"
            UPDATE crawl_jobs
            SET state = 'active', worker_id = $1, started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM crawl_jobs
                WHERE state = 'waiting'
                   OR (state = 'delayed' AND run_at <= NOW())
                ORDER BY COALESCE(run_at, created_at) ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn complete_job(&self, job_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET state = 'completed', attempts_made = attempts_made + 1,
                finished_at = NOW(), updated_at = NOW(),
                last_error = NULL, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobState, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let job: Job = sqlx::query_as::<_, CrawlJobRow>(
            r#"SELECT * FROM crawl_jobs WHERE id = $1 FOR UPDATE"#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?
        .into();

        let state = match job.disposition_after_failure(retryable) {
            FailureDisposition::Retry { delay } => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET state = 'delayed', attempts_made = attempts_made + 1,
                        run_at = NOW() + ($3::float8 * INTERVAL '1 millisecond'),
                        last_error = $2, worker_id = NULL, started_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .bind(delay.as_millis() as f64)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                JobState::Delayed
            }
            FailureDisposition::Exhausted => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET state = 'failed', attempts_made = attempts_made + 1,
                        last_error = $2, worker_id = NULL,
                        finished_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                JobState::Failed
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(state)
    }

    async fn release_job(&self, job_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET state = 'waiting', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET state = 'waiting', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND state = 'active'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, CrawlJobRow>(r#"SELECT * FROM crawl_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = if let Some(state) = state {
            sqlx::query_as::<_, CrawlJobRow>(
                r#"
                SELECT * FROM crawl_jobs
                WHERE state = $1
                ORDER BY created_at DESC, id
                LIMIT $2
                "#,
            )
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, CrawlJobRow>(
                r#"
                SELECT * FROM crawl_jobs
                ORDER BY created_at DESC, id
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT state, COUNT(*) FROM crawl_jobs GROUP BY state"#)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match state.parse::<JobState>() {
                Ok(state) => counts.add(state, count.max(0) as u64),
                Err(_) => tracing::warn!(%state, count, "Ignoring jobs in unknown state"),
            }
        }
        Ok(counts)
    }
}
