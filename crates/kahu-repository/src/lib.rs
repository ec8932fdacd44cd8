//! Run registry: the audit store for load runs, per-file load attempts,
//! staging runs, and rejections, backed by Postgres. This is the only state
//! shared across engine components; every mutation locks the row it touches
//! and terminal statuses never transition again.

use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

pub mod records;

pub use records::{
    FileLoadStatus, LoadRunFileRecord, LoadRunRecord, LoadRunStatus, NewLoadRunFile, NewRejection,
    StagingRunRecord, StagingRunStatus, TriggeredBy,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("invalid status value '{0}'")]
    InvalidStatus(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("identity ({version_id}, {content_hash}) already has a load attempt")]
    DuplicateIdentity {
        version_id: String,
        content_hash: String,
    },

    #[error("load run {0} is terminal and cannot transition")]
    InvalidTransition(Uuid),

    #[error("counter deltas must be non-negative")]
    NegativeCounterDelta,
}

const LOAD_RUN_COLUMNS: &str = "id, triggered_by, status, started_at, completed_at, \
     rows_ingested, rows_rejected, files_processed, files_failed, files_skipped, notes";

const LOAD_RUN_FILE_COLUMNS: &str = "id, load_run_id, object_key, object_version_id, \
     content_hash, extract_type, date_extracted, per_org_id, practice_id, status, \
     rows_read, rows_ingested, rows_rejected, error_detail, created_at, updated_at";

const STAGING_RUN_COLUMNS: &str = "id, load_run_id, extract_type, status, rows_read, \
     rows_transformed, rows_rejected, rows_upserted, started_at, completed_at, error_detail";

#[derive(Clone)]
pub struct RunRegistry {
    pool: PgPool,
}

impl RunRegistry {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---- load runs ----

    pub async fn create_load_run(
        &self,
        triggered_by: TriggeredBy,
        notes: Option<&str>,
    ) -> Result<LoadRunRecord, RepositoryError> {
        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            "INSERT INTO etl.load_runs (id, triggered_by, status, notes)
             VALUES ($1, $2, 'running', $3)
             RETURNING {LOAD_RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(triggered_by.as_str())
        .bind(notes)
        .fetch_one(&self.pool)
        .await?;
        load_run_from_row(&row)
    }

    pub async fn get_load_run(&self, id: Uuid) -> Result<LoadRunRecord, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LOAD_RUN_COLUMNS} FROM etl.load_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("load run {id}")))?;
        load_run_from_row(&row)
    }

    /// Move a running load run to its terminal status. Rejects transitions
    /// from any terminal state.
    pub async fn finalize_load_run(
        &self,
        id: Uuid,
        status: LoadRunStatus,
        notes: Option<&str>,
    ) -> Result<LoadRunRecord, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE etl.load_runs
             SET status = $2, completed_at = now(), notes = COALESCE($3, notes)
             WHERE id = $1 AND status = 'running'
             RETURNING {LOAD_RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => load_run_from_row(&row),
            None => {
                // Distinguish a missing run from a terminal one.
                self.get_load_run(id).await?;
                Err(RepositoryError::InvalidTransition(id))
            }
        }
    }

    /// Read-then-write counter update holding a row lock on the run.
    pub async fn add_load_run_counts(
        &self,
        id: Uuid,
        rows_ingested: i64,
        rows_rejected: i64,
        files_processed: i64,
        files_failed: i64,
        files_skipped: i64,
    ) -> Result<(), RepositoryError> {
        if [
            rows_ingested,
            rows_rejected,
            files_processed,
            files_failed,
            files_skipped,
        ]
        .iter()
        .any(|delta| *delta < 0)
        {
            return Err(RepositoryError::NegativeCounterDelta);
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT rows_ingested, rows_rejected, files_processed, files_failed, files_skipped
             FROM etl.load_runs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("load run {id}")))?;

        sqlx::query(
            "UPDATE etl.load_runs
             SET rows_ingested = $2, rows_rejected = $3,
                 files_processed = $4, files_failed = $5, files_skipped = $6
             WHERE id = $1",
        )
        .bind(id)
        .bind(row.try_get::<i64, _>("rows_ingested")? + rows_ingested)
        .bind(row.try_get::<i64, _>("rows_rejected")? + rows_rejected)
        .bind(row.try_get::<i64, _>("files_processed")? + files_processed)
        .bind(row.try_get::<i64, _>("files_failed")? + files_failed)
        .bind(row.try_get::<i64, _>("files_skipped")? + files_skipped)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- load run files ----

    pub async fn create_load_run_file(
        &self,
        file: &NewLoadRunFile,
    ) -> Result<LoadRunFileRecord, RepositoryError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(&format!(
            "INSERT INTO etl.load_run_files
               (id, load_run_id, object_key, object_version_id, content_hash,
                extract_type, date_extracted, per_org_id, practice_id, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {LOAD_RUN_FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(file.load_run_id)
        .bind(&file.object_key)
        .bind(&file.object_version_id)
        .bind(&file.content_hash)
        .bind(&file.extract_type)
        .bind(file.date_extracted)
        .bind(&file.per_org_id)
        .bind(&file.practice_id)
        .bind(file.status.as_str())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => load_run_file_from_row(&row),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(RepositoryError::DuplicateIdentity {
                    version_id: file.object_version_id.clone(),
                    content_hash: file.content_hash.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_load_run_file_by_identity(
        &self,
        object_version_id: &str,
        content_hash: &str,
    ) -> Result<Option<LoadRunFileRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LOAD_RUN_FILE_COLUMNS} FROM etl.load_run_files
             WHERE object_version_id = $1 AND content_hash = $2
               AND status <> 'skipped_duplicate'"
        ))
        .bind(object_version_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| load_run_file_from_row(&row)).transpose()
    }

    /// Conditionally take over an existing attempt: pending, failed, and
    /// cancelled attempts are always claimable, in-progress ones only once
    /// stale. Returns `None` when another worker holds a fresh claim.
    pub async fn claim_load_run_file(
        &self,
        file_id: Uuid,
        load_run_id: Uuid,
        stale_after_secs: f64,
    ) -> Result<Option<LoadRunFileRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE etl.load_run_files
             SET status = 'in_progress', load_run_id = $2, error_detail = NULL,
                 updated_at = now()
             WHERE id = $1
               AND (status IN ('pending', 'failed', 'cancelled')
                    OR (status = 'in_progress'
                        AND updated_at < now() - make_interval(secs => $3)))
             RETURNING {LOAD_RUN_FILE_COLUMNS}"
        ))
        .bind(file_id)
        .bind(load_run_id)
        .bind(stale_after_secs)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| load_run_file_from_row(&row)).transpose()
    }

    pub async fn update_load_run_file(
        &self,
        file_id: Uuid,
        status: FileLoadStatus,
        rows_read: i64,
        rows_ingested: i64,
        rows_rejected: i64,
        error_detail: Option<&str>,
    ) -> Result<LoadRunFileRecord, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE etl.load_run_files
             SET status = $2, rows_read = $3, rows_ingested = $4, rows_rejected = $5,
                 error_detail = $6, updated_at = now()
             WHERE id = $1
             RETURNING {LOAD_RUN_FILE_COLUMNS}"
        ))
        .bind(file_id)
        .bind(status.as_str())
        .bind(rows_read)
        .bind(rows_ingested)
        .bind(rows_rejected)
        .bind(error_detail)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("load run file {file_id}")))?;
        load_run_file_from_row(&row)
    }

    pub async fn list_files_for_load_run(
        &self,
        load_run_id: Uuid,
    ) -> Result<Vec<LoadRunFileRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOAD_RUN_FILE_COLUMNS} FROM etl.load_run_files
             WHERE load_run_id = $1 ORDER BY created_at, id"
        ))
        .bind(load_run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(load_run_file_from_row).collect()
    }

    /// Files eligible for a recovery run.
    pub async fn find_failed_or_pending_files(
        &self,
        limit: i64,
    ) -> Result<Vec<LoadRunFileRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOAD_RUN_FILE_COLUMNS} FROM etl.load_run_files
             WHERE status IN ('pending', 'failed')
             ORDER BY updated_at, id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(load_run_file_from_row).collect()
    }

    // ---- staging runs ----

    pub async fn create_staging_run(
        &self,
        load_run_id: Uuid,
        extract_type: &str,
    ) -> Result<StagingRunRecord, RepositoryError> {
        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            "INSERT INTO etl.staging_runs (id, load_run_id, extract_type, status)
             VALUES ($1, $2, $3, 'running')
             RETURNING {STAGING_RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(load_run_id)
        .bind(extract_type)
        .fetch_one(&self.pool)
        .await?;
        staging_run_from_row(&row)
    }

    pub async fn add_staging_run_counts(
        &self,
        id: Uuid,
        rows_read: i64,
        rows_transformed: i64,
        rows_rejected: i64,
        rows_upserted: i64,
    ) -> Result<(), RepositoryError> {
        if [rows_read, rows_transformed, rows_rejected, rows_upserted]
            .iter()
            .any(|delta| *delta < 0)
        {
            return Err(RepositoryError::NegativeCounterDelta);
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT rows_read, rows_transformed, rows_rejected, rows_upserted
             FROM etl.staging_runs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("staging run {id}")))?;

        sqlx::query(
            "UPDATE etl.staging_runs
             SET rows_read = $2, rows_transformed = $3, rows_rejected = $4, rows_upserted = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(row.try_get::<i64, _>("rows_read")? + rows_read)
        .bind(row.try_get::<i64, _>("rows_transformed")? + rows_transformed)
        .bind(row.try_get::<i64, _>("rows_rejected")? + rows_rejected)
        .bind(row.try_get::<i64, _>("rows_upserted")? + rows_upserted)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn finalize_staging_run(
        &self,
        id: Uuid,
        status: StagingRunStatus,
        error_detail: Option<&str>,
    ) -> Result<StagingRunRecord, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE etl.staging_runs
             SET status = $2, completed_at = now(), error_detail = $3
             WHERE id = $1 AND status = 'running'
             RETURNING {STAGING_RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(error_detail)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::InvalidTransition(id))?;
        staging_run_from_row(&row)
    }

    // ---- rejections ----

    /// Insert rejection rows through the caller's executor so the write can
    /// share the staging batch transaction.
    pub async fn record_rejections<'e, E>(
        &self,
        executor: E,
        rejections: &[NewRejection],
    ) -> Result<(), RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        if rejections.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO etl.rejections
               (staging_run_id, load_run_file_id, source_row_number, raw_row,
                field_errors, category, reason) ",
        );
        builder.push_values(rejections, |mut binder, rejection| {
            binder
                .push_bind(rejection.staging_run_id)
                .push_bind(rejection.load_run_file_id)
                .push_bind(rejection.source_row_number)
                .push_bind(&rejection.raw_row)
                .push_bind(&rejection.field_errors)
                .push_bind(&rejection.category)
                .push_bind(&rejection.reason);
        });
        builder.build().execute(executor).await?;
        Ok(())
    }

    pub async fn count_rejections_for_staging_run(
        &self,
        staging_run_id: Uuid,
    ) -> Result<i64, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM etl.rejections WHERE staging_run_id = $1")
                .bind(staging_run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ---- run forensics ----

    pub async fn record_health(
        &self,
        load_run_id: Uuid,
        summary: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO etl.health (load_run_id, summary) VALUES ($1, $2)")
            .bind(load_run_id)
            .bind(summary)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_config_snapshot(
        &self,
        load_run_id: Uuid,
        effective_config: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO etl.config (load_run_id, effective_config) VALUES ($1, $2)")
            .bind(load_run_id)
            .bind(effective_config)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn load_run_from_row(row: &PgRow) -> Result<LoadRunRecord, RepositoryError> {
    let triggered_by: String = row.try_get("triggered_by")?;
    let status: String = row.try_get("status")?;
    Ok(LoadRunRecord {
        id: row.try_get("id")?,
        triggered_by: TriggeredBy::from_str(&triggered_by)
            .ok_or_else(|| RepositoryError::InvalidStatus(triggered_by.clone()))?,
        status: LoadRunStatus::from_str(&status)
            .ok_or_else(|| RepositoryError::InvalidStatus(status.clone()))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        rows_ingested: row.try_get("rows_ingested")?,
        rows_rejected: row.try_get("rows_rejected")?,
        files_processed: row.try_get("files_processed")?,
        files_failed: row.try_get("files_failed")?,
        files_skipped: row.try_get("files_skipped")?,
        notes: row.try_get("notes")?,
    })
}

fn load_run_file_from_row(row: &PgRow) -> Result<LoadRunFileRecord, RepositoryError> {
    let status: String = row.try_get("status")?;
    Ok(LoadRunFileRecord {
        id: row.try_get("id")?,
        load_run_id: row.try_get("load_run_id")?,
        object_key: row.try_get("object_key")?,
        object_version_id: row.try_get("object_version_id")?,
        content_hash: row.try_get("content_hash")?,
        extract_type: row.try_get("extract_type")?,
        date_extracted: row.try_get("date_extracted")?,
        per_org_id: row.try_get("per_org_id")?,
        practice_id: row.try_get("practice_id")?,
        status: FileLoadStatus::from_str(&status)
            .ok_or_else(|| RepositoryError::InvalidStatus(status.clone()))?,
        rows_read: row.try_get("rows_read")?,
        rows_ingested: row.try_get("rows_ingested")?,
        rows_rejected: row.try_get("rows_rejected")?,
        error_detail: row.try_get("error_detail")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn staging_run_from_row(row: &PgRow) -> Result<StagingRunRecord, RepositoryError> {
    let status: String = row.try_get("status")?;
    Ok(StagingRunRecord {
        id: row.try_get("id")?,
        load_run_id: row.try_get("load_run_id")?,
        extract_type: row.try_get("extract_type")?,
        status: StagingRunStatus::from_str(&status)
            .ok_or_else(|| RepositoryError::InvalidStatus(status.clone()))?,
        rows_read: row.try_get("rows_read")?,
        rows_transformed: row.try_get("rows_transformed")?,
        rows_rejected: row.try_get("rows_rejected")?,
        rows_upserted: row.try_get("rows_upserted")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_detail: row.try_get("error_detail")?,
    })
}
