//! Staging transformer: read landing rows for a load run, apply the
//! extract's declared transformations, upsert accepted rows on the natural
//! key, and preserve every rejected row whole. Atomic at batch granularity;
//! one transformer per `(load_run_id, extract_type)` at a time, enforced by
//! an advisory lock.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, QueryBuilder, Row};
use tokio::sync::watch;
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use kahu_parser::{
    apply_transforms, CoercionSettings, ExtractHandler, ExtractType, FieldError, RejectCategory,
    TypedValue,
};
use kahu_repository::{NewRejection, RunRegistry, StagingRunStatus};

use crate::config::EngineConfig;
use crate::error::{
    db_error_is_transient, is_cardinality_violation, is_constraint_violation, EngineError,
    ErrorContext, Result,
};

const MAX_BIND_PARAMS: usize = 60_000;
const STAGING_LINEAGE: &[&str] = &[
    "object_version_id",
    "content_hash",
    "load_run_id",
    "load_run_file_id",
];

#[derive(Debug)]
pub struct StagingOutcome {
    pub extract_type: ExtractType,
    pub staging_run_id: Option<Uuid>,
    pub status: StagingRunStatus,
    pub rows_read: u64,
    pub rows_transformed: u64,
    pub rows_rejected: u64,
    pub rows_upserted: u64,
    pub batches: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Rejection counts by category, feeding the run summary.
    pub reject_reasons: BTreeMap<String, u64>,
    checkpointed: [i64; 4],
}

impl StagingOutcome {
    fn new(extract_type: ExtractType) -> Self {
        Self {
            extract_type,
            staging_run_id: None,
            status: StagingRunStatus::Running,
            rows_read: 0,
            rows_transformed: 0,
            rows_rejected: 0,
            rows_upserted: 0,
            batches: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
            warnings: Vec::new(),
            reject_reasons: BTreeMap::new(),
            checkpointed: [0; 4],
        }
    }
}

struct RawRow {
    cursor: i64,
    source_row_number: i64,
    load_run_file_id: Uuid,
    object_version_id: String,
    content_hash: String,
    values: Vec<Option<String>>,
}

struct AcceptedRow {
    typed: Vec<TypedValue>,
    raw_values: Vec<Option<String>>,
    source_row_number: i64,
    load_run_file_id: Uuid,
    object_version_id: String,
    content_hash: String,
}

enum BatchEnd {
    Continue(i64),
    Drained,
    Failed(String),
}

pub struct StagingTransformer<'a> {
    pub registry: &'a RunRegistry,
    pub config: &'a EngineConfig,
}

impl<'a> StagingTransformer<'a> {
    /// Transform every non-superseded landing row of this extract for the
    /// given load run. Problems are captured in the outcome.
    pub async fn transform(
        &self,
        handler: &'static ExtractHandler,
        load_run_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> StagingOutcome {
        let started = Instant::now();
        let mut outcome = StagingOutcome::new(handler.extract_type);

        let settings = match self.config.coercion_settings() {
            Ok(settings) => settings,
            Err(err) => {
                outcome.status = StagingRunStatus::Failed;
                outcome.errors.push(err.to_string());
                outcome.duration = started.elapsed();
                return outcome;
            }
        };

        let staging_run = match self
            .registry
            .create_staging_run(load_run_id, handler.extract_type.canonical_name())
            .await
        {
            Ok(run) => run,
            Err(err) => {
                outcome.status = StagingRunStatus::Failed;
                outcome.errors.push(err.to_string());
                outcome.duration = started.elapsed();
                return outcome;
            }
        };
        outcome.staging_run_id = Some(staging_run.id);

        // Only one transformer per (run, extract); concurrent extracts touch
        // disjoint tables so they never serialize against each other.
        let lock = match AdvisoryLock::acquire(
            self.registry.pool(),
            advisory_key(load_run_id, handler.extract_type),
        )
        .await
        {
            Ok(lock) => lock,
            Err(err) => {
                outcome.status = StagingRunStatus::Failed;
                outcome
                    .errors
                    .push(format!("failed to acquire staging lock: {err}"));
                self.finalize(&mut outcome, staging_run.id).await;
                outcome.duration = started.elapsed();
                return outcome;
            }
        };

        let mut cursor = 0i64;
        loop {
            if *cancel.borrow() {
                outcome.status = StagingRunStatus::Cancelled;
                outcome
                    .warnings
                    .push("cancelled between staging batches".to_string());
                break;
            }

            match self
                .run_batch(
                    handler,
                    load_run_id,
                    staging_run.id,
                    cursor,
                    &settings,
                    &mut outcome,
                )
                .await
            {
                Ok(BatchEnd::Continue(next_cursor)) => {
                    cursor = next_cursor;
                    if outcome.rows_rejected > self.config.staging.max_total_errors {
                        outcome.status = StagingRunStatus::Failed;
                        outcome.errors.push(format!(
                            "aborted: {} rejections exceed max_total_errors {}",
                            outcome.rows_rejected, self.config.staging.max_total_errors
                        ));
                        break;
                    }
                }
                Ok(BatchEnd::Drained) => {
                    outcome.status = StagingRunStatus::Completed;
                    break;
                }
                Ok(BatchEnd::Failed(message)) => {
                    outcome.status = StagingRunStatus::Failed;
                    outcome.errors.push(message);
                    break;
                }
                Err(err) => {
                    outcome.status = StagingRunStatus::Failed;
                    outcome.errors.push(err.to_string());
                    break;
                }
            }
        }

        if let Err(err) = lock.release().await {
            outcome
                .warnings
                .push(format!("failed to release staging lock: {err}"));
        }

        self.finalize(&mut outcome, staging_run.id).await;
        outcome.duration = started.elapsed();

        info!(
            load_run_id = %load_run_id,
            extract = handler.extract_type.canonical_name(),
            status = outcome.status.as_str(),
            rows_read = outcome.rows_read,
            rows_upserted = outcome.rows_upserted,
            rows_rejected = outcome.rows_rejected,
            "staging transform finished"
        );
        outcome
    }

    async fn finalize(&self, outcome: &mut StagingOutcome, staging_run_id: Uuid) {
        let error_detail = outcome.errors.first().map(String::as_str);
        if let Err(err) = self
            .registry
            .finalize_staging_run(staging_run_id, outcome.status, error_detail)
            .await
        {
            outcome
                .warnings
                .push(format!("failed to finalize staging run: {err}"));
        }
    }

    /// One batch: fetch, transform, then commit upserts and rejections in a
    /// single transaction. Retries the whole batch on transient failures.
    async fn run_batch(
        &self,
        handler: &'static ExtractHandler,
        load_run_id: Uuid,
        staging_run_id: Uuid,
        cursor: i64,
        settings: &CoercionSettings,
        outcome: &mut StagingOutcome,
    ) -> Result<BatchEnd> {
        let rows = self.fetch_batch(handler, load_run_id, cursor).await?;
        if rows.is_empty() {
            return Ok(BatchEnd::Drained);
        }
        let next_cursor = rows.last().map(|row| row.cursor).unwrap_or(cursor);
        outcome.rows_read += rows.len() as u64;

        let mut accepted = Vec::with_capacity(rows.len());
        let mut rejections = Vec::new();

        for row in rows {
            match apply_transforms(handler, &row.values, settings) {
                Ok(typed) => {
                    outcome.rows_transformed += 1;
                    accepted.push(AcceptedRow {
                        typed,
                        raw_values: row.values,
                        source_row_number: row.source_row_number,
                        load_run_file_id: row.load_run_file_id,
                        object_version_id: row.object_version_id,
                        content_hash: row.content_hash,
                    });
                }
                Err(field_errors) => {
                    let category = field_errors[0].category;
                    *outcome
                        .reject_reasons
                        .entry(category.as_str().to_string())
                        .or_default() += 1;
                    outcome.rows_rejected += 1;
                    rejections.push(build_rejection(
                        handler,
                        staging_run_id,
                        row.load_run_file_id,
                        row.source_row_number,
                        &row.values,
                        category,
                        &field_errors,
                    ));
                }
            }
        }

        if rejections.len() as u64 > self.config.staging.max_errors_per_batch {
            return Ok(BatchEnd::Failed(format!(
                "batch at cursor {cursor} produced {} rejections, over max_errors_per_batch {}",
                rejections.len(),
                self.config.staging.max_errors_per_batch
            )));
        }

        if !self.config.staging.reject_invalid_rows {
            // Rejected rows are counted but not preserved in this mode.
            rejections.clear();
        }

        // A single upsert statement may not touch the same target row twice,
        // so rows sharing a natural key collapse to the newest landing row.
        let (accepted, collapsed) = collapse_natural_key_duplicates(handler, accepted);
        if collapsed > 0 {
            outcome.warnings.push(format!(
                "{collapsed} rows in batch at cursor {cursor} collapsed onto later rows with the same natural key"
            ));
        }

        let mut attempt = 0;
        let mut delay = self.config.retry_delay();
        loop {
            match self
                .commit_batch(handler, load_run_id, &accepted, &rejections)
                .await
            {
                Ok(upserted) => {
                    outcome.rows_upserted += upserted;
                    outcome.batches += 1;
                    self.checkpoint(outcome, staging_run_id).await;
                    return Ok(BatchEnd::Continue(next_cursor));
                }
                Err(err) if is_constraint_violation(&err) || is_cardinality_violation(&err) => {
                    // A conflict outside the declared natural key, or a
                    // same-statement double hit that slipped past the
                    // collapse. Retry row by row so the batch converges and
                    // only genuinely offending rows become rejections.
                    let (upserted, constraint_rejects) = self
                        .commit_rows_individually(
                            handler,
                            load_run_id,
                            staging_run_id,
                            &accepted,
                            &rejections,
                        )
                        .await?;
                    outcome.rows_upserted += upserted;
                    outcome.rows_transformed -= constraint_rejects;
                    outcome.rows_rejected += constraint_rejects;
                    if constraint_rejects > 0 {
                        *outcome
                            .reject_reasons
                            .entry(RejectCategory::DbConstraint.as_str().to_string())
                            .or_default() += constraint_rejects;
                    }
                    outcome.batches += 1;
                    self.checkpoint(outcome, staging_run_id).await;
                    return Ok(BatchEnd::Continue(next_cursor));
                }
                Err(err)
                    if db_error_is_transient(&err) && attempt < self.config.retry.max_retries =>
                {
                    attempt += 1;
                    warn!(
                        extract = handler.extract_type.canonical_name(),
                        attempt,
                        error = %err,
                        "retrying staging batch"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    return Err(EngineError::db(
                        err,
                        ErrorContext::new("staging_upsert").run(load_run_id),
                    ));
                }
            }
        }
    }

    /// Push counter deltas since the previous checkpoint to the staging run.
    async fn checkpoint(&self, outcome: &mut StagingOutcome, staging_run_id: Uuid) {
        let current = [
            outcome.rows_read as i64,
            outcome.rows_transformed as i64,
            outcome.rows_rejected as i64,
            outcome.rows_upserted as i64,
        ];
        let delta: Vec<i64> = current
            .iter()
            .zip(outcome.checkpointed.iter())
            .map(|(now, then)| now - then)
            .collect();

        if let Err(err) = self
            .registry
            .add_staging_run_counts(staging_run_id, delta[0], delta[1], delta[2], delta[3])
            .await
        {
            outcome
                .warnings
                .push(format!("failed to checkpoint staging counters: {err}"));
            return;
        }
        outcome.checkpointed = current;
    }

    async fn fetch_batch(
        &self,
        handler: &ExtractHandler,
        load_run_id: Uuid,
        cursor: i64,
    ) -> Result<Vec<RawRow>> {
        let sql = format!(
            "SELECT id, source_row_number, load_run_file_id, object_version_id, content_hash, {}
             FROM {}
             WHERE load_run_id = $1 AND NOT superseded
               AND load_run_file_id IN (
                   SELECT id FROM etl.load_run_files
                   WHERE load_run_id = $1 AND status = 'processed')
               AND id > $2
             ORDER BY id
             LIMIT $3",
            handler.columns.join(", "),
            handler.landing_table,
        );

        let cursor_err =
            |err| EngineError::db(err, ErrorContext::new("staging_cursor").run(load_run_id));

        let rows = sqlx::query(&sql)
            .bind(load_run_id)
            .bind(cursor)
            .bind(self.config.staging.batch_size as i64)
            .fetch_all(self.registry.pool())
            .await
            .map_err(cursor_err)?;

        rows.into_iter()
            .map(|row| {
                let mut values = Vec::with_capacity(handler.columns.len());
                for column in handler.columns {
                    values.push(row.try_get::<Option<String>, _>(*column).map_err(cursor_err)?);
                }
                Ok(RawRow {
                    cursor: row.try_get("id").map_err(cursor_err)?,
                    source_row_number: row.try_get("source_row_number").map_err(cursor_err)?,
                    load_run_file_id: row.try_get("load_run_file_id").map_err(cursor_err)?,
                    object_version_id: row.try_get("object_version_id").map_err(cursor_err)?,
                    content_hash: row.try_get("content_hash").map_err(cursor_err)?,
                    values,
                })
            })
            .collect()
    }

    /// Upserts plus rejections in one transaction; either everything for the
    /// batch commits or nothing does.
    async fn commit_batch(
        &self,
        handler: &ExtractHandler,
        load_run_id: Uuid,
        accepted: &[AcceptedRow],
        rejections: &[NewRejection],
    ) -> std::result::Result<u64, sqlx::Error> {
        let mut tx = self.registry.pool().begin().await?;

        let mut upserted = 0u64;
        let chunk_size = effective_upsert_chunk(handler);
        for chunk in accepted.chunks(chunk_size.max(1)) {
            let mut builder = build_upsert(handler, load_run_id, chunk);
            let result = builder.build().execute(&mut *tx).await?;
            upserted += result.rows_affected();
        }

        self.registry
            .record_rejections(&mut *tx, rejections)
            .await
            .map_err(|err| match err {
                kahu_repository::RepositoryError::Database(db) => db,
                other => sqlx::Error::Protocol(other.to_string()),
            })?;

        tx.commit().await?;
        Ok(upserted)
    }

    /// Fallback after a constraint violation: apply the batch one row at a
    /// time under savepoints, turning the offending rows into rejections.
    async fn commit_rows_individually(
        &self,
        handler: &ExtractHandler,
        load_run_id: Uuid,
        staging_run_id: Uuid,
        accepted: &[AcceptedRow],
        rejections: &[NewRejection],
    ) -> Result<(u64, u64)> {
        let upsert_err = |err| EngineError::db(err, ErrorContext::new("staging_upsert"));

        let mut tx = self.registry.pool().begin().await.map_err(upsert_err)?;

        let mut upserted = 0u64;
        let mut constraint_rejections = Vec::new();

        for row in accepted {
            sqlx::query("SAVEPOINT staging_row")
                .execute(&mut *tx)
                .await
                .map_err(upsert_err)?;

            let mut builder = build_upsert(handler, load_run_id, std::slice::from_ref(row));
            match builder.build().execute(&mut *tx).await {
                Ok(result) => {
                    upserted += result.rows_affected();
                    sqlx::query("RELEASE SAVEPOINT staging_row")
                        .execute(&mut *tx)
                        .await
                        .map_err(upsert_err)?;
                }
                Err(err) if is_constraint_violation(&err) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT staging_row")
                        .execute(&mut *tx)
                        .await
                        .map_err(upsert_err)?;
                    let field_error = FieldError {
                        column: handler.natural_keys.join(","),
                        category: RejectCategory::DbConstraint,
                        message: err.to_string(),
                    };
                    constraint_rejections.push(build_rejection(
                        handler,
                        staging_run_id,
                        row.load_run_file_id,
                        row.source_row_number,
                        &row.raw_values,
                        RejectCategory::DbConstraint,
                        std::slice::from_ref(&field_error),
                    ));
                }
                Err(err) => return Err(upsert_err(err)),
            }
        }

        let all_rejections: Vec<NewRejection> = rejections
            .iter()
            .chain(constraint_rejections.iter())
            .cloned()
            .collect();
        self.registry
            .record_rejections(&mut *tx, &all_rejections)
            .await?;

        tx.commit().await.map_err(upsert_err)?;
        Ok((upserted, constraint_rejections.len() as u64))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_rejection(
    handler: &ExtractHandler,
    staging_run_id: Uuid,
    load_run_file_id: Uuid,
    source_row_number: i64,
    raw_values: &[Option<String>],
    category: RejectCategory,
    field_errors: &[FieldError],
) -> NewRejection {
    let raw_row: serde_json::Map<String, serde_json::Value> = handler
        .columns
        .iter()
        .zip(raw_values)
        .map(|(column, value)| {
            (
                (*column).to_string(),
                value
                    .clone()
                    .map(serde_json::Value::String)
                    .unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    let reason = field_errors
        .iter()
        .map(|err| format!("{}: {}", err.column, err.message))
        .collect::<Vec<_>>()
        .join("; ");

    NewRejection {
        staging_run_id,
        load_run_file_id,
        source_row_number,
        raw_row: serde_json::Value::Object(raw_row),
        field_errors: serde_json::to_value(field_errors).unwrap_or_else(|_| json!([])),
        category: category.as_str().to_string(),
        reason,
    }
}

/// Collapse accepted rows that share a natural key, keeping the later
/// landing row in place of the earlier one. Upserts stay last-write-wins
/// without ever asking one statement to update the same row twice.
fn collapse_natural_key_duplicates(
    handler: &ExtractHandler,
    accepted: Vec<AcceptedRow>,
) -> (Vec<AcceptedRow>, u64) {
    let key_indexes: Vec<usize> = handler
        .transforms
        .iter()
        .enumerate()
        .filter(|(_, transform)| handler.natural_keys.contains(&transform.target))
        .map(|(index, _)| index)
        .collect();

    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<AcceptedRow> = Vec::with_capacity(accepted.len());
    let mut collapsed = 0u64;

    for row in accepted {
        let key = natural_key_repr(&row, &key_indexes);
        match positions.get(&key) {
            Some(&at) => {
                rows[at] = row;
                collapsed += 1;
            }
            None => {
                positions.insert(key, rows.len());
                rows.push(row);
            }
        }
    }

    (rows, collapsed)
}

fn natural_key_repr(row: &AcceptedRow, key_indexes: &[usize]) -> String {
    let mut repr = String::new();
    for &index in key_indexes {
        match &row.typed[index] {
            TypedValue::Text(text) => repr.push_str(text),
            TypedValue::Integer(n) => repr.push_str(&n.to_string()),
            other => repr.push_str(&format!("{other:?}")),
        }
        // Unit separator keeps ("ab", "c") distinct from ("a", "bc").
        repr.push('\u{1f}');
    }
    repr
}

fn effective_upsert_chunk(handler: &ExtractHandler) -> usize {
    let per_row = handler.transforms.len() + STAGING_LINEAGE.len();
    MAX_BIND_PARAMS / per_row
}

fn build_upsert(
    handler: &ExtractHandler,
    load_run_id: Uuid,
    rows: &[AcceptedRow],
) -> QueryBuilder<'static, sqlx::Postgres> {
    let targets: Vec<&str> = handler
        .transforms
        .iter()
        .map(|transform| transform.target)
        .collect();

    let mut builder: QueryBuilder<'static, sqlx::Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}, {}) ",
        handler.staging_table,
        targets.join(", "),
        STAGING_LINEAGE.join(", "),
    ));

    builder.push_values(rows, |mut binder, row| {
        for value in &row.typed {
            match value {
                TypedValue::Null => {
                    binder.push("NULL");
                }
                TypedValue::Text(text) => {
                    binder.push_bind(text.clone());
                }
                TypedValue::Integer(n) => {
                    binder.push_bind(*n);
                }
                TypedValue::Decimal(literal) => {
                    binder.push_bind(literal.clone());
                    binder.push_unseparated("::numeric");
                }
                TypedValue::Boolean(flag) => {
                    binder.push_bind(*flag);
                }
                TypedValue::Date(date) => {
                    binder.push_bind(*date);
                }
                TypedValue::Timestamp(instant) => {
                    binder.push_bind(*instant);
                }
            }
        }
        binder
            .push_bind(row.object_version_id.clone())
            .push_bind(row.content_hash.clone())
            .push_bind(load_run_id)
            .push_bind(row.load_run_file_id);
    });

    let updates: Vec<String> = targets
        .iter()
        .filter(|target| !handler.natural_keys.contains(*target))
        .chain(STAGING_LINEAGE.iter())
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();

    builder.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {}, staged_at = now()",
        handler.natural_keys.join(", "),
        updates.join(", "),
    ));

    builder
}

fn advisory_key(load_run_id: Uuid, extract: ExtractType) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(load_run_id.as_bytes());
    hasher.update(extract.canonical_name().as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[..8].try_into().expect("digest is long enough"))
}

struct AdvisoryLock {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>>,
    key: i64,
}

impl AdvisoryLock {
    async fn acquire(pool: &PgPool, key: i64) -> std::result::Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query::<sqlx::Postgres>("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(conn.as_mut())
            .await?;
        Ok(Self {
            conn: Some(conn),
            key,
        })
    }

    async fn release(mut self) -> std::result::Result<(), sqlx::Error> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query::<sqlx::Postgres>("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(conn.as_mut())
                .await?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            task::spawn(async move {
                if let Err(err) = sqlx::query::<sqlx::Postgres>("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(conn.as_mut())
                    .await
                {
                    warn!("failed to release staging lock in drop: {err}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kahu_parser::handler_for;

    #[test]
    fn upsert_sql_targets_natural_key_conflict() {
        let handler = handler_for(ExtractType::Patients);
        let row = AcceptedRow {
            typed: handler
                .transforms
                .iter()
                .map(|_| TypedValue::Null)
                .collect(),
            raw_values: vec![None; handler.columns.len()],
            source_row_number: 1,
            load_run_file_id: Uuid::nil(),
            object_version_id: "v1".to_string(),
            content_hash: "hash".to_string(),
        };
        let builder = build_upsert(handler, Uuid::nil(), std::slice::from_ref(&row));
        let sql = builder.sql().to_string();

        assert!(sql.starts_with("INSERT INTO stg.patients (patient_id,"));
        assert!(sql.contains("ON CONFLICT (patient_id, practice_id, per_org_id) DO UPDATE SET"));
        assert!(sql.contains("last_name = EXCLUDED.last_name"));
        assert!(sql.contains("load_run_file_id = EXCLUDED.load_run_file_id"));
        assert!(sql.contains("staged_at = now()"));
        // Natural-key columns are never part of the update list.
        assert!(!sql.contains("patient_id = EXCLUDED.patient_id"));
    }

    fn accepted_patient(patient_id: i64, last_name: &str) -> AcceptedRow {
        let handler = handler_for(ExtractType::Patients);
        let typed: Vec<TypedValue> = handler
            .transforms
            .iter()
            .map(|transform| match transform.target {
                "patient_id" => TypedValue::Integer(patient_id),
                "practice_id" => TypedValue::Text("6545".to_string()),
                "per_org_id" => TypedValue::Text("68514".to_string()),
                "last_name" => TypedValue::Text(last_name.to_string()),
                _ => TypedValue::Null,
            })
            .collect();
        AcceptedRow {
            typed,
            raw_values: vec![None; handler.columns.len()],
            source_row_number: 1,
            load_run_file_id: Uuid::nil(),
            object_version_id: "v1".to_string(),
            content_hash: "hash".to_string(),
        }
    }

    #[test]
    fn natural_key_duplicates_collapse_to_the_later_row() {
        let handler = handler_for(ExtractType::Patients);
        let rows = vec![
            accepted_patient(1, "Older"),
            accepted_patient(2, "Keep"),
            accepted_patient(1, "Newer"),
        ];

        let (collapsed_rows, collapsed) = collapse_natural_key_duplicates(handler, rows);

        assert_eq!(collapsed, 1);
        assert_eq!(collapsed_rows.len(), 2);
        let survivor = &collapsed_rows[0];
        assert_eq!(survivor.typed[0], TypedValue::Integer(1));
        assert_eq!(survivor.typed[5], TypedValue::Text("Newer".to_string()));
        assert_eq!(collapsed_rows[1].typed[0], TypedValue::Integer(2));
    }

    #[test]
    fn distinct_natural_keys_never_collapse() {
        let handler = handler_for(ExtractType::Patients);
        let rows = vec![accepted_patient(1, "A"), accepted_patient(2, "B")];
        let (collapsed_rows, collapsed) = collapse_natural_key_duplicates(handler, rows);
        assert_eq!(collapsed, 0);
        assert_eq!(collapsed_rows.len(), 2);
    }

    #[test]
    fn advisory_keys_differ_by_extract_and_run() {
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        assert_ne!(
            advisory_key(run_a, ExtractType::Patients),
            advisory_key(run_a, ExtractType::Providers)
        );
        assert_ne!(
            advisory_key(run_a, ExtractType::Patients),
            advisory_key(run_b, ExtractType::Patients)
        );
        assert_eq!(
            advisory_key(run_a, ExtractType::Patients),
            advisory_key(run_a, ExtractType::Patients)
        );
    }

    #[test]
    fn rejection_snapshot_preserves_whole_row() {
        let handler = handler_for(ExtractType::Patients);
        let values: Vec<Option<String>> = handler
            .columns
            .iter()
            .enumerate()
            .map(|(i, _)| {
                if i == 1 {
                    None
                } else {
                    Some(format!("value-{i}"))
                }
            })
            .collect();
        let field_error = FieldError {
            column: "nhi_number".to_string(),
            category: RejectCategory::Validation,
            message: "'bogus' is not a valid NHI".to_string(),
        };

        let rejection = build_rejection(
            handler,
            Uuid::nil(),
            Uuid::nil(),
            7,
            &values,
            RejectCategory::Validation,
            std::slice::from_ref(&field_error),
        );

        assert_eq!(rejection.source_row_number, 7);
        assert_eq!(rejection.category, "validation");
        assert_eq!(rejection.raw_row["patient_id"], "value-0");
        assert_eq!(rejection.raw_row["nhi_number"], serde_json::Value::Null);
        assert!(rejection.reason.contains("nhi_number"));
    }
}
