//! Raw loader: stream one delivered object through the framer and bulk-load
//! its rows into the landing table for its extract, exactly once per
//! `(object_version_id, content_hash)` identity.

use std::time::{Duration, Instant};

use futures::StreamExt;
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use kahu_bucket::{with_retries, BucketStore};
use kahu_parser::{handler_for, ExtractHandler, Framer};
use kahu_repository::{FileLoadStatus, LoadRunFileRecord, NewLoadRunFile, RunRegistry};

use crate::config::EngineConfig;
use crate::discovery::DiscoveredFile;
use crate::error::{db_error_is_transient, EngineError, ErrorContext, Result};

/// Lineage appended by the loader to every landing row; handlers never
/// declare these.
const LINEAGE_COLUMNS: &[&str] = &[
    "object_key",
    "object_version_id",
    "content_hash",
    "date_extracted",
    "extract_type",
    "file_per_org_id",
    "file_practice_id",
    "load_run_id",
    "load_run_file_id",
    "source_row_number",
];

// Stay well under the Postgres bind-parameter ceiling.
const MAX_BIND_PARAMS: usize = 60_000;
const MAX_RECORDED_ERRORS: usize = 20;

#[derive(Debug)]
pub struct LoadOutcome {
    pub object_key: String,
    pub extract_type: kahu_parser::ExtractType,
    pub status: FileLoadStatus,
    pub load_run_file_id: Option<Uuid>,
    pub rows_read: u64,
    pub rows_ingested: u64,
    pub rows_rejected: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl LoadOutcome {
    fn new(file: &DiscoveredFile) -> Self {
        Self {
            object_key: file.meta.key.clone(),
            extract_type: file.parsed.extract_type,
            status: FileLoadStatus::Pending,
            load_run_file_id: None,
            rows_read: 0,
            rows_ingested: 0,
            rows_rejected: 0,
            successful_batches: 0,
            failed_batches: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn record_error(&mut self, message: String) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(message);
        } else if self.errors.len() == MAX_RECORDED_ERRORS {
            self.errors.push("further errors suppressed".to_string());
        }
    }
}

enum Gate {
    Claimed(LoadRunFileRecord),
    Skip,
}

enum StreamEnd {
    Completed,
    Cancelled,
    Aborted(String),
}

pub struct RawLoader<'a> {
    pub store: &'a dyn BucketStore,
    pub registry: &'a RunRegistry,
    pub config: &'a EngineConfig,
}

impl<'a> RawLoader<'a> {
    /// Load one object end to end. Per-file problems land in the outcome,
    /// never as an `Err`; callers decide run-level policy.
    pub async fn load(
        &self,
        file: &DiscoveredFile,
        load_run_id: Uuid,
        cancel: &watch::Receiver<bool>,
    ) -> LoadOutcome {
        let started = Instant::now();
        let mut outcome = LoadOutcome::new(file);

        if *cancel.borrow() {
            outcome.status = FileLoadStatus::Cancelled;
            outcome
                .warnings
                .push("cancelled before claiming a load attempt".to_string());
            outcome.duration = started.elapsed();
            return outcome;
        }

        let record = match self.gate(file, load_run_id).await {
            Ok(Gate::Claimed(record)) => record,
            Ok(Gate::Skip) => {
                self.record_skip(file, load_run_id, &mut outcome).await;
                outcome.duration = started.elapsed();
                return outcome;
            }
            Err(err) => {
                outcome.status = FileLoadStatus::Failed;
                outcome.record_error(err.to_string());
                outcome.duration = started.elapsed();
                return outcome;
            }
        };
        outcome.load_run_file_id = Some(record.id);
        outcome.status = FileLoadStatus::InProgress;

        let end = self
            .stream_into_landing(file, &record, load_run_id, cancel, &mut outcome)
            .await;

        let (status, detail) = match end {
            Ok(StreamEnd::Completed) => (FileLoadStatus::Processed, None),
            Ok(StreamEnd::Cancelled) => (
                FileLoadStatus::Cancelled,
                Some("cancelled mid-load; buffered rows were not flushed".to_string()),
            ),
            Ok(StreamEnd::Aborted(reason)) => (FileLoadStatus::Failed, Some(reason)),
            Err(err) => (FileLoadStatus::Failed, Some(err.to_string())),
        };

        if let Some(detail) = &detail {
            outcome.record_error(detail.clone());
        }
        outcome.status = status;
        outcome.duration = started.elapsed();

        if let Err(err) = self
            .registry
            .update_load_run_file(
                record.id,
                status,
                outcome.rows_read as i64,
                outcome.rows_ingested as i64,
                outcome.rows_rejected as i64,
                detail.as_deref(),
            )
            .await
        {
            outcome.record_error(format!("failed to finalize load attempt: {err}"));
            outcome.status = FileLoadStatus::Failed;
        }

        info!(
            load_run_id = %load_run_id,
            object_key = %outcome.object_key,
            status = outcome.status.as_str(),
            rows_read = outcome.rows_read,
            rows_ingested = outcome.rows_ingested,
            "raw load finished"
        );
        outcome
    }

    /// The idempotency gate: find or create the load attempt for this
    /// object's identity.
    async fn gate(&self, file: &DiscoveredFile, load_run_id: Uuid) -> Result<Gate> {
        let version_id = file.version_id();
        let hash = &file.identity_hash;

        if let Some(existing) = self
            .registry
            .find_load_run_file_by_identity(version_id, hash)
            .await?
        {
            return self.gate_existing(file, load_run_id, existing).await;
        }

        let new = NewLoadRunFile {
            load_run_id,
            object_key: file.meta.key.clone(),
            object_version_id: version_id.to_string(),
            content_hash: hash.clone(),
            extract_type: file.parsed.extract_type.canonical_name().to_string(),
            date_extracted: file.parsed.date_extracted,
            per_org_id: file.parsed.per_org_id.clone(),
            practice_id: file.parsed.practice_id.clone(),
            status: FileLoadStatus::InProgress,
        };
        match self.registry.create_load_run_file(&new).await {
            Ok(record) => Ok(Gate::Claimed(record)),
            Err(kahu_repository::RepositoryError::DuplicateIdentity { .. }) => {
                // Lost the race to another worker; re-read and decide again.
                match self
                    .registry
                    .find_load_run_file_by_identity(version_id, hash)
                    .await?
                {
                    Some(existing) => self.gate_existing(file, load_run_id, existing).await,
                    None => Ok(Gate::Skip),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn gate_existing(
        &self,
        file: &DiscoveredFile,
        load_run_id: Uuid,
        existing: LoadRunFileRecord,
    ) -> Result<Gate> {
        if existing.status == FileLoadStatus::Processed {
            return Ok(Gate::Skip);
        }

        let claimed = self
            .registry
            .claim_load_run_file(
                existing.id,
                load_run_id,
                self.config.raw_loader.stale_claim_secs as f64,
            )
            .await?;

        match claimed {
            Some(record) => {
                // A reclaimed attempt may have landed rows before it died;
                // retire them so the retry starts clean without breaking
                // the append-only landing contract.
                let handler = handler_for(file.parsed.extract_type);
                let retired =
                    supersede_rows(self.registry.pool(), handler, record.id, record.id).await?;
                if retired > 0 {
                    warn!(
                        object_key = %file.meta.key,
                        retired,
                        "superseded rows from a previous attempt"
                    );
                }
                Ok(Gate::Claimed(record))
            }
            None => Ok(Gate::Skip),
        }
    }

    /// Record the skip as its own audit row; counted separately and never an
    /// error.
    async fn record_skip(
        &self,
        file: &DiscoveredFile,
        load_run_id: Uuid,
        outcome: &mut LoadOutcome,
    ) {
        outcome.status = FileLoadStatus::SkippedDuplicate;
        let skip = NewLoadRunFile {
            load_run_id,
            object_key: file.meta.key.clone(),
            object_version_id: file.version_id().to_string(),
            content_hash: file.identity_hash.clone(),
            extract_type: file.parsed.extract_type.canonical_name().to_string(),
            date_extracted: file.parsed.date_extracted,
            per_org_id: file.parsed.per_org_id.clone(),
            practice_id: file.parsed.practice_id.clone(),
            status: FileLoadStatus::SkippedDuplicate,
        };
        match self.registry.create_load_run_file(&skip).await {
            Ok(record) => outcome.load_run_file_id = Some(record.id),
            Err(err) => outcome.record_error(format!("failed to record skip: {err}")),
        }
    }

    async fn stream_into_landing(
        &self,
        file: &DiscoveredFile,
        record: &LoadRunFileRecord,
        load_run_id: Uuid,
        cancel: &watch::Receiver<bool>,
        outcome: &mut LoadOutcome,
    ) -> Result<StreamEnd> {
        let handler = handler_for(file.parsed.extract_type);
        let expected = handler.column_count();
        let continue_on_error = self.config.raw_loader.continue_on_error;

        let flush_rows = self.effective_batch_size(handler);
        let flush_bytes = self.config.raw_loader.max_memory_mb * 1024 * 1024;

        let mut stream = with_retries(
            self.config.object_store.retry_attempts,
            self.config.retry_delay(),
            || self.store.open_stream(&file.meta.key),
        )
        .await
        .map_err(|err| {
            EngineError::store(
                err,
                ErrorContext::new("open_stream")
                    .run(load_run_id)
                    .key(&file.meta.key),
            )
        })?;

        let mut framer = Framer::new();
        let mut framed: Vec<Vec<String>> = Vec::new();
        let mut buffer: Vec<(u64, Vec<String>)> = Vec::with_capacity(flush_rows);
        let mut buffered_bytes = 0usize;

        loop {
            if *cancel.borrow() {
                return Ok(StreamEnd::Cancelled);
            }

            let chunk = match stream.next().await {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(err)) => {
                    return Err(EngineError::store(
                        err,
                        ErrorContext::new("read")
                            .run(load_run_id)
                            .key(&file.meta.key)
                            .row(outcome.rows_read),
                    ));
                }
                None => None,
            };

            match &chunk {
                Some(bytes) => framer.push(bytes, &mut framed).map_err(|err| {
                    EngineError::ParseStructural {
                        message: err.to_string(),
                        context: ErrorContext::new("frame")
                            .run(load_run_id)
                            .key(&file.meta.key)
                            .row(outcome.rows_read),
                    }
                })?,
                None => {
                    let tail = framer.finish().map_err(|err| EngineError::ParseStructural {
                        message: err.to_string(),
                        context: ErrorContext::new("frame")
                            .run(load_run_id)
                            .key(&file.meta.key)
                            .row(outcome.rows_read),
                    })?;
                    framed.extend(tail);
                    framer = Framer::new();
                }
            }

            for fields in framed.drain(..) {
                outcome.rows_read += 1;
                if fields.len() != expected {
                    outcome.rows_rejected += 1;
                    outcome.record_error(format!(
                        "row {}: expected {expected} fields, found {}",
                        outcome.rows_read,
                        fields.len()
                    ));
                    if continue_on_error {
                        continue;
                    }
                    return Ok(StreamEnd::Aborted(format!(
                        "structural error at row {}: expected {expected} fields, found {}",
                        outcome.rows_read,
                        fields.len()
                    )));
                }

                buffered_bytes += fields.iter().map(String::len).sum::<usize>();
                buffer.push((outcome.rows_read, fields));

                if buffer.len() >= flush_rows || buffered_bytes >= flush_bytes {
                    if let Err(err) = self
                        .flush(handler, file, record.id, load_run_id, &mut buffer, outcome)
                        .await
                    {
                        if !continue_on_error {
                            return Ok(StreamEnd::Aborted(err.to_string()));
                        }
                    }
                    buffered_bytes = 0;
                }
            }

            if chunk.is_none() {
                break;
            }
        }

        if *cancel.borrow() {
            return Ok(StreamEnd::Cancelled);
        }

        if let Err(err) = self
            .flush(handler, file, record.id, load_run_id, &mut buffer, outcome)
            .await
        {
            if !continue_on_error {
                return Ok(StreamEnd::Aborted(err.to_string()));
            }
        }

        Ok(StreamEnd::Completed)
    }

    fn effective_batch_size(&self, handler: &ExtractHandler) -> usize {
        let per_row = handler.column_count() + LINEAGE_COLUMNS.len();
        self.config
            .raw_loader
            .batch_size
            .min(MAX_BIND_PARAMS / per_row)
            .max(1)
    }

    /// One buffer, one atomic bulk insert. Transient failures retry with
    /// backoff; a terminal failure drops the buffer and counts its rows.
    async fn flush(
        &self,
        handler: &ExtractHandler,
        file: &DiscoveredFile,
        load_run_file_id: Uuid,
        load_run_id: Uuid,
        buffer: &mut Vec<(u64, Vec<String>)>,
        outcome: &mut LoadOutcome,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        let mut delay = self.config.retry_delay();
        loop {
            match self
                .insert_batch(handler, file, load_run_file_id, load_run_id, buffer)
                .await
            {
                Ok(()) => {
                    outcome.successful_batches += 1;
                    outcome.rows_ingested += buffer.len() as u64;
                    buffer.clear();
                    return Ok(());
                }
                Err(err) if db_error_is_transient(&err) && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        object_key = %file.meta.key,
                        attempt,
                        error = %err,
                        "retrying landing batch insert"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    outcome.failed_batches += 1;
                    outcome.rows_rejected += buffer.len() as u64;
                    outcome.record_error(format!(
                        "batch of {} rows failed: {err}",
                        buffer.len()
                    ));
                    buffer.clear();
                    return Err(EngineError::db(
                        err,
                        ErrorContext::new("landing_insert")
                            .run(load_run_id)
                            .key(&file.meta.key),
                    ));
                }
            }
        }
    }

    async fn insert_batch(
        &self,
        handler: &ExtractHandler,
        file: &DiscoveredFile,
        load_run_file_id: Uuid,
        load_run_id: Uuid,
        buffer: &[(u64, Vec<String>)],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, {}) ",
            handler.landing_table,
            handler.columns.join(", "),
            LINEAGE_COLUMNS.join(", "),
        ));

        builder.push_values(buffer, |mut binder, (row_number, fields)| {
            for field in fields {
                binder.push_bind(field.clone());
            }
            binder
                .push_bind(file.meta.key.clone())
                .push_bind(file.version_id().to_string())
                .push_bind(file.identity_hash.clone())
                .push_bind(file.parsed.date_extracted)
                .push_bind(file.parsed.extract_type.canonical_name())
                .push_bind(file.parsed.per_org_id.clone())
                .push_bind(file.parsed.practice_id.clone())
                .push_bind(load_run_id)
                .push_bind(load_run_file_id)
                .push_bind(*row_number as i64);
        });

        builder.build().execute(self.registry.pool()).await?;
        Ok(())
    }
}

/// Retire landing rows for a load attempt, recording what superseded them.
/// This is the reprocessing hook; policy around when to call it lives with
/// the caller.
pub async fn supersede_rows(
    pool: &PgPool,
    handler: &ExtractHandler,
    load_run_file_id: Uuid,
    superseded_by: Uuid,
) -> Result<u64> {
    let result = sqlx::query(&format!(
        "UPDATE {} SET superseded = true, superseded_at = now(), superseded_by_file_id = $2
         WHERE load_run_file_id = $1 AND NOT superseded",
        handler.landing_table,
    ))
    .bind(load_run_file_id)
    .bind(superseded_by)
    .execute(pool)
    .await
    .map_err(|err| EngineError::db(err, ErrorContext::new("supersede")))?;
    Ok(result.rows_affected())
}
