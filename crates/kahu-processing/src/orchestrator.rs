//! Orchestrator: drive discovery output through raw loading and staging with
//! bounded worker pools, then finalize the run and its summary. Per-file and
//! per-extract problems stay in their workers; this layer only decides the
//! run's terminal status.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use kahu_bucket::BucketStore;
use kahu_parser::{handler_for, validate_registry, ExtractType};
use kahu_repository::{FileLoadStatus, LoadRunStatus, NewLoadRunFile, RunRegistry, StagingRunStatus, TriggeredBy};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::planner::{PlannedFile, ProcessingPlan};
use crate::raw_loader::{LoadOutcome, RawLoader};
use crate::staging::{StagingOutcome, StagingTransformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl RunOutcome {
    /// Process exit code contract; configuration errors exit 1 before a run
    /// exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::CompletedWithFailures => 2,
            RunOutcome::Failed => 3,
            RunOutcome::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub object_key: String,
    pub extract_type: String,
    pub status: FileLoadStatus,
    pub rows_read: u64,
    pub rows_ingested: u64,
    pub rows_rejected: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractSummary {
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub rows_read: u64,
    pub rows_ingested: u64,
    pub rows_transformed: u64,
    pub rows_rejected: u64,
    pub rows_upserted: u64,
    pub top_reject_reasons: Vec<(String, u64)>,
}

#[derive(Debug, Serialize)]
pub struct RunReceipt {
    pub load_run_id: Option<Uuid>,
    pub dry_run: bool,
    pub triggered_by: TriggeredBy,
    pub status: LoadRunStatus,
    pub outcome: RunOutcome,
    pub files: Vec<FileReport>,
    pub extracts: BTreeMap<String, ExtractSummary>,
    pub files_total: usize,
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub rows_ingested: u64,
    pub rows_rejected: u64,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

pub struct Orchestrator {
    pub store: Arc<dyn BucketStore>,
    pub registry: Arc<RunRegistry>,
    pub config: Arc<EngineConfig>,
}

impl Orchestrator {
    /// Execute a processing plan end to end. Configuration problems surface
    /// as `Err` before any run row exists; everything after that lands in
    /// the receipt.
    pub async fn execute(
        &self,
        plan: ProcessingPlan,
        dry_run: bool,
        external_cancel: watch::Receiver<bool>,
    ) -> Result<RunReceipt> {
        let started = Instant::now();
        self.config.validate()?;
        validate_registry()?;

        let triggered_by = self.config.engine.triggered_by;

        if dry_run {
            return self.execute_dry_run(plan, triggered_by, started).await;
        }

        let run = self
            .registry
            .create_load_run(triggered_by, Some("kahu ingestion run"))
            .await?;
        let load_run_id = run.id;
        info!(load_run_id = %load_run_id, files = plan.total_files, "created load run");

        if let Err(err) = self
            .registry
            .record_config_snapshot(load_run_id, &self.config.snapshot())
            .await
        {
            warn!(load_run_id = %load_run_id, error = %err, "failed to snapshot config");
        }

        // One cancel signal feeds every worker: external cancellation and
        // the per-run deadline both flip it.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let forwarder = spawn_cancel_forwarder(external_cancel.clone(), Arc::clone(&cancel_tx));
        let deadline = self
            .config
            .processing
            .processing_timeout_ms
            .map(|millis| spawn_deadline(Duration::from_millis(millis), Arc::clone(&cancel_tx)));

        let receipt = self
            .run_pipeline(plan, load_run_id, triggered_by, cancel_rx, started)
            .await;

        forwarder.abort();
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(err) => {
                // Never leave a run dangling in 'running'.
                let _ = self
                    .registry
                    .finalize_load_run(load_run_id, LoadRunStatus::Failed, Some(&err.to_string()))
                    .await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .registry
            .record_health(load_run_id, &serde_json::to_value(&receipt).unwrap_or_default())
            .await
        {
            warn!(load_run_id = %load_run_id, error = %err, "failed to record run summary");
        }

        if let Err(err) = self
            .registry
            .finalize_load_run(load_run_id, receipt.status, receipt_note(&receipt).as_deref())
            .await
        {
            error!(load_run_id = %load_run_id, error = %err, "failed to finalize load run");
        }

        Ok(receipt)
    }

    /// Preview mode: the plan is recorded as pending attempts and nothing
    /// touches the landing or staging zones.
    async fn execute_dry_run(
        &self,
        plan: ProcessingPlan,
        triggered_by: TriggeredBy,
        started: Instant,
    ) -> Result<RunReceipt> {
        let run = self
            .registry
            .create_load_run(triggered_by, Some("dry-run preview"))
            .await?;

        let mut files = Vec::with_capacity(plan.processing_order.len());
        for planned in &plan.processing_order {
            let file = &planned.file;
            let new = NewLoadRunFile {
                load_run_id: run.id,
                object_key: file.meta.key.clone(),
                object_version_id: file.version_id().to_string(),
                content_hash: file.identity_hash.clone(),
                extract_type: file.parsed.extract_type.canonical_name().to_string(),
                date_extracted: file.parsed.date_extracted,
                per_org_id: file.parsed.per_org_id.clone(),
                practice_id: file.parsed.practice_id.clone(),
                status: FileLoadStatus::Pending,
            };
            let status = match self.registry.create_load_run_file(&new).await {
                Ok(_) => FileLoadStatus::Pending,
                Err(kahu_repository::RepositoryError::DuplicateIdentity { .. }) => {
                    FileLoadStatus::SkippedDuplicate
                }
                Err(err) => return Err(err.into()),
            };
            files.push(FileReport {
                object_key: file.meta.key.clone(),
                extract_type: file.parsed.extract_type.canonical_name().to_string(),
                status,
                rows_read: 0,
                rows_ingested: 0,
                rows_rejected: 0,
                errors: Vec::new(),
            });
        }

        self.registry
            .finalize_load_run(run.id, LoadRunStatus::Completed, Some("dry-run preview"))
            .await?;

        Ok(RunReceipt {
            load_run_id: Some(run.id),
            dry_run: true,
            triggered_by,
            status: LoadRunStatus::Completed,
            outcome: RunOutcome::Success,
            files,
            extracts: BTreeMap::new(),
            files_total: plan.total_files,
            files_processed: 0,
            files_failed: 0,
            files_skipped: 0,
            rows_ingested: 0,
            rows_rejected: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            warnings: plan.warnings,
        })
    }

    async fn run_pipeline(
        &self,
        plan: ProcessingPlan,
        load_run_id: Uuid,
        triggered_by: TriggeredBy,
        cancel: watch::Receiver<bool>,
        started: Instant,
    ) -> Result<RunReceipt> {
        let mut extracts: BTreeMap<String, ExtractSummary> = BTreeMap::new();
        let mut files: Vec<FileReport> = Vec::new();
        let mut warnings = plan.warnings.clone();

        let mut remaining: HashMap<ExtractType, usize> = HashMap::new();
        let mut processed_by_extract: HashMap<ExtractType, u64> = HashMap::new();
        for planned in &plan.processing_order {
            *remaining.entry(planned.file.parsed.extract_type).or_default() += 1;
        }

        let files_total = plan.total_files;
        let mut files_processed = 0u64;
        let mut files_failed = 0u64;
        let mut files_skipped = 0u64;
        let mut rows_ingested = 0u64;
        let mut rows_rejected = 0u64;

        let raw_semaphore = Arc::new(Semaphore::new(self.config.processing.max_concurrent_files));
        let staging_semaphore = Arc::new(Semaphore::new(
            self.config.staging.max_concurrent_transforms,
        ));
        let mut staging_set: JoinSet<StagingOutcome> = JoinSet::new();
        let mut threshold_exceeded = false;

        'batches: for batch in &plan.batches {
            let mut by_rank: BTreeMap<usize, Vec<&PlannedFile>> = BTreeMap::new();
            for planned in &batch.files {
                by_rank.entry(planned.priority_rank).or_default().push(planned);
            }

            for (_, group) in by_rank {
                if *cancel.borrow() {
                    warnings.push("run cancelled; remaining files were not claimed".to_string());
                    break 'batches;
                }

                let outcomes = self
                    .load_group(&group, load_run_id, &raw_semaphore, &cancel)
                    .await;

                for outcome in outcomes {
                    let extract = outcome.extract_type;
                    let summary = extracts
                        .entry(extract.canonical_name().to_string())
                        .or_default();
                    summary.rows_read += outcome.rows_read;
                    summary.rows_ingested += outcome.rows_ingested;
                    summary.rows_rejected += outcome.rows_rejected;

                    let (processed_delta, failed_delta, skipped_delta) = match outcome.status {
                        FileLoadStatus::Processed => (1, 0, 0),
                        FileLoadStatus::SkippedDuplicate => (0, 0, 1),
                        FileLoadStatus::Cancelled => (0, 0, 0),
                        _ => (0, 1, 0),
                    };
                    summary.files_processed += processed_delta;
                    summary.files_failed += failed_delta;
                    summary.files_skipped += skipped_delta;
                    files_processed += processed_delta;
                    files_failed += failed_delta;
                    files_skipped += skipped_delta;
                    rows_ingested += outcome.rows_ingested;
                    rows_rejected += outcome.rows_rejected;

                    if outcome.status == FileLoadStatus::Processed {
                        *processed_by_extract.entry(extract).or_default() += 1;
                    }
                    if let Some(count) = remaining.get_mut(&extract) {
                        *count = count.saturating_sub(1);
                    }

                    if let Err(err) = self
                        .registry
                        .add_load_run_counts(
                            load_run_id,
                            outcome.rows_ingested as i64,
                            outcome.rows_rejected as i64,
                            processed_delta as i64,
                            failed_delta as i64,
                            skipped_delta as i64,
                        )
                        .await
                    {
                        warnings.push(format!("failed to update run counters: {err}"));
                    }

                    files.push(FileReport {
                        object_key: outcome.object_key.clone(),
                        extract_type: extract.canonical_name().to_string(),
                        status: outcome.status,
                        rows_read: outcome.rows_read,
                        rows_ingested: outcome.rows_ingested,
                        rows_rejected: outcome.rows_rejected,
                        errors: outcome.errors.clone(),
                    });
                }

                // Staging for an extract may start as soon as its raw loads
                // have all finished, alongside remaining raw work.
                self.spawn_ready_staging(
                    &mut staging_set,
                    &remaining,
                    &mut processed_by_extract,
                    load_run_id,
                    &staging_semaphore,
                    &cancel,
                );

                let failure_ratio = files_failed as f64 / files_total.max(1) as f64;
                if failure_ratio > self.config.raw_loader.error_threshold {
                    threshold_exceeded = true;
                    warnings.push(format!(
                        "aborting run: {files_failed}/{files_total} files failed, over threshold {}",
                        self.config.raw_loader.error_threshold
                    ));
                    break 'batches;
                }
            }
        }

        if !*cancel.borrow() && !threshold_exceeded {
            self.spawn_ready_staging(
                &mut staging_set,
                &remaining,
                &mut processed_by_extract,
                load_run_id,
                &staging_semaphore,
                &cancel,
            );
        }

        // Drain in-flight staging whatever happens next.
        let mut staging_failed = false;
        while let Some(joined) = staging_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    let summary = extracts
                        .entry(outcome.extract_type.canonical_name().to_string())
                        .or_default();
                    summary.rows_transformed += outcome.rows_transformed;
                    summary.rows_upserted += outcome.rows_upserted;
                    summary.rows_rejected += outcome.rows_rejected;
                    rows_rejected += outcome.rows_rejected;

                    let mut reasons: Vec<(String, u64)> = outcome
                        .reject_reasons
                        .iter()
                        .map(|(reason, count)| (reason.clone(), *count))
                        .collect();
                    reasons.sort_by(|a, b| b.1.cmp(&a.1));
                    summary.top_reject_reasons = reasons;

                    if let Err(err) = self
                        .registry
                        .add_load_run_counts(load_run_id, 0, outcome.rows_rejected as i64, 0, 0, 0)
                        .await
                    {
                        warnings.push(format!("failed to update run counters: {err}"));
                    }

                    if outcome.status == StagingRunStatus::Failed {
                        staging_failed = true;
                        warnings.extend(outcome.errors.iter().cloned());
                    }
                }
                Err(err) => {
                    staging_failed = true;
                    warnings.push(format!("staging worker panicked: {err}"));
                }
            }
        }

        let cancelled = *cancel.borrow();
        let (status, outcome) = if cancelled {
            (LoadRunStatus::Cancelled, RunOutcome::Cancelled)
        } else if threshold_exceeded || staging_failed {
            (LoadRunStatus::Failed, RunOutcome::Failed)
        } else if files_failed > 0 {
            (LoadRunStatus::Completed, RunOutcome::CompletedWithFailures)
        } else {
            (LoadRunStatus::Completed, RunOutcome::Success)
        };

        Ok(RunReceipt {
            load_run_id: Some(load_run_id),
            dry_run: false,
            triggered_by,
            status,
            outcome,
            files,
            extracts,
            files_total,
            files_processed,
            files_failed,
            files_skipped,
            rows_ingested,
            rows_rejected,
            duration_ms: started.elapsed().as_millis() as u64,
            warnings,
        })
    }

    /// Load one same-priority group with bounded concurrency, collecting
    /// every outcome before the next group starts.
    async fn load_group(
        &self,
        group: &[&PlannedFile],
        load_run_id: Uuid,
        semaphore: &Arc<Semaphore>,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<LoadOutcome> {
        let mut set: JoinSet<LoadOutcome> = JoinSet::new();

        for planned in group {
            let file = planned.file.clone();
            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let config = Arc::clone(&self.config);
            let semaphore = Arc::clone(semaphore);
            let cancel = cancel.clone();

            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("load semaphore never closes");
                let loader = RawLoader {
                    store: store.as_ref(),
                    registry: registry.as_ref(),
                    config: config.as_ref(),
                };
                loader.load(&file, load_run_id, &cancel).await
            });
        }

        let mut outcomes = Vec::with_capacity(group.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(load_run_id = %load_run_id, error = %err, "file worker panicked");
                }
            }
        }
        outcomes
    }

    /// Start staging for every extract whose raw loads have all finished
    /// and produced at least one processed file.
    fn spawn_ready_staging(
        &self,
        staging_set: &mut JoinSet<StagingOutcome>,
        remaining: &HashMap<ExtractType, usize>,
        processed_by_extract: &mut HashMap<ExtractType, u64>,
        load_run_id: Uuid,
        semaphore: &Arc<Semaphore>,
        cancel: &watch::Receiver<bool>,
    ) {
        let ready: Vec<ExtractType> = processed_by_extract
            .iter()
            .filter(|(extract, processed)| {
                **processed > 0 && remaining.get(*extract).copied().unwrap_or(0) == 0
            })
            .map(|(extract, _)| *extract)
            .collect();

        for extract in ready {
            // Consume the marker so each extract stages exactly once.
            processed_by_extract.remove(&extract);

            let registry = Arc::clone(&self.registry);
            let config = Arc::clone(&self.config);
            let semaphore = Arc::clone(semaphore);
            let cancel = cancel.clone();

            staging_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("staging semaphore never closes");
                let transformer = StagingTransformer {
                    registry: registry.as_ref(),
                    config: config.as_ref(),
                };
                transformer
                    .transform(handler_for(extract), load_run_id, &cancel)
                    .await
            });
        }
    }
}

fn receipt_note(receipt: &RunReceipt) -> Option<String> {
    Some(format!(
        "{} files processed, {} failed, {} skipped; {} rows ingested, {} rejected",
        receipt.files_processed,
        receipt.files_failed,
        receipt.files_skipped,
        receipt.rows_ingested,
        receipt.rows_rejected,
    ))
}

fn spawn_cancel_forwarder(
    mut external: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if *external.borrow() {
            let _ = cancel_tx.send(true);
            return;
        }
        while external.changed().await.is_ok() {
            if *external.borrow() {
                let _ = cancel_tx.send(true);
                break;
            }
        }
    })
}

fn spawn_deadline(
    deadline: Duration,
    cancel_tx: Arc<watch::Sender<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        warn!("run deadline exceeded; cancelling in-flight work");
        let _ = cancel_tx.send(true);
    })
}
