//! Discovery: enumerate the delivery prefix, decode file names, and compute
//! the per-object identity hash. Read-only; the run registry is never
//! touched here.

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use kahu_bucket::{with_retries, BucketError, BucketStore, ObjectMeta};
use kahu_parser::{parse_object_key, ExtractType, FullLoadRule, ParsedFilename};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorContext, Result};

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub extract_types: Option<Vec<ExtractType>>,
    /// Window on the feed-local `date_extracted`.
    pub extracted_after: Option<NaiveDateTime>,
    pub extracted_before: Option<NaiveDateTime>,
    pub max_files: Option<usize>,
}

/// One remote object considered for ingestion.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub bucket: String,
    pub meta: ObjectMeta,
    pub parsed: ParsedFilename,
    pub identity_hash: String,
}

impl DiscoveredFile {
    /// The version identity recorded against the load attempt. Stores
    /// without versioning enabled fall back to the etag.
    pub fn version_id(&self) -> &str {
        self.meta.version_id.as_deref().unwrap_or(&self.meta.etag)
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub files: Vec<DiscoveredFile>,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

/// Stable identity over everything that changes when an object is replaced.
pub fn identity_hash(meta: &ObjectMeta) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meta.key.as_bytes());
    hasher.update(b"|");
    hasher.update(meta.size.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(meta.etag.as_bytes());
    hasher.update(b"|");
    hasher.update(meta.last_modified.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub async fn discover(
    store: &dyn BucketStore,
    config: &EngineConfig,
    options: &DiscoveryOptions,
) -> Result<DiscoveryOutcome> {
    let rule: FullLoadRule = config.engine.full_load_rule;
    let bucket = config.object_store.bucket.clone();
    let prefix = config.object_store.prefix.as_str();

    let listed = with_retries(
        config.object_store.retry_attempts,
        config.retry_delay(),
        || store.list(prefix),
    )
    .await
    .map_err(|err| EngineError::store(err, ErrorContext::new("list").key(prefix)))?;

    debug!(count = listed.len(), prefix, "listed candidate objects");

    let mut outcome = DiscoveryOutcome::default();

    // Pass one: decode names and filter, without touching the store again.
    let mut candidates: Vec<(ObjectMeta, ParsedFilename)> = Vec::new();
    for meta in listed {
        if let Some(max) = options.max_files {
            if candidates.len() >= max {
                break;
            }
        }

        if meta.key.ends_with('/') || !meta.key.ends_with(".csv") {
            outcome.skipped += 1;
            continue;
        }

        let parsed = match parse_object_key(&meta.key, rule) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(key = %meta.key, error = %err, "skipping object with unparseable name");
                outcome
                    .warnings
                    .push(format!("skipped '{}': {err}", meta.key));
                outcome.skipped += 1;
                continue;
            }
        };

        if let Some(filter) = &options.extract_types {
            if !filter.contains(&parsed.extract_type) {
                outcome.skipped += 1;
                continue;
            }
        }
        if let Some(after) = options.extracted_after {
            if parsed.date_extracted < after {
                outcome.skipped += 1;
                continue;
            }
        }
        if let Some(before) = options.extracted_before {
            if parsed.date_extracted > before {
                outcome.skipped += 1;
                continue;
            }
        }

        candidates.push((meta, parsed));
    }

    // Pass two: listings carry no version ids, so head each candidate (and
    // optionally re-check the etag), a page at a time with bounded fan-out.
    for page in candidates.chunks(config.discovery.batch_size.max(1)) {
        let enriched: Vec<Result<Enriched>> = stream::iter(page.iter().map(|(meta, _)| {
            let meta = meta.clone();
            async move {
                if meta.version_id.is_some() && !config.discovery.validate_hashes {
                    return Ok(Enriched::Kept(meta));
                }
                match with_retries(
                    config.object_store.retry_attempts,
                    config.retry_delay(),
                    || store.head(&meta.key),
                )
                .await
                {
                    Ok(headed) => {
                        if config.discovery.validate_hashes && headed.etag != meta.etag {
                            Ok(Enriched::Dropped(Some(format!(
                                "skipped '{}': object changed between list and head",
                                meta.key
                            ))))
                        } else {
                            Ok(Enriched::Kept(headed))
                        }
                    }
                    // Deleted between list and head; not our problem.
                    Err(BucketError::NotFound(_)) => Ok(Enriched::Dropped(None)),
                    Err(err) => Err(EngineError::store(
                        err,
                        ErrorContext::new("head").key(&meta.key),
                    )),
                }
            }
        }))
        .buffered(config.object_store.max_concurrency.max(1))
        .collect()
        .await;

        for ((_, parsed), enriched) in page.iter().zip(enriched) {
            match enriched? {
                Enriched::Kept(meta) => {
                    let identity_hash = identity_hash(&meta);
                    outcome.files.push(DiscoveredFile {
                        bucket: bucket.clone(),
                        meta,
                        parsed: parsed.clone(),
                        identity_hash,
                    });
                }
                Enriched::Dropped(warning) => {
                    outcome.skipped += 1;
                    outcome.warnings.extend(warning);
                }
            }
        }
    }

    Ok(outcome)
}

enum Enriched {
    Kept(ObjectMeta),
    Dropped(Option<String>),
}
