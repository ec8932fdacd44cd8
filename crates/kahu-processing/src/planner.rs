//! Batch planner: group discovered files into delivery batches, order the
//! batches and the extracts inside them, and emit the flat processing order
//! the orchestrator consumes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDateTime;
use serde::Serialize;

use kahu_parser::ExtractType;

use crate::discovery::DiscoveredFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrdering {
    /// Newest batch first; the normal scheduled mode.
    #[default]
    Latest,
    /// Oldest batch first, for catching up a gap.
    Backfill,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub ordering: BatchOrdering,
    pub priority_extracts: Vec<ExtractType>,
    pub max_batches: Option<usize>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            ordering: BatchOrdering::default(),
            priority_extracts: vec![
                ExtractType::Patients,
                ExtractType::Providers,
                ExtractType::Appointments,
            ],
            max_batches: None,
        }
    }
}

/// Files sharing one `date_extracted` value, i.e. one delivery cycle.
#[derive(Debug, Clone)]
pub struct FileBatch {
    pub batch_id: String,
    pub date_extracted: NaiveDateTime,
    pub files: Vec<PlannedFile>,
    pub extract_types: BTreeSet<ExtractType>,
    pub total_bytes: i64,
    /// True when every priority extract is present in the batch.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub batch_id: String,
    /// Position in the intra-batch ordering; lower ranks start first.
    pub priority_rank: usize,
    pub file: DiscoveredFile,
}

#[derive(Debug, Default)]
pub struct ProcessingPlan {
    pub batches: Vec<FileBatch>,
    /// Flat order preserving both the batch sort and the intra-batch
    /// priority sort.
    pub processing_order: Vec<PlannedFile>,
    /// Extract-level dependency edges signalled downstream: each extract
    /// waits on the priority extracts ranked before it.
    pub dependencies: BTreeMap<ExtractType, Vec<ExtractType>>,
    pub total_files: usize,
    pub total_bytes: i64,
    pub warnings: Vec<String>,
}

impl ProcessingPlan {
    pub fn is_empty(&self) -> bool {
        self.processing_order.is_empty()
    }
}

fn priority_rank(extract: ExtractType, priority: &[ExtractType]) -> usize {
    priority
        .iter()
        .position(|candidate| *candidate == extract)
        .unwrap_or_else(|| {
            let registry_position = ExtractType::ALL
                .iter()
                .position(|candidate| *candidate == extract)
                .unwrap_or(ExtractType::ALL.len());
            priority.len() + registry_position
        })
}

pub fn plan(files: Vec<DiscoveredFile>, options: &PlanOptions) -> ProcessingPlan {
    let mut plan = ProcessingPlan::default();

    if files.is_empty() {
        plan.warnings.push("plan is empty".to_string());
        return plan;
    }

    // Overlapping discoveries show up as repeated identity pairs. The raw
    // loader will skip them; the planner calls them out.
    let mut seen_identities = HashSet::new();
    for file in &files {
        let identity = (file.version_id().to_string(), file.identity_hash.clone());
        if !seen_identities.insert(identity) {
            plan.warnings.push(format!(
                "duplicate identity for '{}' in plan; the later copy will be skipped",
                file.meta.key
            ));
        }
    }

    let mut grouped: BTreeMap<NaiveDateTime, Vec<DiscoveredFile>> = BTreeMap::new();
    for file in files {
        grouped
            .entry(file.parsed.date_extracted)
            .or_default()
            .push(file);
    }

    let mut batches: Vec<FileBatch> = grouped
        .into_iter()
        .map(|(date_extracted, members)| build_batch(date_extracted, members, options, &mut plan.warnings))
        .collect();

    if options.ordering == BatchOrdering::Latest {
        batches.reverse();
    }
    if let Some(max) = options.max_batches {
        batches.truncate(max);
    }

    for batch in &batches {
        plan.total_files += batch.files.len();
        plan.total_bytes += batch.total_bytes;
        plan.processing_order.extend(batch.files.iter().cloned());
        for extract in &batch.extract_types {
            plan.dependencies.entry(*extract).or_insert_with(|| {
                let rank = priority_rank(*extract, &options.priority_extracts);
                options
                    .priority_extracts
                    .iter()
                    .copied()
                    .filter(|candidate| {
                        priority_rank(*candidate, &options.priority_extracts) < rank
                    })
                    .collect()
            });
        }
    }

    plan.batches = batches;
    plan
}

fn build_batch(
    date_extracted: NaiveDateTime,
    members: Vec<DiscoveredFile>,
    options: &PlanOptions,
    warnings: &mut Vec<String>,
) -> FileBatch {
    let batch_id = members[0].parsed.batch_id.clone();
    let extract_types: BTreeSet<ExtractType> = members
        .iter()
        .map(|file| file.parsed.extract_type)
        .collect();
    let total_bytes = members.iter().map(|file| file.meta.size).sum();

    let missing: Vec<&str> = options
        .priority_extracts
        .iter()
        .filter(|extract| !extract_types.contains(extract))
        .map(|extract| extract.canonical_name())
        .collect();
    let complete = missing.is_empty();
    if !complete {
        warnings.push(format!(
            "batch {batch_id} is missing priority extracts: {}",
            missing.join(", ")
        ));
    }

    let mut files: Vec<PlannedFile> = members
        .into_iter()
        .map(|file| PlannedFile {
            batch_id: batch_id.clone(),
            priority_rank: priority_rank(file.parsed.extract_type, &options.priority_extracts),
            file,
        })
        .collect();
    files.sort_by(|a, b| {
        a.priority_rank
            .cmp(&b.priority_rank)
            .then_with(|| a.file.meta.key.cmp(&b.file.meta.key))
    });

    FileBatch {
        batch_id,
        date_extracted,
        files,
        extract_types,
        total_bytes,
        complete,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use kahu_bucket::ObjectMeta;
    use kahu_parser::{parse_object_key, FullLoadRule};

    use super::*;

    fn file(key: &str, version: &str) -> DiscoveredFile {
        let parsed = parse_object_key(key, FullLoadRule::SnapshotWindow).expect("parse");
        let meta = ObjectMeta {
            key: key.to_string(),
            size: 100,
            last_modified: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            etag: format!("etag-{version}"),
            version_id: Some(version.to_string()),
            checksum: None,
        };
        DiscoveredFile {
            bucket: "kahu-extracts".to_string(),
            identity_hash: format!("hash-{key}-{version}"),
            meta,
            parsed,
        }
    }

    const BATCH_A_PATIENTS: &str = "685146545Patients202508180544202508190544202508190854.csv";
    const BATCH_A_APPTS: &str = "685146545Appointments202508180544202508190544202508190854.csv";
    const BATCH_A_MEDS: &str = "685146545Medications202508180544202508190544202508190854.csv";
    const BATCH_B_PATIENTS: &str = "685146545Patients202508190544202508200544202508200854.csv";

    #[test]
    fn empty_plan_warns() {
        let plan = plan(Vec::new(), &PlanOptions::default());
        assert!(plan.is_empty());
        assert_eq!(plan.warnings, vec!["plan is empty".to_string()]);
    }

    #[test]
    fn groups_by_batch_id_and_orders_by_priority() {
        let plan = plan(
            vec![
                file(BATCH_A_APPTS, "v1"),
                file(BATCH_A_PATIENTS, "v2"),
                file(BATCH_A_MEDS, "v3"),
            ],
            &PlanOptions::default(),
        );

        assert_eq!(plan.batches.len(), 1);
        let batch = &plan.batches[0];
        assert_eq!(batch.batch_id, "2508190854");
        assert!(batch.files.iter().all(|f| f.batch_id == batch.batch_id));

        let order: Vec<ExtractType> = plan
            .processing_order
            .iter()
            .map(|planned| planned.file.parsed.extract_type)
            .collect();
        assert_eq!(
            order,
            vec![
                ExtractType::Patients,
                ExtractType::Appointments,
                ExtractType::Medications,
            ]
        );
    }

    #[test]
    fn latest_puts_newest_batch_first_and_backfill_oldest() {
        let files = vec![file(BATCH_A_PATIENTS, "v1"), file(BATCH_B_PATIENTS, "v2")];

        let latest = plan(files.clone(), &PlanOptions::default());
        assert_eq!(latest.batches[0].batch_id, "2508200854");

        let backfill = plan(
            files,
            &PlanOptions {
                ordering: BatchOrdering::Backfill,
                ..Default::default()
            },
        );
        assert_eq!(backfill.batches[0].batch_id, "2508190854");
    }

    #[test]
    fn max_batches_truncates_after_ordering() {
        let files = vec![file(BATCH_A_PATIENTS, "v1"), file(BATCH_B_PATIENTS, "v2")];
        let plan = plan(
            files,
            &PlanOptions {
                max_batches: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].batch_id, "2508200854");
        assert_eq!(plan.total_files, 1);
    }

    #[test]
    fn warns_on_missing_priority_extract_and_incomplete_batch() {
        let plan = plan(vec![file(BATCH_A_MEDS, "v1")], &PlanOptions::default());
        assert!(!plan.batches[0].complete);
        assert!(plan.warnings[0].contains("missing priority extracts"));
        assert!(plan.warnings[0].contains("Patients"));
    }

    #[test]
    fn warns_on_duplicate_identity() {
        let plan = plan(
            vec![file(BATCH_A_PATIENTS, "v1"), file(BATCH_A_PATIENTS, "v1")],
            &PlanOptions::default(),
        );
        assert!(plan
            .warnings
            .iter()
            .any(|warning| warning.contains("duplicate identity")));
    }

    #[test]
    fn dependencies_point_at_higher_priority_extracts() {
        let plan = plan(
            vec![
                file(BATCH_A_PATIENTS, "v1"),
                file(BATCH_A_APPTS, "v2"),
                file(BATCH_A_MEDS, "v3"),
            ],
            &PlanOptions::default(),
        );

        assert!(plan.dependencies[&ExtractType::Patients].is_empty());
        assert_eq!(
            plan.dependencies[&ExtractType::Appointments],
            vec![ExtractType::Patients, ExtractType::Providers]
        );
        assert_eq!(plan.dependencies[&ExtractType::Medications].len(), 3);
    }
}
