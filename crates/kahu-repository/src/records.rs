//! Audit records persisted in the `etl` schema. Statuses are stored as text
//! and round-trip through the `as_str`/`from_str` pairs below.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduled,
    Manual,
    Recovery,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Scheduled => "scheduled",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Recovery => "recovery",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            "recovery" => Some(Self::Recovery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl LoadRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadRunStatus::Running => "running",
            LoadRunStatus::Completed => "completed",
            LoadRunStatus::Failed => "failed",
            LoadRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadRunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileLoadStatus {
    Pending,
    InProgress,
    Processed,
    Failed,
    SkippedDuplicate,
    Cancelled,
}

impl FileLoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileLoadStatus::Pending => "pending",
            FileLoadStatus::InProgress => "in_progress",
            FileLoadStatus::Processed => "processed",
            FileLoadStatus::Failed => "failed",
            FileLoadStatus::SkippedDuplicate => "skipped_duplicate",
            FileLoadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            "skipped_duplicate" => Some(Self::SkippedDuplicate),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StagingRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StagingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingRunStatus::Running => "running",
            StagingRunStatus::Completed => "completed",
            StagingRunStatus::Failed => "failed",
            StagingRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadRunRecord {
    pub id: Uuid,
    pub triggered_by: TriggeredBy,
    pub status: LoadRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_ingested: i64,
    pub rows_rejected: i64,
    pub files_processed: i64,
    pub files_failed: i64,
    pub files_skipped: i64,
    pub notes: Option<String>,
}

/// Input for a fresh file attempt. The `(object_version_id, content_hash)`
/// pair is the engine's idempotency key and is unique across all runs.
#[derive(Debug, Clone)]
pub struct NewLoadRunFile {
    pub load_run_id: Uuid,
    pub object_key: String,
    pub object_version_id: String,
    pub content_hash: String,
    pub extract_type: String,
    pub date_extracted: NaiveDateTime,
    pub per_org_id: String,
    pub practice_id: String,
    pub status: FileLoadStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadRunFileRecord {
    pub id: Uuid,
    pub load_run_id: Uuid,
    pub object_key: String,
    pub object_version_id: String,
    pub content_hash: String,
    pub extract_type: String,
    pub date_extracted: NaiveDateTime,
    pub per_org_id: String,
    pub practice_id: String,
    pub status: FileLoadStatus,
    pub rows_read: i64,
    pub rows_ingested: i64,
    pub rows_rejected: i64,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StagingRunRecord {
    pub id: Uuid,
    pub load_run_id: Uuid,
    pub extract_type: String,
    pub status: StagingRunStatus,
    pub rows_read: i64,
    pub rows_transformed: i64,
    pub rows_rejected: i64,
    pub rows_upserted: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

/// One landing row that failed staging transformation, preserved whole.
#[derive(Debug, Clone, Serialize)]
pub struct NewRejection {
    pub staging_run_id: Uuid,
    pub load_run_file_id: Uuid,
    pub source_row_number: i64,
    pub raw_row: Value,
    pub field_errors: Value,
    pub category: String,
    pub reason: String,
}
