#![allow(dead_code)]

use std::env;
use std::sync::Arc;

use kahu_bucket::{BucketStore, MemoryBucketStore};
use kahu_processing::orchestrator::Orchestrator;
use kahu_processing::EngineConfig;
use kahu_repository::RunRegistry;

pub const PATIENTS_KEY: &str =
    "incoming/685146545Patients202508180544202508190544202508190854.csv";

/// Connection string for an empty throwaway database, or `None` to skip.
pub fn test_database_url() -> Option<String> {
    match env::var("KAHU_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("skipping: KAHU_TEST_DATABASE_URL is not set");
            None
        }
    }
}

pub async fn prepare_registry(url: &str) -> RunRegistry {
    let registry = RunRegistry::connect(url, 12).await.expect("connect");
    registry.run_migrations().await.expect("migrate");
    sqlx::query(
        "TRUNCATE TABLE etl.rejections, etl.health, etl.config, etl.dq_results,
         etl.staging_runs, etl.load_run_files, etl.load_runs,
         raw.patients, raw.providers, raw.appointments, raw.immunisations,
         raw.diagnoses, raw.medications,
         stg.patients, stg.providers, stg.appointments, stg.immunisations,
         stg.diagnoses, stg.medications CASCADE",
    )
    .execute(registry.pool())
    .await
    .expect("truncate");
    registry
}

pub fn engine_config(url: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.database.url = Some(url.to_string());
    config
}

pub fn orchestrator(
    store: Arc<MemoryBucketStore>,
    registry: RunRegistry,
    config: EngineConfig,
) -> Orchestrator {
    Orchestrator {
        store: store as Arc<dyn BucketStore>,
        registry: Arc::new(registry),
        config: Arc::new(config),
    }
}

/// One well-formed patients row in landing column order.
pub fn patient_row(patient_id: i64, nhi: &str, practice_id: &str) -> String {
    [
        patient_id.to_string(),
        nhi.to_string(),
        practice_id.to_string(),
        "68514".to_string(),
        "Aroha".to_string(),
        format!("Smith{patient_id}"),
        "1980-01-01".to_string(),
        "F".to_string(),
        String::new(),
        "0211234567".to_string(),
        "12 High St".to_string(),
        "Newtown".to_string(),
        "Wellington".to_string(),
        "6021".to_string(),
        "2019-07-01".to_string(),
        "false".to_string(),
        "2025-08-19 05:44:00".to_string(),
    ]
    .join("|~~|")
}

pub fn feed_file(rows: &[String]) -> String {
    let mut content = rows.join("|^^|");
    if !content.is_empty() {
        content.push_str("|^^|");
    }
    content
}

pub async fn count(pool: &sqlx::PgPool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.expect("count")
}
