//! Batch priority: within one delivery batch, priority extracts load before
//! the rest, and each extract stages once its own raw load finishes.

mod common;

use std::sync::Arc;

use kahu_bucket::MemoryBucketStore;
use kahu_processing::discovery::{discover, DiscoveryOptions};
use kahu_processing::orchestrator::RunOutcome;
use kahu_processing::planner::{plan, PlanOptions};
use tokio::sync::watch;

use common::{
    count, engine_config, feed_file, orchestrator, patient_row, prepare_registry,
    test_database_url, PATIENTS_KEY,
};

const APPOINTMENTS_KEY: &str =
    "incoming/685146545Appointments202508180544202508190544202508190854.csv";

fn appointment_row(appointment_id: i64) -> String {
    [
        appointment_id.to_string(),
        "1".to_string(),
        "10".to_string(),
        "6545".to_string(),
        "68514".to_string(),
        "2025-08-18 09:00:00".to_string(),
        "15".to_string(),
        "COMPLETED".to_string(),
        String::new(),
        "49.50".to_string(),
        String::new(),
        "false".to_string(),
        "2025-08-19 05:44:00".to_string(),
    ]
    .join("|~~|")
}

#[tokio::test]
async fn patients_load_before_appointments_in_one_batch() {
    let Some(url) = test_database_url() else {
        return;
    };
    let registry = prepare_registry(&url).await;
    let config = engine_config(&url);

    let store = Arc::new(MemoryBucketStore::new(9));
    store.insert(
        PATIENTS_KEY,
        feed_file(&[patient_row(1, "ZZZ0016", "6545")]),
    );
    store.insert(
        APPOINTMENTS_KEY,
        feed_file(&[appointment_row(100), appointment_row(101)]),
    );

    let engine = orchestrator(Arc::clone(&store), registry.clone(), config.clone());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let discovered = discover(store.as_ref(), &config, &DiscoveryOptions::default())
        .await
        .expect("discover");
    let built = plan(discovered.files, &PlanOptions::default());
    assert_eq!(built.batches.len(), 1);
    assert_eq!(
        built.processing_order[0].file.parsed.extract_type.canonical_name(),
        "Patients"
    );

    let receipt = engine.execute(built, false, cancel_rx).await.expect("run");

    assert_eq!(receipt.outcome, RunOutcome::Success);
    assert_eq!(receipt.files_processed, 2);
    // Same-priority groups are awaited in order, so the patients report
    // always lands first.
    assert_eq!(receipt.files[0].extract_type, "Patients");
    assert_eq!(receipt.files[1].extract_type, "Appointments");

    let pool = registry.pool();
    assert_eq!(count(pool, "SELECT COUNT(*) FROM stg.patients").await, 1);
    assert_eq!(count(pool, "SELECT COUNT(*) FROM stg.appointments").await, 2);
    assert_eq!(
        count(
            pool,
            "SELECT COUNT(*) FROM stg.appointments WHERE billed_amount = 49.50"
        )
        .await,
        2
    );
    assert_eq!(
        count(
            pool,
            "SELECT COUNT(*) FROM etl.staging_runs WHERE status = 'completed'"
        )
        .await,
        2
    );
}
