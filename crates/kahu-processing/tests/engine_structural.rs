//! Structural corruption mid-file with continue_on_error: the bad row is
//! recorded and skipped, and the file still processes.

mod common;

use std::sync::Arc;

use kahu_bucket::MemoryBucketStore;
use kahu_processing::discovery::{discover, DiscoveryOptions};
use kahu_processing::planner::{plan, PlanOptions};
use kahu_repository::FileLoadStatus;
use tokio::sync::watch;

use common::{
    count, engine_config, feed_file, orchestrator, patient_row, prepare_registry,
    test_database_url, PATIENTS_KEY,
};

fn corrupted_feed() -> String {
    let mut rows: Vec<String> = (1..=10)
        .map(|id| patient_row(id, "ZZZ0016", "6545"))
        .collect();
    rows[6] = "only|~~|three|~~|fields".to_string();
    feed_file(&rows)
}

#[tokio::test]
async fn corruption_is_skipped_when_continuing_on_error() {
    let Some(url) = test_database_url() else {
        return;
    };
    let registry = prepare_registry(&url).await;
    let config = engine_config(&url);
    assert!(config.raw_loader.continue_on_error);

    let store = Arc::new(MemoryBucketStore::new(13));
    store.insert(PATIENTS_KEY, corrupted_feed());

    let engine = orchestrator(Arc::clone(&store), registry.clone(), config.clone());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let discovered = discover(store.as_ref(), &config, &DiscoveryOptions::default())
        .await
        .expect("discover");
    let receipt = engine
        .execute(
            plan(discovered.files, &PlanOptions::default()),
            false,
            cancel_rx,
        )
        .await
        .expect("run");

    let report = &receipt.files[0];
    assert_eq!(report.status, FileLoadStatus::Processed);
    assert_eq!(report.rows_read, 10);
    assert_eq!(report.rows_ingested, 9);
    assert_eq!(report.rows_rejected, 1);
    assert!(report.errors.iter().any(|err| err.contains("row 7")));

    assert_eq!(
        count(registry.pool(), "SELECT COUNT(*) FROM raw.patients").await,
        9
    );
}
