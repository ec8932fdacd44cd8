//! Boundary: a zero-row delivery produces a processed attempt with zero
//! counts and no landing rows.

mod common;

use std::sync::Arc;

use kahu_bucket::MemoryBucketStore;
use kahu_processing::discovery::{discover, DiscoveryOptions};
use kahu_processing::orchestrator::RunOutcome;
use kahu_processing::planner::{plan, PlanOptions};
use kahu_repository::FileLoadStatus;
use tokio::sync::watch;

use common::{count, engine_config, orchestrator, prepare_registry, test_database_url};

#[tokio::test]
async fn empty_file_processes_with_zero_counts() {
    let Some(url) = test_database_url() else {
        return;
    };
    let registry = prepare_registry(&url).await;
    let config = engine_config(&url);

    let key = "incoming/685146545Patients202508200544202508210544202508210854.csv";
    let store = Arc::new(MemoryBucketStore::new(8));
    store.insert(key, "");

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

    assert_eq!(receipt.outcome, RunOutcome::Success);
    assert_eq!(receipt.files[0].status, FileLoadStatus::Processed);
    assert_eq!(receipt.files[0].rows_read, 0);
    assert_eq!(
        count(registry.pool(), "SELECT COUNT(*) FROM raw.patients").await,
        0
    );
    assert_eq!(
        count(
            registry.pool(),
            "SELECT COUNT(*) FROM etl.load_run_files WHERE status = 'processed'"
        )
        .await,
        1
    );
}
