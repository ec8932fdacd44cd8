//! Cancellation before any work starts: no load attempts are claimed, the
//! run finishes as cancelled, and the exit code follows the contract.

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

#[tokio::test]
async fn cancelled_run_claims_nothing() {
    let Some(url) = test_database_url() else {
        return;
    };
    let registry = prepare_registry(&url).await;
    let config = engine_config(&url);

    let store = Arc::new(MemoryBucketStore::new(16));
    store.insert(
        PATIENTS_KEY,
        feed_file(&[patient_row(1, "ZZZ0016", "6545")]),
    );
    store.insert(
        "incoming/685146545Providers202508180544202508190544202508190854.csv",
        feed_file(&["10|~~|6545|~~|68514|~~|MC1234|~~|Hana|~~|Rata|~~|GP|~~|General Practice|~~|2020-01-01|~~||~~|true|~~|2025-08-19 05:44:00".to_string()]),
    );

    let engine = orchestrator(Arc::clone(&store), registry.clone(), config.clone());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true).expect("signal cancel");

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

    assert_eq!(receipt.outcome, RunOutcome::Cancelled);
    assert_eq!(receipt.outcome.exit_code(), 130);
    assert_eq!(receipt.files_processed, 0);
    assert!(receipt.files.is_empty());

    let pool = registry.pool();
    assert_eq!(count(pool, "SELECT COUNT(*) FROM etl.load_run_files").await, 0);
    assert_eq!(count(pool, "SELECT COUNT(*) FROM raw.patients").await, 0);
    assert_eq!(
        count(
            pool,
            "SELECT COUNT(*) FROM etl.load_runs WHERE status = 'cancelled'"
        )
        .await,
        1
    );
}
