//! End-to-end: rows that fail staging validation are preserved whole in the
//! reject store while clean rows land in staging.

mod common;

use std::sync::Arc;

use kahu_bucket::MemoryBucketStore;
use kahu_processing::discovery::{discover, DiscoveryOptions};
use kahu_processing::orchestrator::RunOutcome;
use kahu_processing::planner::{plan, PlanOptions};
use sqlx::Row;
use tokio::sync::watch;

use common::{
    count, engine_config, feed_file, orchestrator, patient_row, prepare_registry,
    test_database_url, PATIENTS_KEY,
};

#[tokio::test]
async fn partial_rejection_preserves_bad_rows() {
    let Some(url) = test_database_url() else {
        return;
    };
    let registry = prepare_registry(&url).await;
    let mut config = engine_config(&url);
    // Force several staging batches over five rows.
    config.staging.batch_size = 2;

    let bad_nhi = patient_row(4, "AIO1234", "6545"); // I and O are never issued
    let missing_practice = patient_row(5, "ZZZ0099", "   "); // trims to null

    let store = Arc::new(MemoryBucketStore::new(11));
    store.insert(
        PATIENTS_KEY,
        feed_file(&[
            patient_row(1, "ZZZ0016", "6545"),
            patient_row(2, "ZZZ0024", "6545"),
            bad_nhi,
            patient_row(3, "ZZZ0032", "6545"),
            missing_practice,
        ]),
    );

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

    // All five rows land in raw regardless of staging quality.
    assert_eq!(receipt.files[0].rows_read, 5);
    assert_eq!(receipt.files[0].rows_ingested, 5);
    assert_eq!(receipt.outcome, RunOutcome::Success);

    let pool = registry.pool();
    assert_eq!(count(pool, "SELECT COUNT(*) FROM raw.patients").await, 5);
    assert_eq!(count(pool, "SELECT COUNT(*) FROM stg.patients").await, 3);
    assert_eq!(count(pool, "SELECT COUNT(*) FROM etl.rejections").await, 2);

    let staging = sqlx::query(
        "SELECT rows_read, rows_transformed, rows_rejected, rows_upserted, status
         FROM etl.staging_runs",
    )
    .fetch_one(pool)
    .await
    .expect("staging run");
    assert_eq!(staging.get::<i64, _>("rows_read"), 5);
    assert_eq!(staging.get::<i64, _>("rows_transformed"), 3);
    assert_eq!(staging.get::<i64, _>("rows_rejected"), 2);
    assert_eq!(staging.get::<i64, _>("rows_upserted"), 3);
    assert_eq!(staging.get::<String, _>("status"), "completed");

    let rejections = sqlx::query(
        "SELECT category, source_row_number, raw_row FROM etl.rejections ORDER BY source_row_number",
    )
    .fetch_all(pool)
    .await
    .expect("rejections");
    assert_eq!(rejections[0].get::<String, _>("category"), "validation");
    assert_eq!(rejections[0].get::<i64, _>("source_row_number"), 3);
    assert_eq!(
        rejections[1].get::<String, _>("category"),
        "missing_required"
    );
    assert_eq!(rejections[1].get::<i64, _>("source_row_number"), 5);

    // Snapshots keep the whole source row for investigation.
    let snapshot: serde_json::Value = rejections[0].get("raw_row");
    assert_eq!(snapshot["nhi_number"], "AIO1234");
    assert_eq!(snapshot["patient_id"], "4");

    // Rejection integrity: every reject points at a processed file and a
    // real source row.
    assert_eq!(
        count(
            pool,
            "SELECT COUNT(*) FROM etl.rejections r
             JOIN etl.load_run_files f ON f.id = r.load_run_file_id
             WHERE f.status <> 'processed'
                OR r.source_row_number < 1
                OR r.source_row_number > f.rows_read",
        )
        .await,
        0
    );
}
