//! End-to-end workflow tests for the Strata system
//!
//! These tests drive archiving, renewal and validation the way a
//! deployment does: records in SQLite, tasks as JSON messages through the
//! worker pool, evidence checked layer by layer.

use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::oneshot;

use strata_core::package::{PACKAGE1, PACKAGE_PREFIX};
use strata_core::records::expiration_after;
use strata_core::{digest_bytes, digest_file, find_member, Error};
use strata_daemon::testing::TestEnvironment;
use strata_daemon::{
    due_for_retimestamp, ChannelQueue, FileIdentifier, RecordStore, SqliteStore, Task,
    TaskOutcome, ValidationOutcome, WorkerPool,
};

fn sqlite_store(env: &TestEnvironment) -> Arc<dyn RecordStore> {
    Arc::new(SqliteStore::open(&env.root.path().join("strata.db")).unwrap())
}

/// Archive, renew three times, validate, then break the original and the evidence
#[tokio::test]
async fn test_full_archive_lifecycle() {
    // ==========================================
    // STEP 1: Archive an original
    // ==========================================
    let env = TestEnvironment::new().unwrap();
    let store = sqlite_store(&env);
    let original = env.write_original("report.txt", b"hello").unwrap();

    let file = env
        .archiver_for(store.clone())
        .archive(&original, "alice")
        .await
        .unwrap();
    let dir = file.storage_path().to_path_buf();

    assert_eq!(file.file_name(), "report.txt");
    assert_eq!(file.owner_name(), "alice");
    assert_eq!(file.fields().origin_digest, digest_bytes(b"hello"));
    assert_eq!(find_member(&dir, PACKAGE_PREFIX).unwrap(), dir.join(PACKAGE1));

    let packages = store.packages(file.file_id).unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(&digest_file(&dir.join(PACKAGE1)).unwrap(), packages[0].package_digest());
    assert_eq!(
        file.expiration(),
        expiration_after(packages[0].issuing_date(), env.validity_years).unwrap()
    );

    // ==========================================
    // STEP 2: Validate the fresh archive
    // ==========================================
    let report = env
        .validator_for(store.clone())
        .verify(&FileIdentifier::Id(file.file_id))
        .unwrap();
    assert!(report.is_valid(), "{:?}", report);

    // ==========================================
    // STEP 3: Renew three times
    // ==========================================
    let retimestamper = env.retimestamper_for(store.clone());
    for _ in 0..3 {
        retimestamper.retimestamp(file.file_id).await.unwrap();
    }

    let packages = store.packages(file.file_id).unwrap();
    assert_eq!(packages.len(), 4);
    assert!(packages
        .windows(2)
        .all(|pair| pair[0].issuing_date() >= pair[1].issuing_date()));
    assert_eq!(
        find_member(&dir, PACKAGE_PREFIX).unwrap(),
        dir.join("PackageF3.tar")
    );

    let renewed = store.archived(file.file_id).unwrap();
    assert_eq!(
        renewed.expiration(),
        expiration_after(packages[0].issuing_date(), env.validity_years).unwrap()
    );

    // ==========================================
    // STEP 4: Validate through a reopened store
    // ==========================================
    drop(retimestamper);
    let reopened = sqlite_store(&env);
    let report = env
        .validator_for(reopened.clone())
        .verify(&FileIdentifier::OwnerAndName {
            owner: "alice".into(),
            name: "report.txt".into(),
        })
        .unwrap();
    assert!(report.is_valid(), "{:?}", report);

    // ==========================================
    // STEP 5: A changed original leaves the archive valid
    // ==========================================
    fs::write(&original, b"hellO").unwrap();
    let report = env
        .validator_for(reopened.clone())
        .verify(&FileIdentifier::Id(file.file_id))
        .unwrap();
    assert!(matches!(
        report.outcome,
        ValidationOutcome::OriginalFileInvalid { .. }
    ));
    fs::write(&original, b"hello").unwrap();

    // ==========================================
    // STEP 6: Corrupted evidence names the broken layer
    // ==========================================
    let outer = dir.join("PackageF3.tar");
    let mut bytes = fs::read(&outer).unwrap();
    bytes.push(0);
    fs::write(&outer, bytes).unwrap();

    let report = env
        .validator_for(reopened.clone())
        .verify(&FileIdentifier::Id(file.file_id))
        .unwrap();
    assert!(matches!(
        report.outcome,
        ValidationOutcome::ArchivedFileInvalid { ref layer, .. } if layer == "PackageF3.tar"
    ));

    // a corrupted container also refuses renewal
    let err = env
        .retimestamper_for(reopened)
        .retimestamp(file.file_id)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::DigestsNotMatched(_)));
}

/// Task messages flow through the queue and the worker pool
#[tokio::test]
async fn test_task_messages_through_worker_pool() {
    let env = TestEnvironment::new().unwrap();
    let original = env.write_original("ledger.csv", b"a,b\n1,2\n").unwrap();

    let (queue, deliveries) = ChannelQueue::new();
    let pool = WorkerPool::new(Arc::new(env.dispatcher()), queue.clone(), 2, 3);
    let (stop, stopped) = oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        pool.run(deliveries, async {
            let _ = stopped.await;
        })
        .await
    });

    // ==========================================
    // STEP 1: Archive task
    // ==========================================
    queue
        .publish(
            json!({"task": "Archive", "file_path": original, "owner_name": "bob"}).to_string(),
        )
        .unwrap();
    queue.wait_idle().await;
    let file_id = env.store.find_file_id("bob", "ledger.csv").unwrap();

    // ==========================================
    // STEP 2: Retimestamp task
    // ==========================================
    queue
        .publish_task(&Task::Retimestamp { file_id })
        .unwrap();
    queue.wait_idle().await;
    assert_eq!(env.store.packages(file_id).unwrap().len(), 2);

    // ==========================================
    // STEP 3: Validation task mails the result
    // ==========================================
    queue
        .publish(
            json!({
                "task": "validation",
                "files_info": ["bob", "ledger.csv"],
                "result_recipients": ["auditor@strata.test"]
            })
            .to_string(),
        )
        .unwrap();
    queue.wait_idle().await;

    let sent = env.notifier.last().unwrap();
    assert_eq!(sent.recipients, vec!["auditor@strata.test".to_string()]);
    assert_eq!(sent.subject, "Verification of file validity for: ledger.csv");
    assert_eq!(sent.body, "Result: file ledger.csv is still valid");

    // ==========================================
    // STEP 4: Malformed tasks are acknowledged, not retried
    // ==========================================
    queue.publish(r#"{"task": "shred", "file_id": 1}"#).unwrap();
    queue
        .publish(json!({"task": "Retimestamp", "file_id": 9999}).to_string())
        .unwrap();
    queue.wait_idle().await;

    assert!(queue.dead_letters().is_empty());
    assert_eq!(queue.acked().len(), 5);

    stop.send(()).unwrap();
    worker.await.unwrap().unwrap();
}

/// Files come due for renewal as their expiration approaches
#[tokio::test]
async fn test_expiring_files_come_due() {
    let env = TestEnvironment::new().unwrap();
    let store = sqlite_store(&env);
    let original = env.write_original("contract.pdf", b"%PDF-1.7").unwrap();
    let file = env
        .archiver_for(store.clone())
        .archive(&original, "carol")
        .await
        .unwrap();

    let now = Utc::now();
    assert!(due_for_retimestamp(store.as_ref(), now, 2).unwrap().is_empty());

    let near_expiry = file.expiration() - Duration::days(1);
    assert_eq!(
        due_for_retimestamp(store.as_ref(), near_expiry, 2).unwrap(),
        vec![file.file_id]
    );

    // renewal pushes the expiration out again
    env.retimestamper_for(store.clone())
        .retimestamp(file.file_id)
        .await
        .unwrap();
    let renewed = store.archived(file.file_id).unwrap();
    assert!(renewed.expiration() >= file.expiration());
    assert!(due_for_retimestamp(store.as_ref(), now, 2).unwrap().is_empty());
}

/// Task bodies that cannot name an archived file are known errors
#[tokio::test]
async fn test_wrong_task_identifiers() {
    let env = TestEnvironment::new().unwrap();
    let dispatcher = env.dispatcher();

    let bodies = [
        json!({"task": "validation", "files_info": "report", "result_recipients": ["a@b.com"]}),
        json!({"task": "validation", "files_info": ["alice"], "result_recipients": ["a@b.com"]}),
        json!({"task": "Retimestamp", "file_id": ["alice", "report.txt"]}),
        json!({"task": "archive", "file_path": "/nowhere/report.txt"}),
    ];
    for body in bodies {
        let bytes = body.to_string().into_bytes();
        assert!(
            matches!(Task::parse(&bytes), Err(Error::WrongTask(_))),
            "{}",
            body
        );
        assert_eq!(dispatcher.handle(&bytes).await, TaskOutcome::AckKnownError);
    }

    // a well-formed validation of an unknown file is a known error too
    let unknown = json!({
        "task": "validation",
        "files_info": ["alice", "report.txt"],
        "result_recipients": ["a@b.com"]
    })
    .to_string()
    .into_bytes();
    assert_eq!(dispatcher.handle(&unknown).await, TaskOutcome::AckKnownError);
    assert!(env.notifier.sent().is_empty());
}
