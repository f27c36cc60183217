use std::sync::Arc;

use docstore::checksum::Digest;
use docstore::state_machine::{ProcessingStatus, StatusEvent};
use docstore::storage::models::{ImageDescription, OcrResult};
use docstore::storage::{Database, DatabaseError};

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn insert(db: &Database, content: &[u8]) -> Digest {
    let digest = Digest::of(content);
    db.upsert_file(&digest, |record| {
        record.size = content.len() as u64;
        record.content_type = "application/pdf".to_string();
        record.backend_locator = format!("loc-{}", &digest.to_hex()[..8]);
    })
    .unwrap();
    digest
}

fn sample_result() -> OcrResult {
    OcrResult {
        markdown_text: "Body".to_string(),
        image_descriptions: vec![ImageDescription {
            position_anchor: "IMG_1".to_string(),
            description_text: "A chart".to_string(),
        }],
    }
}

#[test]
fn test_upsert_and_get_file() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"first document");

    let record = db.get_file(&digest).unwrap().expect("record should exist");
    assert_eq!(record.checksum, digest);
    assert_eq!(record.size, 14);
    assert_eq!(record.content_type, "application/pdf");
    assert_eq!(record.status, ProcessingStatus::Unprocessed);
    assert_eq!(record.result_ref, None);
    assert_eq!(record.attempts, 0);
}

#[test]
fn test_get_missing_file() {
    let (_dir, db) = test_db();
    assert!(db.get_file(&Digest::of(b"nope")).unwrap().is_none());
}

#[test]
fn test_upsert_updates_existing() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"doc");
    let created_at = db.get_file(&digest).unwrap().unwrap().created_at;

    let updated = db
        .upsert_file(&digest, |record| {
            record.content_type = "image/png".to_string();
        })
        .unwrap();

    assert_eq!(updated.content_type, "image/png");
    assert_eq!(updated.size, 3);
    assert_eq!(updated.created_at, created_at);
    assert!(updated.updated_at >= created_at);
    assert_eq!(db.count_files().unwrap(), 1);
}

#[test]
fn test_update_never_creates() {
    let (_dir, db) = test_db();
    let digest = Digest::of(b"ghost");

    let out = db
        .update_file(&digest, |record| {
            record.size = 99;
            Ok(())
        })
        .unwrap();
    assert!(out.is_none());
    assert!(db.get_file(&digest).unwrap().is_none());
}

#[test]
fn test_delete_file() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"to delete");

    assert!(db.delete_file(&digest).unwrap());
    assert!(db.get_file(&digest).unwrap().is_none());
    assert!(!db.delete_file(&digest).unwrap());
}

#[test]
fn test_list_files_is_complete_across_batches() {
    let (_dir, db) = test_db();
    let mut expected: Vec<Digest> = (0..600)
        .map(|i| insert(&db, format!("document {i}").as_bytes()))
        .collect();
    expected.sort();

    let listed: Vec<Digest> = db
        .list_files()
        .map(|r| r.unwrap().checksum)
        .collect();
    assert_eq!(listed, expected);
    assert_eq!(db.count_files().unwrap(), 600);
}

#[test]
fn test_list_files_by_status() {
    let (_dir, db) = test_db();
    let a = insert(&db, b"a");
    insert(&db, b"b");
    db.transition(&a, StatusEvent::Enqueue).unwrap();

    let queued: Vec<Digest> = db
        .list_files()
        .with_status(ProcessingStatus::Queued)
        .map(|r| r.unwrap().checksum)
        .collect();
    assert_eq!(queued, vec![a]);
}

#[test]
fn test_transitions_track_attempts_and_errors() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"lifecycle");

    db.transition(&digest, StatusEvent::Enqueue).unwrap();
    db.transition(&digest, StatusEvent::Start).unwrap();
    let failed = db
        .transition(&digest, StatusEvent::Fail("ocr timed out".to_string()))
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, ProcessingStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("ocr timed out"));
    assert_eq!(failed.attempts, 1);

    let requeued = db
        .transition(&digest, StatusEvent::Enqueue)
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, ProcessingStatus::Queued);
    assert_eq!(requeued.last_error, None);
}

#[test]
fn test_invalid_transition_is_rejected_and_not_written() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"strict");

    let err = db.transition(&digest, StatusEvent::Start).unwrap_err();
    assert!(matches!(err, DatabaseError::Transition(_)));
    assert_eq!(
        db.get_file(&digest).unwrap().unwrap().status,
        ProcessingStatus::Unprocessed
    );
}

#[test]
fn test_complete_processing_is_atomic() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"processed");
    db.transition(&digest, StatusEvent::Enqueue).unwrap();
    db.transition(&digest, StatusEvent::Start).unwrap();

    assert!(db.complete_processing(&digest, &sample_result()).unwrap());

    let record = db.get_file(&digest).unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Succeeded);
    let result_ref = record.result_ref.expect("result ref set");
    assert_eq!(db.get_result(&result_ref).unwrap(), Some(sample_result()));
}

#[test]
fn test_complete_processing_requires_running() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"not running");

    assert!(db.complete_processing(&digest, &sample_result()).is_err());
    let record = db.get_file(&digest).unwrap().unwrap();
    assert_eq!(record.result_ref, None);
    assert!(db.get_result(&digest.to_hex()).unwrap().is_none());
}

#[test]
fn test_complete_processing_on_deleted_record() {
    let (_dir, db) = test_db();
    let digest = Digest::of(b"vanished");

    assert!(!db.complete_processing(&digest, &sample_result()).unwrap());
    assert!(db.get_result(&digest.to_hex()).unwrap().is_none());
}

#[test]
fn test_delete_removes_result() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"with result");
    db.transition(&digest, StatusEvent::Enqueue).unwrap();
    db.transition(&digest, StatusEvent::Start).unwrap();
    db.complete_processing(&digest, &sample_result()).unwrap();

    db.delete_file(&digest).unwrap();
    assert!(db.get_result(&digest.to_hex()).unwrap().is_none());
}

#[test]
fn test_find_active() {
    let (_dir, db) = test_db();
    let queued = insert(&db, b"q");
    let running = insert(&db, b"r");
    insert(&db, b"idle");
    db.transition(&queued, StatusEvent::Enqueue).unwrap();
    db.transition(&running, StatusEvent::Enqueue).unwrap();
    db.transition(&running, StatusEvent::Start).unwrap();

    let mut active: Vec<Digest> = db
        .find_active()
        .unwrap()
        .into_iter()
        .map(|r| r.checksum)
        .collect();
    active.sort();
    let mut expected = vec![queued, running];
    expected.sort();
    assert_eq!(active, expected);
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let digest = {
        let db = Database::open(dir.path().join("data")).unwrap();
        insert(&db, b"durable")
    };

    let db = Database::open(dir.path().join("data")).unwrap();
    let record = db.get_file(&digest).unwrap().expect("record persisted");
    assert_eq!(record.size, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_do_not_lose_updates() {
    let (_dir, db) = test_db();
    let digest = insert(&db, b"counter");
    let db = Arc::new(db);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            db.upsert_file(&digest, |record| record.size += 1).unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.get_file(&digest).unwrap().unwrap().size, 7 + 50);
}
