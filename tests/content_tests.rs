use std::sync::Arc;

use docstore::backend::{LocalStore, StorageBackend};
use docstore::checksum::Digest;
use docstore::content::{ContentError, ContentStore};
use docstore::storage::Database;

struct Fixture {
    _dir: tempfile::TempDir,
    objects: std::path::PathBuf,
    db: Database,
    content: ContentStore,
}

fn fixture(max_size: u64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let objects = dir.path().join("objects");
    let db = Database::open(dir.path().join("data")).unwrap();
    let backend = StorageBackend::LocalDisk(LocalStore::new(&objects).unwrap());
    let content = ContentStore::new(db.clone(), Arc::new(backend), max_size);
    Fixture {
        _dir: dir,
        objects,
        db,
        content,
    }
}

fn object_count(f: &Fixture) -> usize {
    LocalStore::new(&f.objects).unwrap().object_count().unwrap()
}

#[tokio::test]
async fn test_store_twice_deduplicates() {
    let f = fixture(1024 * 1024);
    let data = b"the same bytes".to_vec();

    let first = f
        .content
        .store(data.as_slice(), "application/pdf")
        .await
        .unwrap();
    let second = f
        .content
        .store(data.as_slice(), "application/pdf")
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.digest, Digest::of(&data));
    assert_eq!(object_count(&f), 1);
    assert_eq!(f.db.count_files().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_put_once() {
    let f = fixture(1024 * 1024);
    let data: Arc<Vec<u8>> = Arc::new((0..500 * 1024).map(|i| (i % 251) as u8).collect());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let content = f.content.clone();
        let data = Arc::clone(&data);
        handles.push(tokio::spawn(async move {
            content
                .store(data.as_slice(), "application/pdf")
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut digests = Vec::new();
    for handle in handles {
        let stored = handle.await.unwrap();
        if stored.created {
            created += 1;
        }
        digests.push(stored.digest);
    }

    assert_eq!(created, 1);
    assert!(digests.iter().all(|d| *d == digests[0]));
    assert_eq!(object_count(&f), 1);
    assert_eq!(f.db.count_files().unwrap(), 1);
}

#[tokio::test]
async fn test_retrieve_returns_stored_bytes() {
    let f = fixture(1024);
    let stored = f
        .content
        .store(&b"retrievable"[..], "text/plain")
        .await
        .unwrap();

    let (record, data) = f.content.retrieve(&stored.digest).await.unwrap();
    assert_eq!(&data[..], b"retrievable");
    assert_eq!(record.size, 11);
    assert_eq!(record.content_type, "text/plain");
    assert!(f.content.exists(&stored.digest).unwrap());
}

#[tokio::test]
async fn test_remove_then_retrieve_is_not_found() {
    let f = fixture(1024);
    let stored = f.content.store(&b"ephemeral"[..], "text/plain").await.unwrap();

    assert!(f.content.remove(&stored.digest).await.unwrap());
    assert!(matches!(
        f.content.retrieve(&stored.digest).await,
        Err(ContentError::NotFound(_))
    ));
    assert!(!f.content.exists(&stored.digest).unwrap());
    assert_eq!(object_count(&f), 0);
    assert!(!f.content.remove(&stored.digest).await.unwrap());
}

#[tokio::test]
async fn test_remove_keeps_record_when_backend_delete_fails() {
    let f = fixture(1024);
    let stored = f.content.store(&b"sticky"[..], "text/plain").await.unwrap();

    // Swap the object for a directory so the backend cannot delete it.
    let record = f.db.get_file(&stored.digest).unwrap().unwrap();
    let path = f.objects.join(&record.backend_locator);
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("child"), b"x").unwrap();

    assert!(f.content.remove(&stored.digest).await.is_err());
    assert!(f.db.get_file(&stored.digest).unwrap().is_some());
}

#[tokio::test]
async fn test_remove_succeeds_when_object_already_gone() {
    let f = fixture(1024);
    let stored = f.content.store(&b"orphan"[..], "text/plain").await.unwrap();

    let record = f.db.get_file(&stored.digest).unwrap().unwrap();
    std::fs::remove_file(f.objects.join(&record.backend_locator)).unwrap();

    assert!(f.content.remove(&stored.digest).await.unwrap());
    assert!(f.db.get_file(&stored.digest).unwrap().is_none());
}

#[tokio::test]
async fn test_store_rejects_oversized_upload() {
    let f = fixture(8);

    let err = f
        .content
        .store(&b"more than eight bytes"[..], "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, ContentError::TooLarge { limit: 8 }));
    assert_eq!(object_count(&f), 0);
    assert_eq!(f.db.count_files().unwrap(), 0);
}

#[tokio::test]
async fn test_missing_backend_object_is_not_found() {
    let f = fixture(1024);
    let stored = f.content.store(&b"lost"[..], "text/plain").await.unwrap();

    let record = f.db.get_file(&stored.digest).unwrap().unwrap();
    std::fs::remove_file(f.objects.join(&record.backend_locator)).unwrap();

    assert!(matches!(
        f.content.retrieve(&stored.digest).await,
        Err(ContentError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_upload_keeps_first_name() {
    let f = fixture(1024 * 1024);
    let data = b"named bytes".to_vec();

    let first = f
        .content
        .store_named(data.as_slice(), "application/pdf", Some("invoice.pdf"))
        .await
        .unwrap();
    f.content
        .store_named(data.as_slice(), "application/pdf", Some("invoice (1).pdf"))
        .await
        .unwrap();

    let record = f.db.get_file(&first.digest).unwrap().unwrap();
    assert_eq!(record.name.as_deref(), Some("invoice.pdf"));
}
