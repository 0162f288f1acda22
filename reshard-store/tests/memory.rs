#![cfg(feature = "memory")]
mod engine;

use reshard_store::{MemoryEngine, Source, Table, UuidBackfill};

#[tokio::test]
async fn read_pages() {
    let db = MemoryEngine::new();
    engine::test_read_pages(&db, &db).await.unwrap();
}

#[tokio::test]
async fn coordinate_join() {
    let db = MemoryEngine::new();
    engine::test_coordinate_join(&db, &db).await.unwrap();
}

#[tokio::test]
async fn upsert_idempotent() {
    let db = MemoryEngine::new();
    engine::test_upsert_idempotent(&db, &db).await.unwrap();
}

#[tokio::test]
async fn foreign_keys() {
    let db = MemoryEngine::new();
    engine::test_foreign_keys(&db).await.unwrap();
    assert!(db.foreign_key_checks());
}

#[tokio::test]
async fn shard_map() {
    let db = MemoryEngine::new();
    engine::test_shard_map(&db).await.unwrap();
}

#[tokio::test]
async fn key_counts() {
    let db = MemoryEngine::new();
    engine::test_key_counts(&db, &db).await.unwrap();
}

#[tokio::test]
async fn fill_missing_uuids() {
    let db = MemoryEngine::new();
    engine::test_fill_missing_uuids(&db, &db).await.unwrap();

    assert!(db.uuid_of("local_store_cleaned", 1).is_some());
    assert_ne!(
        db.uuid_of("local_store_cleaned", 1),
        db.uuid_of("local_store_cleaned", 2)
    );
}

#[tokio::test]
async fn fill_missing_uuids_of_registered_table() {
    let db = MemoryEngine::new();
    db.insert_uuid_rows("institution_code", [1, 2, 3]);

    let first = db.uuid_of("institution_code", 1);
    assert_eq!(first, None);

    let fill = db.fill_missing_uuids("institution_code").await.unwrap();
    assert_eq!((fill.missing, fill.updated), (3, 3));

    let unknown = db.fill_missing_uuids("unknown_table").await.unwrap();
    assert_eq!((unknown.missing, unknown.updated), (0, 0));
}

#[tokio::test]
async fn injected_failures_leave_rows_untouched() {
    let db = MemoryEngine::new();
    db.fail_upserts_after(1);

    let first = vec![engine::store(1, Some("100"))].into();
    let second = vec![engine::store(2, Some("100"))].into();

    reshard_store::Shard::upsert(&db, &first).await.unwrap();
    assert!(reshard_store::Shard::upsert(&db, &second).await.is_err());
    assert_eq!(db.read(Table::Store, 0, 10).await.unwrap().ids(), vec![1]);

    db.heal();
    reshard_store::Shard::upsert(&db, &second).await.unwrap();
    assert_eq!(db.read(Table::Store, 0, 10).await.unwrap().ids(), vec![1, 2]);
}
