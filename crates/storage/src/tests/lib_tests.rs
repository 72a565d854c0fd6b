use super::*;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("outbox/conv-1/000001", b"payload").await.expect("put");
    let value = store.get("outbox/conv-1/000001").await.expect("get");
    assert_eq!(value.as_deref(), Some(b"payload".as_slice()));
}

#[tokio::test]
async fn put_overwrites_existing_entry() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("keys/conv-1", b"old").await.expect("put");
    store.put("keys/conv-1", b"new").await.expect("put");
    let value = store.get("keys/conv-1").await.expect("get");
    assert_eq!(value.as_deref(), Some(b"new".as_slice()));
}

#[tokio::test]
async fn get_missing_entry_returns_none() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    assert!(store.get("missing").await.expect("get").is_none());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("outbox/conv-1/000001", b"payload").await.expect("put");
    store.delete("outbox/conv-1/000001").await.expect("delete");
    store.delete("outbox/conv-1/000001").await.expect("redelete");
    assert!(store.get("outbox/conv-1/000001").await.expect("get").is_none());
}

#[tokio::test]
async fn list_prefix_returns_entries_in_key_order() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("outbox/conv-1/000002", b"second").await.expect("put");
    store.put("outbox/conv-1/000001", b"first").await.expect("put");
    store.put("outbox/conv-2/000001", b"other lane").await.expect("put");

    let entries = store.list_prefix("outbox/conv-1/").await.expect("list");
    let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["outbox/conv-1/000001", "outbox/conv-1/000002"]);
    assert_eq!(entries[0].value, b"first");
}

#[tokio::test]
async fn list_prefix_escapes_like_wildcards() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("outbox/a_b/000001", b"underscore").await.expect("put");
    store.put("outbox/axb/000001", b"collider").await.expect("put");

    let entries = store.list_prefix("outbox/a_b/").await.expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "outbox/a_b/000001");
}

#[tokio::test]
async fn count_prefix_counts_only_matching_entries() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.put("outbox/conv-1/000001", b"a").await.expect("put");
    store.put("outbox/conv-1/000002", b"b").await.expect("put");
    store.put("keys/conv-1", b"k").await.expect("put");

    assert_eq!(store.count_prefix("outbox/conv-1/").await.expect("count"), 2);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("state.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = LocalStore::new(&database_url).await.expect("db");
    store.put("probe", b"1").await.expect("put");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}
