use std::path::Path;

use codebrief::cache::{ResponseCache, SqliteResponseCache};
use codebrief::config::CacheConfig;
use tempfile::tempdir;

fn config(path: &Path) -> CacheConfig {
    CacheConfig {
        enabled: true,
        path: path.to_path_buf(),
        similarity_threshold: 0.7,
        max_entries: None,
        ttl_days: None,
    }
}

#[tokio::test]
async fn sqlite_cache_store_save_and_reopen_finds_exact_query() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested").join("cache.sqlite");

    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();
    cache
        .store("How does Shape.area work?", "It multiplies width by height.")
        .await
        .unwrap();
    let stats = cache.save().await.unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.remaining, 1);
    drop(cache);

    let reopened = SqliteResponseCache::open(&config(&db_path)).unwrap();
    assert_eq!(reopened.len().unwrap(), 1);

    let lookup = reopened.find("how does   shape.area WORK?").await.unwrap();
    assert!(lookup.hit);
    assert_eq!(lookup.similarity, 1.0);
    let entry = lookup.entry.unwrap();
    assert_eq!(entry.original_query, "How does Shape.area work?");
    assert_eq!(entry.response, "It multiplies width by height.");
}

#[tokio::test]
async fn sqlite_cache_similar_query_hits_and_unrelated_query_misses() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();

    cache
        .store("rectangle area calculation", "use width * height")
        .await
        .unwrap();
    cache.save().await.unwrap();

    let similar = cache.find("rectangle area calculation bug").await.unwrap();
    assert!(similar.hit);
    assert!((similar.similarity - 0.75).abs() < 1e-9);

    let unrelated = cache.find("database migration rollback").await.unwrap();
    assert!(!unrelated.hit);
    assert!(unrelated.entry.is_none());
    assert!(unrelated.similarity < 0.7);
}

#[tokio::test]
async fn sqlite_cache_stopword_only_queries_do_not_hit_each_other() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();

    cache.store("can you do it", "sure").await.unwrap();
    cache.save().await.unwrap();

    let lookup = cache.find("is it").await.unwrap();
    assert!(!lookup.hit);
    assert!(lookup.entry.is_none());
    assert_eq!(lookup.similarity, 0.0);

    assert!(cache.find("Can you do it").await.unwrap().hit);
}

#[tokio::test]
async fn sqlite_cache_pending_entries_are_visible_before_save() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();

    cache.store("explain retry backoff", "doubles").await.unwrap();
    assert!(cache.find("explain retry backoff").await.unwrap().hit);

    // Nothing durable until save.
    let other = SqliteResponseCache::open(&config(&db_path)).unwrap();
    assert!(other.is_empty().unwrap());
}

#[tokio::test]
async fn sqlite_cache_max_entries_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cfg = CacheConfig {
        max_entries: Some(2),
        ..config(&db_path)
    };
    let cache = SqliteResponseCache::open(&cfg).unwrap();

    cache.store("alpha parser question", "a").await.unwrap();
    cache.store("beta tokenizer question", "b").await.unwrap();
    cache.store("gamma renderer question", "c").await.unwrap();
    cache.save().await.unwrap();

    // Make "beta" deterministically the oldest row.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE response_cache SET created_at = 0 WHERE original_query = ?1",
        rusqlite::params!["beta tokenizer question"],
    )
    .unwrap();
    drop(conn);

    let cache = SqliteResponseCache::open(&cfg).unwrap();
    cache.store("delta lexer question", "d").await.unwrap();
    let stats = cache.save().await.unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.evicted, 2);
    assert_eq!(stats.remaining, 2);

    let beta = cache.find("beta tokenizer question").await.unwrap();
    assert!(!beta.hit);
    assert!(cache.find("delta lexer question").await.unwrap().hit);
}

#[tokio::test]
async fn sqlite_cache_ttl_evicts_expired_rows_on_save() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();
    cache.store("old question about auth", "stale").await.unwrap();
    cache.save().await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute("UPDATE response_cache SET created_at = 0", [])
        .unwrap();
    drop(conn);

    let cfg = CacheConfig {
        ttl_days: Some(30),
        ..config(&db_path)
    };
    let cache = SqliteResponseCache::open(&cfg).unwrap();
    cache.store("new question about tokens", "fresh").await.unwrap();
    let stats = cache.save().await.unwrap();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(!cache.find("old question about auth").await.unwrap().hit);
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::open(&config(&db_path)).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
