//! SQLite-backed response cache with similarity lookup.
//!
//! Entries are loaded into memory on open. `find` scores the query against
//! every entry; `store` queues a new entry; `save` flushes the queue in one
//! transaction under an exclusive file lock and then applies eviction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::CacheConfig;
use crate::preprocess::STOPWORDS;

/// One remembered answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub query_fingerprint: String,
    pub original_query: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a similarity lookup. `similarity` is the best score seen, in
/// [0, 1]; `entry` is set only on a hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheLookup {
    pub hit: bool,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<CacheEntry>,
}

impl CacheLookup {
    pub fn miss() -> Self {
        Self {
            hit: false,
            similarity: 0.0,
            entry: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveStats {
    pub inserted: usize,
    pub evicted: usize,
    pub remaining: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn find(&self, query: &str) -> Result<CacheLookup, CacheError>;
    /// Queue an entry. Nothing is durable until [`ResponseCache::save`].
    async fn store(&self, query: &str, response: &str) -> Result<(), CacheError>;
    async fn save(&self) -> Result<SaveStats, CacheError>;
}

#[derive(Debug, Default)]
struct CacheState {
    entries: Vec<CacheEntry>,
    pending: Vec<CacheEntry>,
}

#[derive(Clone)]
pub struct SqliteResponseCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    state: Arc<Mutex<CacheState>>,
    threshold: f64,
    max_entries: Option<usize>,
    ttl_days: Option<u32>,
}

impl SqliteResponseCache {
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS response_cache (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               fingerprint TEXT NOT NULL,\
               original_query TEXT NOT NULL,\
               response TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS response_cache_fingerprint \
               ON response_cache (fingerprint);",
        )?;
        let entries = load_entries(&conn)?;
        tracing::debug!(
            stage = "cache",
            path = %path.display(),
            entries = entries.len(),
            "response cache opened"
        );

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            state: Arc::new(Mutex::new(CacheState {
                entries,
                pending: Vec::new(),
            })),
            threshold: config.similarity_threshold,
            max_entries: config.max_entries,
            ttl_days: config.ttl_days,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    /// Entries currently visible to `find`, durable and pending.
    pub fn len(&self) -> Result<usize, CacheError> {
        let state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(state.entries.len() + state.pending.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

fn load_entries(conn: &Connection) -> Result<Vec<CacheEntry>, CacheError> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, original_query, response, created_at \
         FROM response_cache ORDER BY created_at ASC, id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let millis: i64 = row.get(3)?;
        entries.push(CacheEntry {
            query_fingerprint: row.get(0)?,
            original_query: row.get(1)?,
            response: row.get(2)?,
            timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        });
    }
    Ok(entries)
}

/// Delete expired rows, then everything past the newest `max_entries`.
fn evict(
    conn: &Connection,
    ttl_days: Option<u32>,
    max_entries: Option<usize>,
    now: DateTime<Utc>,
) -> Result<usize, CacheError> {
    let mut deleted = 0usize;
    if let Some(days) = ttl_days {
        let cutoff = (now - ChronoDuration::days(days as i64)).timestamp_millis();
        deleted += conn.execute(
            "DELETE FROM response_cache WHERE created_at < ?1",
            params![cutoff],
        )?;
    }
    if let Some(keep) = max_entries {
        deleted += conn.execute(
            "DELETE FROM response_cache WHERE id IN (\
                SELECT id FROM response_cache \
                ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?1\
             )",
            params![keep as i64],
        )?;
    }
    Ok(deleted)
}

#[async_trait]
impl ResponseCache for SqliteResponseCache {
    async fn find(&self, query: &str) -> Result<CacheLookup, CacheError> {
        let state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        let fingerprint = fingerprint(query);
        let tokens = similarity_tokens(query);

        let mut best: Option<(f64, &CacheEntry)> = None;
        for entry in state.entries.iter().chain(state.pending.iter()) {
            let score = if entry.query_fingerprint == fingerprint {
                1.0
            } else {
                jaccard(&tokens, &similarity_tokens(&entry.original_query))
            };
            let better = match best {
                None => true,
                Some((s, current)) => {
                    score > s || (score == s && entry.timestamp >= current.timestamp)
                }
            };
            if better {
                best = Some((score, entry));
            }
        }

        let lookup = match best {
            Some((similarity, entry)) if similarity >= self.threshold => CacheLookup {
                hit: true,
                similarity,
                entry: Some(entry.clone()),
            },
            Some((similarity, _)) => CacheLookup {
                hit: false,
                similarity,
                entry: None,
            },
            None => CacheLookup::miss(),
        };
        tracing::debug!(
            stage = "cache",
            hit = lookup.hit,
            similarity = lookup.similarity,
            "cache lookup"
        );
        Ok(lookup)
    }

    async fn store(&self, query: &str, response: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        state.pending.push(CacheEntry {
            query_fingerprint: fingerprint(query),
            original_query: query.to_string(),
            response: response.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn save(&self) -> Result<SaveStats, CacheError> {
        let pending = {
            let state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
            state.pending.clone()
        };
        let cache = self.clone();
        let (stats, entries) = tokio::task::spawn_blocking(move || {
            let _lock = cache.lock_exclusive()?;
            cache.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                for entry in &pending {
                    tx.execute(
                        "INSERT INTO response_cache (fingerprint, original_query, response, created_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            entry.query_fingerprint,
                            entry.original_query,
                            entry.response,
                            entry.timestamp.timestamp_millis(),
                        ],
                    )?;
                }
                let evicted = evict(&tx, cache.ttl_days, cache.max_entries, Utc::now())?;
                tx.commit()?;

                let entries = load_entries(conn)?;
                Ok((
                    SaveStats {
                        inserted: pending.len(),
                        evicted,
                        remaining: entries.len(),
                    },
                    entries,
                ))
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))??;

        let mut state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        let flushed = stats.inserted.min(state.pending.len());
        state.pending.drain(..flushed);
        state.entries = entries;
        tracing::debug!(
            stage = "cache",
            inserted = stats.inserted,
            evicted = stats.evicted,
            remaining = stats.remaining,
            "response cache saved"
        );
        Ok(stats)
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// blake3 of the query lowercased with whitespace collapsed.
pub fn fingerprint(query: &str) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

fn similarity_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Jaccard index of two token sets. An empty set shares nothing with
/// anything, so stopword-only queries only ever match by fingerprint.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Token-set similarity of two queries, as used by `find`.
pub fn query_similarity(a: &str, b: &str) -> f64 {
    if fingerprint(a) == fingerprint(b) {
        return 1.0;
    }
    jaccard(&similarity_tokens(a), &similarity_tokens(b))
}
