//! Translation cache collaborator, keyed by (dataset hash, query text,
//! strategy name). The engine only reads and writes through the trait.

use crate::config::CacheConfig;
use crate::error::{NlqError, Result};
use crate::execution::ExecutionResult;
use crate::strategy::TranslationResult;
use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dataset_hash: String,
    pub query_text: String,
    pub strategy_name: String,
}

impl CacheKey {
    pub fn new(dataset_hash: &str, query_text: &str, strategy_name: &str) -> Self {
        Self {
            dataset_hash: dataset_hash.to_string(),
            query_text: query_text.trim().to_string(),
            strategy_name: strategy_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub translation: TranslationResult,
    pub execution: Option<ExecutionResult>,
}

pub trait TranslationCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CachedAnswer>;
    fn put(&self, key: CacheKey, answer: CachedAnswer) -> Result<()>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the configured cache, if any.
pub fn from_config(config: &CacheConfig) -> Result<Option<Arc<dyn TranslationCache>>> {
    Ok(match config {
        CacheConfig::None => None,
        CacheConfig::Memory => Some(Arc::new(InMemoryCache::new())),
        CacheConfig::Sqlite { path } => Some(Arc::new(SqliteCache::open(path)?)),
    })
}

/// Entries kept by [`InMemoryCache::new`].
pub const DEFAULT_MEMORY_CAPACITY: usize = 1024;

/// Process-local cache. Holds answers for one dataset at a time: storing an
/// answer for a new fingerprint drops everything cached for the old one.
/// Past `capacity` the oldest entry is evicted.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: DashMap<CacheKey, (u64, CachedAnswer)>,
    current_dataset: Mutex<Option<String>>,
    sequence: AtomicU64,
    capacity: usize,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            current_dataset: Mutex::new(None),
            sequence: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn switch_dataset(&self, dataset_hash: &str) {
        let mut current = match self.current_dataset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.as_deref() == Some(dataset_hash) {
            return;
        }
        if current.is_some() {
            let before = self.entries.len();
            self.entries.retain(|key, _| key.dataset_hash == dataset_hash);
            debug!(
                "Dataset changed, dropped {} cached answers",
                before - self.entries.len()
            );
        }
        *current = Some(dataset_hash.to_string());
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().0)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl TranslationCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CachedAnswer> {
        self.entries.get(key).map(|entry| entry.value().1.clone())
    }

    fn put(&self, key: CacheKey, answer: CachedAnswer) -> Result<()> {
        self.switch_dataset(&key.dataset_hash);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, (seq, answer));
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// SQLite-backed cache storing answers as JSON.
pub struct SqliteCache {
    db: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)?;
        let cache = Self { db: Mutex::new(db) };
        cache.init_schema()?;
        info!("🗄️ Translation cache at {}", path.display());
        Ok(cache)
    }

    pub fn in_memory() -> Result<Self> {
        let cache = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS translation_cache (
                dataset_hash TEXT NOT NULL,
                query_text TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                PRIMARY KEY (dataset_hash, query_text, strategy_name)
            )
            "#,
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| NlqError::Cache("cache connection lock poisoned".to_string()))
    }
}

impl TranslationCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> Option<CachedAnswer> {
        let db = self.lock().ok()?;
        let payload = db.query_row(
            "SELECT payload FROM translation_cache
             WHERE dataset_hash = ?1 AND query_text = ?2 AND strategy_name = ?3",
            params![key.dataset_hash, key.query_text, key.strategy_name],
            |row| row.get::<_, String>(0),
        );
        match payload {
            Ok(payload) => match serde_json::from_str(&payload) {
                Ok(answer) => {
                    debug!("Cache hit for '{}'", key.query_text);
                    Some(answer)
                }
                Err(e) => {
                    warn!("Discarding unreadable cache entry: {}", e);
                    None
                }
            },
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                warn!("Database error while reading cache: {}", e);
                None
            }
        }
    }

    fn put(&self, key: CacheKey, answer: CachedAnswer) -> Result<()> {
        let payload = serde_json::to_string(&answer)?;
        let db = self.lock()?;
        db.execute(
            "INSERT OR REPLACE INTO translation_cache
             (dataset_hash, query_text, strategy_name, payload, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.dataset_hash,
                key.query_text,
                key.strategy_name,
                payload,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn len(&self) -> usize {
        let Ok(db) = self.lock() else {
            return 0;
        };
        db.query_row("SELECT COUNT(*) FROM translation_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlqError;

    fn answer() -> CachedAnswer {
        CachedAnswer {
            translation: TranslationResult::failure(
                "semantic_parsing",
                &NlqError::RoutingAmbiguous("empty".to_string()),
            ),
            execution: None,
        }
    }

    fn exercise(cache: &dyn TranslationCache) {
        let key = CacheKey::new("abc", " top 5 regions ", "semantic_parsing");
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), answer()).unwrap();
        assert_eq!(cache.get(&key), Some(answer()));
        assert_eq!(
            cache.get(&CacheKey::new("abc", "top 5 regions", "semantic_parsing")),
            Some(answer())
        );
        assert!(cache
            .get(&CacheKey::new("other", "top 5 regions", "semantic_parsing"))
            .is_none());
        cache.put(key, answer()).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_in_memory_cache() {
        exercise(&InMemoryCache::new());
    }

    #[test]
    fn test_in_memory_drops_old_dataset() {
        let cache = InMemoryCache::new();
        cache
            .put(CacheKey::new("v1", "total sales", "semantic_parsing"), answer())
            .unwrap();
        cache
            .put(CacheKey::new("v1", "top regions", "semantic_parsing"), answer())
            .unwrap();
        cache
            .put(CacheKey::new("v2", "total sales", "semantic_parsing"), answer())
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get(&CacheKey::new("v1", "total sales", "semantic_parsing"))
            .is_none());
    }

    #[test]
    fn test_in_memory_capacity() {
        let cache = InMemoryCache::with_capacity(2);
        for query in ["a", "b", "c"] {
            cache
                .put(CacheKey::new("v1", query, "semantic_parsing"), answer())
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::new("v1", "a", "semantic_parsing")).is_none());
        assert!(cache.get(&CacheKey::new("v1", "c", "semantic_parsing")).is_some());
    }

    #[test]
    fn test_sqlite_cache() {
        exercise(&SqliteCache::in_memory().unwrap());
    }
}
