//! Geolocation result cache
//!
//! Entries are keyed by `<namespace>:<source>:<identity>` and expire after a
//! caller-supplied TTL. Failed resolutions are cached too, as an empty entry,
//! so a node that could not be located is not retried on every run.

use super::geo::GeoRecord;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Namespace of egress geolocation entries
pub const GEO_NAMESPACE: &str = "geo";

/// Default lifetime of a cache entry (48 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Build a cache key.
pub fn cache_key(namespace: &str, source: &str, identity: &str) -> String {
    format!("{}:{}:{}", namespace, source, identity)
}

/// A cached resolution outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Resolved(GeoRecord),
    Failed,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    geo: Option<GeoRecord>,
}

impl CacheEntry {
    /// `{"geo": {...}}` for a resolution, `{}` for a failure.
    pub fn to_json(&self) -> String {
        let stored = StoredEntry {
            geo: match self {
                Self::Resolved(geo) => Some(geo.clone()),
                Self::Failed => None,
            },
        };
        serde_json::to_string(&stored).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let stored: StoredEntry = serde_json::from_str(s)?;
        Ok(match stored.geo {
            Some(geo) => Self::Resolved(geo),
            None => Self::Failed,
        })
    }
}

/// Key-value store with per-entry expiry.
///
/// Implementations must tolerate concurrent use; the last write to a key wins.
#[async_trait]
pub trait Cache: Send + Sync {
    /// The live entry for `key`, if any. Expired entries are never returned.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;
}

/// Process-local cache, used when no persistent store is configured
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (CacheEntry, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(entry, _)| entry.clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let expires = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (entry, expires));
        Ok(())
    }
}

/// Cache persisted in a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open (creating if needed) a cache database file.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// A cache living only as long as this value.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // A single long-lived connection keeps an in-memory database alive and
        // serialises writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query("SELECT value FROM cache WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(CacheEntry::from_json(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);

        sqlx::query(
            "INSERT INTO cache (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(entry.to_json())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
