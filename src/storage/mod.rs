// Durable key-value store shared by every running instance.
//
// One SQLite row per key. Writes are single upsert or delete statements, so
// concurrent processes only ever race on the same key (last write wins). Keys
// changed by someone else surface as remote changes on the next reload.
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::errors::{AppError, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// One observed change of a key
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// True when another instance made the change
    pub remote: bool,
}

pub struct DurableStore {
    pool: Pool<Sqlite>,
    /// Last state this instance saw, used to tell remote changes apart
    seen: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl DurableStore {
    /// Opens (or creates) the database at `path`, creating parent directories as needed
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self::with_pool(pool).await?;
        log::info!(
            "💾 [STORE] Opened {:?} with {} keys",
            path,
            store.seen.read().await.len()
        );
        Ok(store)
    }

    /// A private store that lives as long as this instance
    #[cfg(test)]
    pub(crate) async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            pool,
            seen: RwLock::new(HashMap::new()),
            changes,
        };
        let rows = store.scan_prefix("").await?;
        *store.seen.write().await = rows.into_iter().collect();
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|raw| decode(key, &raw)).transpose()
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.write_key(key, Some(value)).await
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.write_key(key, None).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .scan_prefix("")
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every key starting with `prefix`, in first-insertion order
    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY rowid",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(key, raw)| {
                let value = decode(&key, &raw)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Drops keys under `prefix` that nobody rewrote within `max_age`
    pub async fn prune(&self, prefix: &str, max_age: Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - max_age.as_secs() as i64;
        let result = sqlx::query(
            "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1 AND updated_at < ?2",
        )
        .bind(prefix)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-reads the table and announces every key another instance changed
    pub async fn reload(&self) -> Result<Vec<StoreChange>> {
        let current: HashMap<String, Value> = self.scan_prefix("").await?.into_iter().collect();
        let mut seen = self.seen.write().await;
        let changes = diff(&seen, &current);
        *seen = current;
        drop(seen);

        for change in &changes {
            self.notify(change.clone());
        }
        Ok(changes)
    }

    /// Reloads every `interval` until the store is dropped elsewhere
    pub fn watch(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if Arc::strong_count(&self) == 1 {
                    break;
                }
                match self.reload().await {
                    Ok(changes) if !changes.is_empty() => {
                        log::debug!("[STORE] {} remote changes picked up", changes.len())
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("⚠️ [STORE] Reload failed: {}", e),
                }
            }
        })
    }

    async fn write_key(&self, key: &str, value: Option<Value>) -> Result<()> {
        let mut seen = self.seen.write().await;
        match &value {
            Some(v) => {
                sqlx::query(
                    r#"
                    INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                    "#,
                )
                .bind(key)
                .bind(serde_json::to_string(v)?)
                .bind(chrono::Utc::now().timestamp())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM kv WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }

        let old_value = match &value {
            Some(v) => seen.insert(key.to_string(), v.clone()),
            None => seen.remove(key),
        };
        drop(seen);

        if old_value != value {
            self.notify(StoreChange {
                key: key.to_string(),
                old_value,
                new_value: value,
                remote: false,
            });
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }

    #[cfg(test)]
    pub(crate) async fn break_table(&self) {
        sqlx::query("DROP TABLE kv").execute(&self.pool).await.unwrap();
    }
}

fn decode(key: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::ParseError(format!("Stored value for {} is not JSON: {}", key, e)))
}

fn diff(before: &HashMap<String, Value>, after: &HashMap<String, Value>) -> Vec<StoreChange> {
    let mut changes: Vec<StoreChange> = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| StoreChange {
            key: key.clone(),
            old_value: before.get(key).cloned(),
            new_value: Some(value.clone()),
            remote: true,
        })
        .collect();
    changes.extend(
        before
            .iter()
            .filter(|(key, _)| !after.contains_key(*key))
            .map(|(key, value)| StoreChange {
                key: key.clone(),
                old_value: Some(value.clone()),
                new_value: None,
                remote: true,
            }),
    );
    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}
