use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tokio::task;

use conclave_schema::sanitize_name;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("value for key {key:?} in table {table:?} is corrupt: {source}")]
    Corrupt {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store worker thread panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A keyed document store with per-table typed encoding, backed by a single
/// sqlite file. One physical `Store` backs one logical role (e.g. a session
/// registry, a chat archive, or a single agent's communication state).
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Ensures the table backing `table` exists. Table names are sanitised
    /// the same way agent directory names are, since both end up as
    /// filesystem/SQL identifiers derived from caller-supplied strings.
    async fn ensure_table(&self, table: &str) -> Result<String, StoreError> {
        let table = sanitize_name(table);
        let db = Arc::clone(&self.db);
        let table_for_ddl = table.clone();
        task::spawn_blocking(move || {
            let conn = db.lock().expect("store mutex poisoned");
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table_for_ddl} (\
                        key TEXT PRIMARY KEY, \
                        value TEXT NOT NULL\
                    )"
                ),
                [],
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await??;
        Ok(table)
    }

    /// Stores `value` under `key` in `table`. One write, one commit
    /// (autocommit) — overwrites any existing value.
    pub async fn put<T: serde::Serialize>(
        &self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let table = self.ensure_table(table).await?;
        let key = key.to_owned();
        let json = serde_json::to_string(value)
            .expect("serializing a well-formed value to JSON cannot fail");
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db.lock().expect("store mutex poisoned");
            conn.execute(
                &format!(
                    "INSERT INTO {table} (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                ),
                params![key, json],
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Returns `Ok(None)` if the key is absent. A stored value that fails to
    /// decode as `T` surfaces as `StoreError::Corrupt`, never panics.
    pub async fn get<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let table = self.ensure_table(table).await?;
        let key_owned = key.to_owned();
        let db = Arc::clone(&self.db);
        let raw: Option<String> = task::spawn_blocking(move || {
            let conn = db.lock().expect("store mutex poisoned");
            conn.query_row(
                &format!("SELECT value FROM {table} WHERE key = ?1"),
                params![key_owned],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await??;

        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    table,
                    key: key.to_owned(),
                    source,
                }),
        }
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let table = self.ensure_table(table).await?;
        let key = key.to_owned();
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db.lock().expect("store mutex poisoned");
            conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
            Ok::<(), rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Iterates every entry in `table`. Order is not guaranteed to match
    /// insertion order. Entries that fail to decode as `T`
    /// are skipped rather than failing the whole iteration — a single
    /// corrupt row should not hide the rest of the table from the caller.
    pub async fn iter<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        table: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let table = self.ensure_table(table).await?;
        let db = Arc::clone(&self.db);
        let rows: Vec<(String, String)> = task::spawn_blocking(move || {
            let conn = db.lock().expect("store mutex poisoned");
            let mut stmt = conn.prepare(&format!("SELECT key, value FROM {table}"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

        Ok(rows
            .into_iter()
            .filter_map(|(key, json)| serde_json::from_str::<T>(&json).ok().map(|v| (key, v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn get_on_missing_key_is_none_not_error() {
        let store = Store::open_in_memory().unwrap();
        let found = store.get::<Widget>("widgets", "nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let w = Widget {
            name: "gear".to_string(),
            count: 3,
        };
        store.put("widgets", "a", &w).await.unwrap();
        let found = store.get::<Widget>("widgets", "a").await.unwrap();
        assert_eq!(found, Some(w));
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let store = Store::open_in_memory().unwrap();
        store
            .put(
                "widgets",
                "a",
                &Widget {
                    name: "gear".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();
        store
            .put(
                "widgets",
                "a",
                &Widget {
                    name: "gear".to_string(),
                    count: 2,
                },
            )
            .await
            .unwrap();
        let found = store.get::<Widget>("widgets", "a").await.unwrap().unwrap();
        assert_eq!(found.count, 2);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = Store::open_in_memory().unwrap();
        store
            .put(
                "widgets",
                "a",
                &Widget {
                    name: "gear".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();
        store.delete("widgets", "a").await.unwrap();
        assert!(store.get::<Widget>("widgets", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn iter_returns_all_entries() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .put(
                    "widgets",
                    &format!("k{i}"),
                    &Widget {
                        name: format!("gear-{i}"),
                        count: i,
                    },
                )
                .await
                .unwrap();
        }
        let mut all = store.iter::<Widget>("widgets").await.unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].0, "k1");
        assert_eq!(all[1].1.count, 1);
    }

    #[tokio::test]
    async fn corrupt_value_surfaces_as_typed_error_not_panic() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_table("widgets").await.unwrap();
        {
            let db = store.db.lock().unwrap();
            db.execute(
                "INSERT INTO widgets (key, value) VALUES (?1, ?2)",
                params!["broken", "not json"],
            )
            .unwrap();
        }
        let err = store.get::<Widget>("widgets", "broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn iter_skips_corrupt_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .put(
                "widgets",
                "good",
                &Widget {
                    name: "gear".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();
        {
            let db = store.db.lock().unwrap();
            db.execute(
                "INSERT INTO widgets (key, value) VALUES (?1, ?2)",
                params!["bad", "not json"],
            )
            .unwrap();
        }
        let all = store.iter::<Widget>("widgets").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "good");
    }

    #[tokio::test]
    async fn table_names_are_sanitized() {
        let store = Store::open_in_memory().unwrap();
        store
            .put(
                "agent name!",
                "a",
                &Widget {
                    name: "gear".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();
        let found = store
            .get::<Widget>("agent name!", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.count, 1);
    }
}
