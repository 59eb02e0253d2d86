//! Durable preference store
//!
//! A handful of values must survive process restarts: the migrated flag that
//! short-circuits later migration runs, the cached balance, and the last
//! user/environment pair used for reset detection. Backed by a single
//! key-value table in SQLite, with an in-memory variant for tests.

use crate::error::StoreError;
use crate::types::Balance;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Mutex;

const KEY_MIGRATED: &str = "did_migrate_to_sdk";
const KEY_MIGRATED_AT: &str = "migrated_at";
const KEY_LAST_BALANCE: &str = "last_balance";
const KEY_LAST_USER: &str = "last_signed_in_user";
const KEY_LAST_ENVIRONMENT: &str = "last_environment";
const KEY_FIRST_SPEND: &str = "first_spend_submitted";

/// Abstraction over durable key-value storage. The typed accessors are
/// shared by every backend.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Whether a successful migration has been recorded.
    fn is_migrated(&self) -> Result<bool, StoreError> {
        Ok(self.get(KEY_MIGRATED)?.as_deref() == Some("true"))
    }

    /// Records a successful migration, stamped with the completion time.
    fn set_migrated(&self) -> Result<(), StoreError> {
        self.set(KEY_MIGRATED, "true")?;
        self.set(KEY_MIGRATED_AT, &Utc::now().to_rfc3339())
    }

    fn migrated_at(&self) -> Result<Option<String>, StoreError> {
        self.get(KEY_MIGRATED_AT)
    }

    fn last_balance(&self) -> Result<Option<Balance>, StoreError> {
        match self.get(KEY_LAST_BALANCE)? {
            Some(blob) => serde_json::from_str(&blob)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn set_last_balance(&self, balance: Option<&Balance>) -> Result<(), StoreError> {
        match balance {
            Some(balance) => {
                let blob = serde_json::to_string(balance)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.set(KEY_LAST_BALANCE, &blob)
            }
            None => self.remove(KEY_LAST_BALANCE),
        }
    }

    fn first_spend_submitted(&self) -> Result<bool, StoreError> {
        Ok(self.get(KEY_FIRST_SPEND)?.as_deref() == Some("true"))
    }

    fn set_first_spend_submitted(&self, submitted: bool) -> Result<(), StoreError> {
        self.set(KEY_FIRST_SPEND, if submitted { "true" } else { "false" })
    }

    /// Records the user/environment pair for this session and reports whether
    /// the caller must reset local state: true when a different user signed
    /// in, or the environment changed since the last run.
    fn register_session(&self, user_id: &str, environment: &str) -> Result<bool, StoreError> {
        let last_user = self.get(KEY_LAST_USER)?;
        let last_environment = self.get(KEY_LAST_ENVIRONMENT)?;

        let needs_reset = last_user.as_deref() != Some(user_id)
            || last_environment
                .as_deref()
                .map(|name| name != environment)
                .unwrap_or(false);

        if needs_reset {
            self.set_first_spend_submitted(false)?;
        }
        self.set(KEY_LAST_USER, user_id)?;
        self.set(KEY_LAST_ENVIRONMENT, environment)?;
        Ok(needs_reset)
    }
}

/// SQLite-backed store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StoreError::Database(format!("Failed to create preferences table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        let mut stmt = conn
            .prepare("SELECT value FROM preferences WHERE key = ?1")
            .map_err(|e| StoreError::Database(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Database(format!("Failed to query preference: {}", e)))?;
        match rows.next() {
            Some(value) => value
                .map(Some)
                .map_err(|e| StoreError::Database(format!("Failed to read preference: {}", e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO preferences (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| StoreError::Database(format!("Failed to save preference: {}", e)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        conn.execute("DELETE FROM preferences WHERE key = ?1", params![key])
            .map_err(|e| StoreError::Database(format!("Failed to remove preference: {}", e)))?;
        Ok(())
    }
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    values: std::sync::Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Database("Mutex poisoned".to_string()))?;
        values.remove(key);
        Ok(())
    }
}
