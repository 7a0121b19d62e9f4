/// Local cache storage backed by a sled embedded database.
///
/// The rest of the crate treats this as an opaque get/set/remove/clear
/// interface keyed by hierarchical string paths; values are JSON.
use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Hierarchical storage keys shared by every writer of the same record
pub mod keys {
    /// Persisted login state
    pub fn state() -> String {
        "state".to_string()
    }

    /// Cached user profile
    pub fn user(id: &str) -> String {
        format!("user/{}", id)
    }

    /// Cached follower/followed id lists
    pub fn follow(id: &str) -> String {
        format!("follow/{}", id)
    }

    /// Per-conversation persisted state
    pub fn chat_data(from: &str, to: &str) -> String {
        format!("chat-data/{}/{}", from, to)
    }

    /// Per-user coordinator meta
    pub fn chat_manager(user_id: &str) -> String {
        format!("chat-manager/{}", user_id)
    }
}

#[derive(Clone)]
pub struct Store {
    db: Arc<sled::Db>,
}

impl Store {
    /// Open (or create) the cache database in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("cache.db");
        debug!("Opening local cache at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open cache: {}", e)))?;

        info!("Local cache initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch and decode a record; `None` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("get '{}': {}", key, e)))?
        {
            Some(value) => {
                let record = serde_json::from_slice(&value)
                    .map_err(|e| SyncError::Storage(format!("decode '{}': {}", key, e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Encode and store a record under the key
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| SyncError::Storage(format!("encode '{}': {}", key, e)))?;

        self.db
            .insert(key.as_bytes(), encoded)
            .map_err(|e| SyncError::Storage(format!("set '{}': {}", key, e)))?;

        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush: {}", e)))?;

        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("remove '{}': {}", key, e)))?;
        Ok(())
    }

    /// Drop every stored record
    pub fn clear(&self) -> Result<()> {
        self.db
            .clear()
            .map_err(|e| SyncError::Storage(format!("clear: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush: {}", e)))?;
        Ok(())
    }
}
