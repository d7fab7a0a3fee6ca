//! Persistence for the TSS node.
//!
//! The coordination engine treats everything here as opaque: a key-share
//! record per pool public key, written once on keygen success, and a peer
//! address book refreshed after every successful session. The default
//! implementation stores both in SQLite.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open database: {0}")]
    Open(String),
    #[error("no key share stored for pool key {0}")]
    NotFound(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// One generated key share plus the session context needed to use it again.
///
/// `local_data` is the MPC backend's save blob; its encoding is the
/// backend's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenLocalState {
    pub pub_key: String,
    pub participant_keys: Vec<String>,
    pub local_party_key: String,
    pub local_data: Vec<u8>,
}

/// Storage interface consumed by the engine.
pub trait LocalStateManager: Send + Sync + 'static {
    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState, StorageError>;
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<(), StorageError>;
    fn save_address_book(&self, addresses: &[String]) -> Result<(), StorageError>;
    fn retrieve_address_book(&self) -> Result<Vec<String>, StorageError>;
}

/// SQLite-backed state manager.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Open(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS key_shares (
                pool_pub_key TEXT PRIMARY KEY,
                participant_keys TEXT NOT NULL,
                local_party_key TEXT NOT NULL,
                local_data BLOB NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS address_book (
                multiaddr TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        tracing::debug!("state store schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Query(format!("lock error: {}", e)))
    }
}

impl LocalStateManager for SqliteStateStore {
    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT pool_pub_key, participant_keys, local_party_key, local_data
                 FROM key_shares WHERE pool_pub_key = ?1",
            )
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut rows = stmt
            .query(params![pool_pub_key])
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let row = rows
            .next()
            .map_err(|e| StorageError::Query(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(pool_pub_key.to_string()))?;

        let participants_json: String = row.get(1).map_err(|e| StorageError::Query(e.to_string()))?;
        let participant_keys: Vec<String> = serde_json::from_str(&participants_json)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        Ok(KeygenLocalState {
            pub_key: row.get(0).map_err(|e| StorageError::Query(e.to_string()))?,
            participant_keys,
            local_party_key: row.get(2).map_err(|e| StorageError::Query(e.to_string()))?,
            local_data: row.get(3).map_err(|e| StorageError::Query(e.to_string()))?,
        })
    }

    fn save_local_state(&self, state: &KeygenLocalState) -> Result<(), StorageError> {
        let participants_json = serde_json::to_string(&state.participant_keys)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO key_shares
             (pool_pub_key, participant_keys, local_party_key, local_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                state.pub_key,
                participants_json,
                state.local_party_key,
                state.local_data,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        tracing::info!("saved key share for pool key {}", state.pub_key);
        Ok(())
    }

    fn save_address_book(&self, addresses: &[String]) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        for addr in addresses {
            conn.execute(
                "INSERT OR REPLACE INTO address_book (multiaddr, last_seen) VALUES (?1, ?2)",
                params![addr, now],
            )
            .map_err(|e| StorageError::Query(e.to_string()))?;
        }
        Ok(())
    }

    fn retrieve_address_book(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT multiaddr FROM address_book ORDER BY multiaddr")
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let addrs = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Query(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> KeygenLocalState {
        KeygenLocalState {
            pub_key: "aabbcc".to_string(),
            participant_keys: vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
            local_party_key: "k2".to_string(),
            local_data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn key_share_round_trip() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let state = sample_state();

        store.save_local_state(&state).unwrap();
        let loaded = store.get_local_state("aabbcc").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_pool_key_is_not_found() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        match store.get_local_state("nope") {
            Err(StorageError::NotFound(key)) => assert_eq!(key, "nope"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn save_overwrites_existing_share() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut state = sample_state();
        store.save_local_state(&state).unwrap();

        state.local_data = vec![9, 9, 9];
        store.save_local_state(&state).unwrap();

        let loaded = store.get_local_state("aabbcc").unwrap();
        assert_eq!(loaded.local_data, vec![9, 9, 9]);
    }

    #[test]
    fn address_book_deduplicates_entries() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .save_address_book(&["/ip4/1.2.3.4/tcp/6668/p2p/abc".to_string()])
            .unwrap();
        store
            .save_address_book(&[
                "/ip4/1.2.3.4/tcp/6668/p2p/abc".to_string(),
                "/ip4/5.6.7.8/tcp/6668/p2p/def".to_string(),
            ])
            .unwrap();

        let book = store.retrieve_address_book().unwrap();
        assert_eq!(book.len(), 2);
    }
}
