//! Database persistence layer for Coinpit
//!
//! Three logical tables: `blocks` (hash -> serialized block), `metadata`
//! (the reserved key `lh` names the tip) and `utxo` (txid -> serialized
//! unspent outputs).

use crate::blockchain::{Block, Sha256Hash, UnspentOutput, UtxoEntries};
use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Reserved metadata key holding the tip hash.
pub const TIP_KEY: &str = "lh";

/// A batch of index writes: `Some` replaces the entry, `None` deletes it.
pub type UtxoChanges = Vec<(Vec<u8>, Option<Vec<UnspentOutput>>)>;

/// Abstraction for persistence backends. Appends and index batches must be
/// atomic: either every write lands or none does.
pub trait Persistence: Send + Sync {
    fn tip(&self) -> Result<Option<Sha256Hash>, ChainError>;
    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>, ChainError>;
    /// Store `block` and move the tip to it, provided the tip is still `expected_tip`.
    fn append_block(&self, block: &Block, expected_tip: Option<Sha256Hash>) -> Result<(), ChainError>;
    fn utxo_get(&self, txid: &[u8]) -> Result<Option<Vec<UnspentOutput>>, ChainError>;
    /// All entries, ordered by txid.
    fn utxo_entries(&self) -> Result<UtxoEntries, ChainError>;
    fn utxo_apply(&self, changes: &UtxoChanges) -> Result<(), ChainError>;
    /// Drop the whole index and write `entries` in its place.
    fn utxo_replace(&self, entries: &UtxoEntries) -> Result<(), ChainError>;
    fn utxo_count(&self) -> Result<usize, ChainError>;
}

fn stale_tip(expected: Option<Sha256Hash>, found: Option<Sha256Hash>) -> ChainError {
    let show = |hash: Option<Sha256Hash>| hash.map(hex::encode).unwrap_or_else(|| "<none>".to_string());
    ChainError::StaleTip {
        expected: show(expected),
        found: show(found),
    }
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Sha256Hash, ChainError> {
    Sha256Hash::try_from(bytes)
        .map_err(|_| ChainError::Database(format!("Corrupt hash of {} bytes", bytes.len())))
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the ledger file at `path`.
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Database(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Open a ledger file that must already exist.
    pub fn open_existing(path: &Path) -> Result<Self, ChainError> {
        if !path.exists() {
            return Err(ChainError::NotFound(format!(
                "No ledger at {}",
                path.display()
            )));
        }
        Self::open(path)
    }

    pub fn in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::Database(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ChainError> {
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash BLOB PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::Database(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::Database(format!("Failed to create metadata table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS utxo (
                txid BLOB PRIMARY KEY,
                outputs BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::Database(format!("Failed to create utxo table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::Database("Mutex poisoned".to_string()))
    }

    fn read_tip(conn: &Connection) -> Result<Option<Sha256Hash>, ChainError> {
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![TIP_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value.map(|bytes| hash_from_bytes(&bytes)).transpose()
    }
}

impl Persistence for Database {
    fn tip(&self) -> Result<Option<Sha256Hash>, ChainError> {
        let conn = self.lock()?;
        Self::read_tip(&conn)
    }

    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>, ChainError> {
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM blocks WHERE hash = ?1",
                params![hash.to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|bytes| bincode::deserialize(&bytes).map_err(ChainError::from))
            .transpose()
    }

    fn append_block(&self, block: &Block, expected_tip: Option<Sha256Hash>) -> Result<(), ChainError> {
        let data = bincode::serialize(block)?;

        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before the tip is read.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::read_tip(&tx)?;
        if current != expected_tip {
            return Err(stale_tip(expected_tip, current));
        }

        tx.execute(
            "INSERT INTO blocks (hash, data) VALUES (?1, ?2)",
            params![block.hash.to_vec(), data],
        )
        .map_err(|e| ChainError::Database(format!("Failed to save block: {}", e)))?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![TIP_KEY, block.hash.to_vec()],
        )
        .map_err(|e| ChainError::Database(format!("Failed to move tip: {}", e)))?;

        tx.commit()
            .map_err(|e| ChainError::Database(format!("Failed to commit block: {}", e)))?;
        Ok(())
    }

    fn utxo_get(&self, txid: &[u8]) -> Result<Option<Vec<UnspentOutput>>, ChainError> {
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT outputs FROM utxo WHERE txid = ?1",
                params![txid],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|bytes| bincode::deserialize(&bytes).map_err(ChainError::from))
            .transpose()
    }

    fn utxo_entries(&self) -> Result<UtxoEntries, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT txid, outputs FROM utxo ORDER BY txid")
            .map_err(|e| ChainError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt.query_map([], |row| {
            let txid: Vec<u8> = row.get(0)?;
            let outputs: Vec<u8> = row.get(1)?;
            Ok((txid, outputs))
        })?;

        let mut entries = UtxoEntries::new();
        for row in rows {
            let (txid, outputs) = row?;
            entries.insert(txid, bincode::deserialize(&outputs)?);
        }
        Ok(entries)
    }

    fn utxo_apply(&self, changes: &UtxoChanges) -> Result<(), ChainError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (txid, outputs) in changes {
            match outputs {
                Some(outputs) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO utxo (txid, outputs) VALUES (?1, ?2)",
                        params![txid, bincode::serialize(outputs)?],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM utxo WHERE txid = ?1", params![txid])?;
                }
            }
        }
        tx.commit()
            .map_err(|e| ChainError::Database(format!("Failed to commit UTXO batch: {}", e)))?;
        Ok(())
    }

    fn utxo_replace(&self, entries: &UtxoEntries) -> Result<(), ChainError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM utxo", [])
            .map_err(|e| ChainError::Database(format!("Failed to clear utxo: {}", e)))?;
        for (txid, outputs) in entries {
            tx.execute(
                "INSERT INTO utxo (txid, outputs) VALUES (?1, ?2)",
                params![txid, bincode::serialize(outputs)?],
            )?;
        }
        tx.commit()
            .map_err(|e| ChainError::Database(format!("Failed to commit reindex: {}", e)))?;
        Ok(())
    }

    fn utxo_count(&self) -> Result<usize, ChainError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM utxo", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[derive(Default)]
struct MemoryState {
    blocks: HashMap<Sha256Hash, Block>,
    tip: Option<Sha256Hash>,
    utxo: UtxoEntries,
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<MemoryState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::Database("Mutex poisoned".to_string()))
    }
}

impl Persistence for InMemoryPersistence {
    fn tip(&self) -> Result<Option<Sha256Hash>, ChainError> {
        Ok(self.lock()?.tip)
    }

    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>, ChainError> {
        Ok(self.lock()?.blocks.get(hash).cloned())
    }

    fn append_block(&self, block: &Block, expected_tip: Option<Sha256Hash>) -> Result<(), ChainError> {
        let mut state = self.lock()?;
        if state.tip != expected_tip {
            return Err(stale_tip(expected_tip, state.tip));
        }
        state.blocks.insert(block.hash, block.clone());
        state.tip = Some(block.hash);
        Ok(())
    }

    fn utxo_get(&self, txid: &[u8]) -> Result<Option<Vec<UnspentOutput>>, ChainError> {
        Ok(self.lock()?.utxo.get(txid).cloned())
    }

    fn utxo_entries(&self) -> Result<UtxoEntries, ChainError> {
        Ok(self.lock()?.utxo.clone())
    }

    fn utxo_apply(&self, changes: &UtxoChanges) -> Result<(), ChainError> {
        let mut state = self.lock()?;
        for (txid, outputs) in changes {
            match outputs {
                Some(outputs) => {
                    state.utxo.insert(txid.clone(), outputs.clone());
                }
                None => {
                    state.utxo.remove(txid);
                }
            }
        }
        Ok(())
    }

    fn utxo_replace(&self, entries: &UtxoEntries) -> Result<(), ChainError> {
        self.lock()?.utxo = entries.clone();
        Ok(())
    }

    fn utxo_count(&self) -> Result<usize, ChainError> {
        Ok(self.lock()?.utxo.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Transaction, TxOutput};

    fn sample_block(prev: Option<Sha256Hash>, seed: u8) -> Block {
        let coinbase = Transaction::coinbase_to_hash([seed; 20], Some("sample"), 100);
        let mut block = Block::candidate(vec![coinbase], prev, 0, 1);
        block.hash = [seed; 32];
        block
    }

    fn sample_entry(seed: u8) -> Vec<UnspentOutput> {
        vec![UnspentOutput {
            index: 0,
            output: TxOutput {
                value: seed as u64,
                pub_key_hash: [seed; 20],
            },
        }]
    }

    fn exercise_backend(store: &dyn Persistence) {
        assert_eq!(store.tip().unwrap(), None);

        let genesis = sample_block(None, 1);
        store.append_block(&genesis, None).unwrap();
        assert_eq!(store.tip().unwrap(), Some(genesis.hash));
        assert_eq!(store.get_block(&genesis.hash).unwrap(), Some(genesis.clone()));

        // A second writer that still believes the ledger is empty loses.
        let rival = sample_block(None, 2);
        assert!(matches!(
            store.append_block(&rival, None),
            Err(ChainError::StaleTip { .. })
        ));
        assert_eq!(store.tip().unwrap(), Some(genesis.hash));
        assert_eq!(store.get_block(&rival.hash).unwrap(), None);

        let next = sample_block(Some(genesis.hash), 3);
        store.append_block(&next, Some(genesis.hash)).unwrap();
        assert_eq!(store.tip().unwrap(), Some(next.hash));

        store
            .utxo_apply(&vec![(vec![2], Some(sample_entry(2))), (vec![1], Some(sample_entry(1)))])
            .unwrap();
        assert_eq!(store.utxo_count().unwrap(), 2);
        let keys: Vec<Vec<u8>> = store.utxo_entries().unwrap().into_keys().collect();
        assert_eq!(keys, vec![vec![1], vec![2]]);

        store.utxo_apply(&vec![(vec![1], None)]).unwrap();
        assert_eq!(store.utxo_get(&[1]).unwrap(), None);
        assert_eq!(store.utxo_get(&[2]).unwrap(), Some(sample_entry(2)));

        let mut fresh = UtxoEntries::new();
        fresh.insert(vec![9], sample_entry(9));
        store.utxo_replace(&fresh).unwrap();
        assert_eq!(store.utxo_entries().unwrap(), fresh);
    }

    #[test]
    fn test_in_memory_backend() {
        exercise_backend(&InMemoryPersistence::new());
    }

    #[test]
    fn test_sqlite_backend() {
        exercise_backend(&Database::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks_test.db");

        assert!(matches!(
            Database::open_existing(&path),
            Err(ChainError::NotFound(_))
        ));

        let genesis = sample_block(None, 4);
        {
            let db = Database::open(&path).unwrap();
            db.append_block(&genesis, None).unwrap();
        }

        let db = Database::open_existing(&path).unwrap();
        assert_eq!(db.tip().unwrap(), Some(genesis.hash));
        assert_eq!(db.get_block(&genesis.hash).unwrap().unwrap().height, 0);
    }
}
