use crate::blockchain::core::validation::validate_block_transactions;
use crate::crypto::KeyPair;
use crate::error::ChainError;
use crate::miner::{mine_block, ProofOfWork};
use crate::persistence::Persistence;
use crate::transaction::{PrevTransactions, Transaction};
use std::sync::Arc;
use tracing::{debug, info};

pub type Sha256Hash = [u8; 32];

/// Data carried by the genesis coinbase.
pub const GENESIS_COINBASE_DATA: &str = "First Transaction from Genesis";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub height: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    /// `None` only for genesis.
    pub prev_hash: Option<Sha256Hash>,
    pub hash: Sha256Hash,
    pub nonce: u64,
    pub difficulty: u32,
}

impl Block {
    /// An unmined block stamped with the current time.
    pub fn candidate(
        transactions: Vec<Transaction>,
        prev_hash: Option<Sha256Hash>,
        height: u64,
        difficulty: u32,
    ) -> Self {
        Block {
            height,
            timestamp: chrono::Utc::now().timestamp(),
            transactions,
            prev_hash,
            hash: [0u8; 32],
            nonce: 0,
            difficulty,
        }
    }

    /// Build and mine a block.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Option<Sha256Hash>,
        height: u64,
        difficulty: u32,
    ) -> Self {
        mine_block(Self::candidate(transactions, prev_hash, height, difficulty))
    }

    pub fn genesis(coinbase: Transaction, difficulty: u32) -> Self {
        Self::new(vec![coinbase], None, 0, difficulty)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_none()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn prev_hash_hex(&self) -> String {
        self.prev_hash.map(hex::encode).unwrap_or_default()
    }

    pub fn validate_pow(&self) -> bool {
        ProofOfWork::new(self).validate()
    }
}

/// Walks from the tip back to genesis.
pub struct BlockchainIterator<'a> {
    current: Option<Sha256Hash>,
    persistence: &'a dyn Persistence,
}

impl Iterator for BlockchainIterator<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;
        match self.persistence.get_block(&hash) {
            Ok(Some(block)) => {
                self.current = block.prev_hash;
                Some(Ok(block))
            }
            Ok(None) => Some(Err(ChainError::NotFound(format!(
                "Block {} is referenced but not stored",
                hex::encode(hash)
            )))),
            Err(e) => Some(Err(e)),
        }
    }
}

pub struct Blockchain {
    tip: Sha256Hash,
    difficulty: u32,
    persistence: Arc<dyn Persistence>,
}

impl Blockchain {
    /// Create a ledger whose genesis coinbase pays `reward` to `address`.
    /// Fails if `persistence` already holds a ledger.
    pub fn init(
        persistence: Arc<dyn Persistence>,
        address: &str,
        difficulty: u32,
        reward: u64,
    ) -> Result<Self, ChainError> {
        if let Some(tip) = persistence.tip()? {
            return Err(ChainError::AlreadyExists(format!(
                "Ledger already exists with tip {}",
                hex::encode(tip)
            )));
        }

        let coinbase = Transaction::coinbase(address, Some(GENESIS_COINBASE_DATA), reward)?;
        let genesis = Block::genesis(coinbase, difficulty);

        persistence.append_block(&genesis, None).map_err(|e| match e {
            ChainError::StaleTip { found, .. } => {
                ChainError::AlreadyExists(format!("Ledger already exists with tip {}", found))
            }
            other => other,
        })?;

        info!(hash = %genesis.hash_hex(), %address, "created genesis block");
        Ok(Blockchain {
            tip: genesis.hash,
            difficulty,
            persistence,
        })
    }

    /// Reopen an existing ledger.
    pub fn open(persistence: Arc<dyn Persistence>, difficulty: u32) -> Result<Self, ChainError> {
        let tip = persistence
            .tip()?
            .ok_or_else(|| ChainError::NotFound("No existing ledger found".to_string()))?;
        debug!(tip = %hex::encode(tip), "opened ledger");
        Ok(Blockchain {
            tip,
            difficulty,
            persistence,
        })
    }

    pub fn tip(&self) -> Sha256Hash {
        self.tip
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    /// Re-read the tip from storage after another writer moved it.
    pub fn refresh_tip(&mut self) -> Result<(), ChainError> {
        if let Some(tip) = self.persistence.tip()? {
            self.tip = tip;
        }
        Ok(())
    }

    pub fn last_block(&self) -> Result<Block, ChainError> {
        self.persistence
            .get_block(&self.tip)?
            .ok_or_else(|| ChainError::NotFound(format!("Tip block {}", hex::encode(self.tip))))
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        Ok(self.last_block()?.height)
    }

    pub fn iter(&self) -> BlockchainIterator<'_> {
        BlockchainIterator {
            current: Some(self.tip),
            persistence: self.persistence.as_ref(),
        }
    }

    /// Up to `limit` blocks, newest first.
    pub fn blocks(&self, limit: usize) -> Result<Vec<Block>, ChainError> {
        self.iter().take(limit).collect()
    }

    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, ChainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(tx);
            }
        }
        Err(ChainError::NotFound(format!("Transaction {}", hex::encode(id))))
    }

    fn previous_transactions(&self, tx: &Transaction) -> Result<PrevTransactions, ChainError> {
        let mut prev = PrevTransactions::new();
        for input in &tx.inputs {
            if !prev.contains_key(&input.txid) {
                let found = self.find_transaction(&input.txid)?;
                prev.insert(found.id.clone(), found);
            }
        }
        Ok(prev)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, keypair: &KeyPair) -> Result<(), ChainError> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev = self.previous_transactions(tx)?;
        tx.sign(keypair, &prev)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev = self.previous_transactions(tx)?;
        tx.verify(&prev)
    }

    /// Verify `transactions`, mine them on top of the tip and persist the block.
    /// Nothing is written if any transaction is invalid or the tip moved.
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block, ChainError> {
        validate_block_transactions(self, &transactions)?;

        let last = self.last_block()?;
        let block = Block::new(transactions, Some(self.tip), last.height + 1, self.difficulty);

        self.persistence.append_block(&block, Some(self.tip))?;
        self.tip = block.hash;

        info!(
            height = block.height,
            hash = %block.hash_hex(),
            transactions = block.transactions.len(),
            "mined block"
        );
        Ok(block)
    }
}
