//! Proof-of-work mining
//!
//! A block is valid when `SHA256(prev_hash, transactions, target, height,
//! timestamp, nonce)`, read as a big-endian integer, is strictly below
//! `2^(256 - difficulty)`.

use crate::blockchain::{Block, Sha256Hash};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Number of leading zero bits required by default.
pub const DEFAULT_DIFFICULTY: u32 = 12;

/// Big-endian `2^(256 - difficulty)`. Difficulty 0 saturates to the maximum target.
pub fn target_for(difficulty: u32) -> [u8; 32] {
    let mut target = [0u8; 32];
    if difficulty == 0 {
        return [0xFF; 32];
    }
    let bit = 256u32.saturating_sub(difficulty);
    if bit >= 256 {
        return [0xFF; 32];
    }
    let byte_index = 31 - (bit / 8) as usize;
    target[byte_index] = 1u8 << (bit % 8);
    target
}

pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: [u8; 32],
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork {
            block,
            target: target_for(block.difficulty),
        }
    }

    pub fn target(&self) -> &[u8; 32] {
        &self.target
    }

    /// Everything except the nonce, so the search loop only clones the state.
    fn prefix_hasher(&self) -> Sha256 {
        let mut hasher = Sha256::new();
        let prev = self.block.prev_hash.map(|h| h.to_vec()).unwrap_or_default();
        hasher.update((prev.len() as u64).to_be_bytes());
        hasher.update(&prev);
        hasher.update((self.block.transactions.len() as u64).to_be_bytes());
        for tx in &self.block.transactions {
            tx.write_canonical(&mut hasher);
        }
        hasher.update(self.target);
        hasher.update(self.block.height.to_be_bytes());
        hasher.update(self.block.timestamp.to_be_bytes());
        hasher
    }

    fn hash_with(prefix: &Sha256, nonce: u64) -> Sha256Hash {
        let mut hasher = prefix.clone();
        hasher.update(nonce.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn hash_for_nonce(&self, nonce: u64) -> Sha256Hash {
        Self::hash_with(&self.prefix_hasher(), nonce)
    }

    pub fn meets_target(&self, hash: &Sha256Hash) -> bool {
        // Byte arrays compare lexicographically, which is big-endian numeric order.
        hash < &self.target
    }

    /// Search nonces from 0 until one satisfies the target. Unbounded.
    pub fn run(&self) -> (u64, Sha256Hash) {
        let prefix = self.prefix_hasher();
        let mut nonce = 0u64;
        loop {
            let hash = Self::hash_with(&prefix, nonce);
            if self.meets_target(&hash) {
                debug!(nonce, hash = %hex::encode(hash), "proof of work found");
                return (nonce, hash);
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Like [`run`](Self::run) but gives up after `max_attempts` nonces.
    pub fn run_bounded(&self, max_attempts: u64) -> Option<(u64, Sha256Hash)> {
        let prefix = self.prefix_hasher();
        (0..max_attempts).find_map(|nonce| {
            let hash = Self::hash_with(&prefix, nonce);
            self.meets_target(&hash).then_some((nonce, hash))
        })
    }

    /// Recompute the hash from the stored nonce and check both the stored hash
    /// and the target.
    pub fn validate(&self) -> bool {
        let hash = self.hash_for_nonce(self.block.nonce);
        hash == self.block.hash && self.meets_target(&hash)
    }
}

/// Mine `block` in place of its nonce and hash fields.
pub fn mine_block(mut block: Block) -> Block {
    let (nonce, hash) = ProofOfWork::new(&block).run();
    block.nonce = nonce;
    block.hash = hash;
    block
}
