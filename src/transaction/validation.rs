/// Signing and verification of transaction inputs
use crate::crypto::{hash_pub_key, verify_hash, KeyPair};
use crate::error::ChainError;
use crate::transaction::types::{Transaction, TxInput};
use std::collections::HashMap;

/// Previous transactions keyed by id, as needed to sign or verify inputs.
pub type PrevTransactions = HashMap<Vec<u8>, Transaction>;

impl Transaction {
    /// Copy with every input's signature and public key cleared.
    pub fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|input| TxInput {
                    txid: input.txid.clone(),
                    vout: input.vout,
                    signature: Vec::new(),
                    pub_key: Vec::new(),
                })
                .collect(),
            outputs: self.outputs.clone(),
        }
    }

    fn ensure_prev_known(&self, prev_txs: &PrevTransactions) -> Result<(), ChainError> {
        for input in &self.inputs {
            if !prev_txs.contains_key(&input.txid) {
                return Err(ChainError::NotFound(format!(
                    "Previous transaction {} is not on the chain",
                    hex::encode(&input.txid)
                )));
            }
        }
        Ok(())
    }

    fn spent_output<'p>(
        input: &TxInput,
        prev_txs: &'p PrevTransactions,
    ) -> Result<&'p crate::transaction::TxOutput, ChainError> {
        let prev = prev_txs.get(&input.txid).ok_or_else(|| {
            ChainError::NotFound(format!("Previous transaction {}", hex::encode(&input.txid)))
        })?;
        usize::try_from(input.vout)
            .ok()
            .and_then(|index| prev.outputs.get(index))
            .ok_or_else(|| {
                ChainError::Validation(format!(
                    "Output {} does not exist in {}",
                    input.vout,
                    hex::encode(&input.txid)
                ))
            })
    }

    /// Digest signed by input `index`: the trimmed copy with only that
    /// input's public key replaced by the locking hash it spends.
    pub fn signature_hash(
        &self,
        index: usize,
        prev_txs: &PrevTransactions,
    ) -> Result<Vec<u8>, ChainError> {
        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| ChainError::Validation(format!("No input at index {}", index)))?;
        let locking = Self::spent_output(input, prev_txs)?.pub_key_hash;

        let mut copy = self.trimmed_copy();
        copy.inputs[index].pub_key = locking.to_vec();
        Ok(copy.hash())
    }

    /// Sign every input and re-derive the id over the signed contents.
    /// Coinbases are left untouched.
    pub fn sign(&mut self, keypair: &KeyPair, prev_txs: &PrevTransactions) -> Result<(), ChainError> {
        if self.is_coinbase() {
            return Ok(());
        }
        self.ensure_prev_known(prev_txs)?;

        for index in 0..self.inputs.len() {
            let digest = self.signature_hash(index, prev_txs)?;
            self.inputs[index].signature = keypair.sign_hash(&digest)?;
        }
        // Signature digests hash with the id cleared, so this keeps them valid.
        self.id = self.hash();
        Ok(())
    }

    /// True when every input carries a valid signature from the key its
    /// spent output is locked to. Stops at the first bad input.
    pub fn verify(&self, prev_txs: &PrevTransactions) -> Result<bool, ChainError> {
        if self.is_coinbase() {
            return Ok(true);
        }
        self.ensure_prev_known(prev_txs)?;

        for (index, input) in self.inputs.iter().enumerate() {
            let locking = Self::spent_output(input, prev_txs)?.pub_key_hash;
            if hash_pub_key(&input.pub_key) != locking {
                return Ok(false);
            }
            let digest = self.signature_hash(index, prev_txs)?;
            if !verify_hash(&input.pub_key, &digest, &input.signature) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
