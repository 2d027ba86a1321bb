use crate::crypto::PubKeyHash;
use crate::error::ChainError;
use crate::persistence::UtxoChanges;
use crate::transaction::TxOutput;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use super::chain::{Block, Blockchain};

/// An output that has not been spent, with its position in the creating transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UnspentOutput {
    pub index: u32,
    pub output: TxOutput,
}

/// txid -> unspent outputs of that transaction, ordered by txid.
pub type UtxoEntries = BTreeMap<Vec<u8>, Vec<UnspentOutput>>;

/// Scan the whole chain and collect every output no later input spends.
///
/// Blocks arrive newest first. All inputs of a block are recorded before its
/// outputs are considered, so an output spent in its own block is excluded.
pub fn collect_unspent<I>(blocks: I) -> Result<UtxoEntries, ChainError>
where
    I: IntoIterator<Item = Result<Block, ChainError>>,
{
    let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();
    let mut entries = UtxoEntries::new();

    for block in blocks {
        let block = block?;

        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.inputs {
                spent.entry(input.txid.clone()).or_default().insert(input.vout);
            }
        }

        for tx in &block.transactions {
            let spent_here = spent.get(&tx.id);
            let unspent: Vec<UnspentOutput> = tx
                .outputs
                .iter()
                .enumerate()
                .filter(|(index, _)| {
                    !spent_here.is_some_and(|set| set.contains(&(*index as i64)))
                })
                .map(|(index, output)| UnspentOutput {
                    index: index as u32,
                    output: output.clone(),
                })
                .collect();
            if !unspent.is_empty() {
                entries.insert(tx.id.clone(), unspent);
            }
        }
    }

    Ok(entries)
}

/// Apply one block's effects to `entries`, transaction by transaction.
/// Entries emptied by a spend are removed.
pub fn apply_block(entries: &mut UtxoEntries, block: &Block) {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let Some(outputs) = entries.get_mut(&input.txid) else {
                    warn!(txid = %hex::encode(&input.txid), "spent transaction missing from UTXO index");
                    continue;
                };
                outputs.retain(|unspent| i64::from(unspent.index) != input.vout);
                if outputs.is_empty() {
                    entries.remove(&input.txid);
                }
            }
        }

        let created = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| UnspentOutput {
                index: index as u32,
                output: output.clone(),
            })
            .collect::<Vec<_>>();
        if !created.is_empty() {
            entries.insert(tx.id.clone(), created);
        }
    }
}

/// The persisted UTXO index of a chain.
pub struct UtxoSet<'a> {
    chain: &'a Blockchain,
}

impl<'a> UtxoSet<'a> {
    pub fn new(chain: &'a Blockchain) -> Self {
        UtxoSet { chain }
    }

    pub fn chain(&self) -> &'a Blockchain {
        self.chain
    }

    /// Rebuild the index from the full chain, replacing whatever was stored.
    /// Returns the number of transactions with unspent outputs.
    pub fn reindex(&self) -> Result<usize, ChainError> {
        let entries = collect_unspent(self.chain.iter())?;
        self.chain.persistence().utxo_replace(&entries)?;
        info!(transactions = entries.len(), "rebuilt UTXO index");
        Ok(entries.len())
    }

    /// Incrementally apply a freshly mined block. Only the touched entries
    /// are read and written, in one batch.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        let store = self.chain.persistence();

        let mut touched: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut view = UtxoEntries::new();
        for tx in &block.transactions {
            touched.insert(tx.id.clone());
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if touched.insert(input.txid.clone()) {
                    if let Some(outputs) = store.utxo_get(&input.txid)? {
                        view.insert(input.txid.clone(), outputs);
                    }
                }
            }
        }

        apply_block(&mut view, block);

        let changes: UtxoChanges = touched
            .into_iter()
            .map(|txid| {
                let outputs = view.remove(&txid);
                (txid, outputs)
            })
            .collect();
        store.utxo_apply(&changes)?;
        debug!(height = block.height, entries = changes.len(), "updated UTXO index");
        Ok(())
    }

    /// Collect outputs locked to `pub_key_hash`, in index order, until at
    /// least `amount` is gathered. Returns the total and txid -> output indices.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &PubKeyHash,
        amount: u64,
    ) -> Result<(u64, BTreeMap<Vec<u8>, Vec<u32>>), ChainError> {
        let mut accumulated = 0u64;
        let mut spendable: BTreeMap<Vec<u8>, Vec<u32>> = BTreeMap::new();

        'entries: for (txid, outputs) in self.chain.persistence().utxo_entries()? {
            for unspent in outputs {
                if accumulated >= amount {
                    break 'entries;
                }
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(unspent.output.value);
                    spendable.entry(txid.clone()).or_default().push(unspent.index);
                }
            }
        }

        Ok((accumulated, spendable))
    }

    /// Every unspent output locked to `pub_key_hash`.
    pub fn find_unspent_transactions(
        &self,
        pub_key_hash: &PubKeyHash,
    ) -> Result<Vec<TxOutput>, ChainError> {
        Ok(self
            .chain
            .persistence()
            .utxo_entries()?
            .into_values()
            .flatten()
            .filter(|unspent| unspent.output.is_locked_with_key(pub_key_hash))
            .map(|unspent| unspent.output)
            .collect())
    }

    pub fn balance(&self, pub_key_hash: &PubKeyHash) -> Result<u64, ChainError> {
        Ok(self
            .find_unspent_transactions(pub_key_hash)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Number of transactions that still have unspent outputs.
    pub fn count_transactions(&self) -> Result<usize, ChainError> {
        self.chain.persistence().utxo_count()
    }

    pub fn snapshot(&self) -> Result<UtxoEntries, ChainError> {
        self.chain.persistence().utxo_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryPersistence;
    use crate::transaction::Transaction;
    use std::sync::Arc;

    fn setup() -> (KeyPair, Blockchain) {
        let keypair = KeyPair::generate();
        let chain =
            Blockchain::init(Arc::new(InMemoryPersistence::new()), &keypair.address(), 4, 100)
                .unwrap();
        UtxoSet::new(&chain).reindex().unwrap();
        (keypair, chain)
    }

    fn send(chain: &mut Blockchain, from: &KeyPair, to: &str, amount: u64) -> Block {
        let tx = Transaction::new_transfer(from, to, amount, &UtxoSet::new(chain)).unwrap();
        let block = chain.mine_block(vec![tx]).unwrap();
        UtxoSet::new(chain).update(&block).unwrap();
        block
    }

    #[test]
    fn test_reindex_genesis() {
        let (keypair, chain) = setup();
        let utxo = UtxoSet::new(&chain);
        assert_eq!(utxo.count_transactions().unwrap(), 1);
        assert_eq!(utxo.balance(&keypair.pub_key_hash()).unwrap(), 100);
        assert_eq!(utxo.balance(&[0u8; 20]).unwrap(), 0);
    }

    #[test]
    fn test_update_matches_reindex() {
        let (alice, mut chain) = setup();
        let bob = KeyPair::generate();

        send(&mut chain, &alice, &bob.address(), 30);
        send(&mut chain, &bob, &alice.address(), 10);
        send(&mut chain, &alice, &bob.address(), 80);

        let incremental = UtxoSet::new(&chain).snapshot().unwrap();
        UtxoSet::new(&chain).reindex().unwrap();
        let rebuilt = UtxoSet::new(&chain).snapshot().unwrap();
        assert_eq!(incremental, rebuilt);

        let utxo = UtxoSet::new(&chain);
        assert_eq!(utxo.balance(&alice.pub_key_hash()).unwrap(), 0);
        assert_eq!(utxo.balance(&bob.pub_key_hash()).unwrap(), 100);
    }

    #[test]
    fn test_spendable_outputs_stop_at_amount() {
        let (alice, mut chain) = setup();
        for _ in 0..3 {
            let reward = Transaction::coinbase(&alice.address(), None, 100).unwrap();
            let block = chain.mine_block(vec![reward]).unwrap();
            UtxoSet::new(&chain).update(&block).unwrap();
        }

        let utxo = UtxoSet::new(&chain);
        let (accumulated, spendable) = utxo.find_spendable_outputs(&alice.pub_key_hash(), 150).unwrap();
        assert_eq!(accumulated, 200);
        assert_eq!(spendable.values().map(Vec::len).sum::<usize>(), 2);

        let (all, _) = utxo.find_spendable_outputs(&alice.pub_key_hash(), 10_000).unwrap();
        assert_eq!(all, 400);
    }

    #[test]
    fn test_insufficient_funds() {
        let (alice, chain) = setup();
        let bob = KeyPair::generate();
        let result = Transaction::new_transfer(&alice, &bob.address(), 101, &UtxoSet::new(&chain));
        assert!(matches!(
            result,
            Err(ChainError::InsufficientFunds {
                needed: 101,
                available: 100
            })
        ));
    }

    #[test]
    fn test_spend_within_same_block() {
        let (alice, chain) = setup();
        let bob = KeyPair::generate();

        // Build a block by hand where the second transaction spends the first.
        let first = Transaction::new_transfer(&alice, &bob.address(), 40, &UtxoSet::new(&chain)).unwrap();
        let mut second = Transaction {
            id: Vec::new(),
            inputs: vec![crate::transaction::TxInput {
                txid: first.id.clone(),
                vout: 0,
                signature: Vec::new(),
                pub_key: bob.public_key_bytes(),
            }],
            outputs: vec![TxOutput::new(40, &alice.address()).unwrap()],
        };
        second.id = second.hash();

        let block = Block::candidate(vec![first.clone(), second.clone()], Some(chain.tip()), 1, 4);

        let mut incremental = UtxoSet::new(&chain).snapshot().unwrap();
        apply_block(&mut incremental, &block);
        let rebuilt = collect_unspent(
            vec![Ok(block.clone()), Ok(chain.last_block().unwrap())].into_iter(),
        )
        .unwrap();

        assert_eq!(incremental, rebuilt);
        assert!(!incremental.contains_key(&first.id) || incremental[&first.id].iter().all(|u| u.index != 0));
        assert!(incremental.contains_key(&second.id));
    }
}
