use crate::blockchain::core::chain::{Block, Blockchain};
use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashMap;

/// No output may be spent twice within one batch of transactions.
pub fn validate_no_double_spend(transactions: &[Transaction]) -> Result<(), ChainError> {
    let mut seen_inputs: HashMap<(&[u8], i64), &[u8]> = HashMap::new();
    for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.inputs {
            let key = (input.txid.as_slice(), input.vout);
            if let Some(conflicting) = seen_inputs.insert(key, tx.id.as_slice()) {
                return Err(ChainError::Validation(format!(
                    "Double spend detected. Output {}:{} is spent by both {} and {}",
                    hex::encode(&input.txid),
                    input.vout,
                    hex::encode(conflicting),
                    tx.id_hex()
                )));
            }
        }
    }
    Ok(())
}

/// Checks a candidate block's transactions against the chain: ids must match
/// contents and every non-coinbase input must carry a valid signature.
pub fn validate_block_transactions(
    chain: &Blockchain,
    transactions: &[Transaction],
) -> Result<(), ChainError> {
    if transactions.is_empty() {
        return Err(ChainError::Validation(
            "A block must contain at least one transaction".to_string(),
        ));
    }

    validate_no_double_spend(transactions)?;

    for tx in transactions {
        if tx.id != tx.hash() {
            return Err(ChainError::Validation(format!(
                "Transaction id {} does not match its contents",
                tx.id_hex()
            )));
        }
        if !chain.verify_transaction(tx)? {
            return Err(ChainError::SignatureVerification(format!(
                "Invalid transaction {}",
                tx.id_hex()
            )));
        }
        validate_against_ledger(chain, tx)?;
    }
    Ok(())
}

/// A spend must be new to the chain and consume only outputs the UTXO
/// index still holds.
fn validate_against_ledger(chain: &Blockchain, tx: &Transaction) -> Result<(), ChainError> {
    if tx.is_coinbase() {
        return Ok(());
    }

    match chain.find_transaction(&tx.id) {
        Ok(_) => {
            return Err(ChainError::Validation(format!(
                "Transaction {} is already on the chain",
                tx.id_hex()
            )))
        }
        Err(ChainError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let store = chain.persistence();
    for input in &tx.inputs {
        let unspent = store.utxo_get(&input.txid)?.unwrap_or_default();
        if !unspent.iter().any(|u| i64::from(u.index) == input.vout) {
            return Err(ChainError::Validation(format!(
                "Output {}:{} is already spent",
                hex::encode(&input.txid),
                input.vout
            )));
        }
    }
    Ok(())
}

/// Walk the whole chain checking proof-of-work, heights and back-links.
/// Returns the number of blocks checked.
pub fn verify_chain(chain: &Blockchain) -> Result<u64, ChainError> {
    let mut checked = 0u64;
    let mut child: Option<Block> = None;

    for block in chain.iter() {
        let block = block?;
        if !block.validate_pow() {
            return Err(ChainError::Validation(format!(
                "Block {} at height {} fails proof-of-work",
                block.hash_hex(),
                block.height
            )));
        }
        if let Some(child) = &child {
            if child.height != block.height + 1 {
                return Err(ChainError::Validation(format!(
                    "Height gap between {} and {}",
                    block.height, child.height
                )));
            }
        }
        if block.is_genesis() && block.height != 0 {
            return Err(ChainError::Validation(format!(
                "Block {} has no parent but height {}",
                block.hash_hex(),
                block.height
            )));
        }
        checked += 1;
        child = Some(block);
    }
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::state::UtxoSet;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryPersistence;
    use crate::transaction::TxInput;
    use std::sync::Arc;

    fn chain_for(keypair: &KeyPair) -> Blockchain {
        Blockchain::init(Arc::new(InMemoryPersistence::new()), &keypair.address(), 4, 100).unwrap()
    }

    #[test]
    fn test_double_spend_in_batch() {
        let spend = |tag: u8| {
            let mut tx = Transaction {
                id: Vec::new(),
                inputs: vec![TxInput {
                    txid: vec![1; 32],
                    vout: 0,
                    signature: vec![tag],
                    pub_key: Vec::new(),
                }],
                outputs: Vec::new(),
            };
            tx.id = tx.hash();
            tx
        };
        let result = validate_no_double_spend(&[spend(1), spend(2)]);
        assert!(matches!(result, Err(ChainError::Validation(_))));
        assert!(validate_no_double_spend(&[spend(1)]).is_ok());
    }

    #[test]
    fn test_forged_signature_rejected() {
        let keypair = KeyPair::generate();
        let mut chain = chain_for(&keypair);
        let genesis_tx = chain.last_block().unwrap().transactions[0].clone();

        let mut forged = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                txid: genesis_tx.id.clone(),
                vout: 0,
                signature: vec![7u8; 64],
                pub_key: keypair.public_key_bytes(),
            }],
            outputs: genesis_tx.outputs.clone(),
        };
        forged.id = forged.hash();

        let tip = chain.tip();
        let result = chain.mine_block(vec![forged]);
        assert!(matches!(result, Err(ChainError::SignatureVerification(_))));
        assert_eq!(chain.tip(), tip);
    }

    #[test]
    fn test_replayed_spend_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut chain = chain_for(&alice);
        UtxoSet::new(&chain).reindex().unwrap();

        let commit = |chain: &mut Blockchain, tx: Transaction| {
            let block = chain.mine_block(vec![tx])?;
            UtxoSet::new(chain).update(&block)?;
            Ok::<_, ChainError>(block)
        };

        let payment = Transaction::new_transfer(&alice, &bob.address(), 30, &UtxoSet::new(&chain)).unwrap();
        commit(&mut chain, payment.clone()).unwrap();
        let onward = Transaction::new_transfer(&bob, &alice.address(), 30, &UtxoSet::new(&chain)).unwrap();
        commit(&mut chain, onward).unwrap();

        let tip = chain.tip();
        let replay = commit(&mut chain, payment);
        assert!(matches!(replay, Err(ChainError::Validation(_))));
        assert_eq!(chain.tip(), tip);

        let incremental = UtxoSet::new(&chain).snapshot().unwrap();
        UtxoSet::new(&chain).reindex().unwrap();
        assert_eq!(UtxoSet::new(&chain).snapshot().unwrap(), incremental);
        assert_eq!(UtxoSet::new(&chain).balance(&bob.pub_key_hash()).unwrap(), 0);
        assert_eq!(UtxoSet::new(&chain).balance(&alice.pub_key_hash()).unwrap(), 100);
    }

    #[test]
    fn test_spent_output_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut chain = chain_for(&alice);
        UtxoSet::new(&chain).reindex().unwrap();

        let first = Transaction::new_transfer(&alice, &bob.address(), 10, &UtxoSet::new(&chain)).unwrap();
        let second = Transaction::new_transfer(&alice, &bob.address(), 20, &UtxoSet::new(&chain)).unwrap();
        let block = chain.mine_block(vec![first]).unwrap();
        UtxoSet::new(&chain).update(&block).unwrap();

        // Same genesis output, different block.
        let result = chain.mine_block(vec![second]);
        assert!(matches!(result, Err(ChainError::Validation(_))));
    }

    #[test]
    fn test_mismatched_id_rejected() {
        let keypair = KeyPair::generate();
        let chain = chain_for(&keypair);
        let mut tx = Transaction::coinbase(&keypair.address(), None, 100).unwrap();
        tx.id = vec![0u8; 32];
        assert!(matches!(
            validate_block_transactions(&chain, &[tx]),
            Err(ChainError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_block_rejected() {
        let keypair = KeyPair::generate();
        let chain = chain_for(&keypair);
        assert!(validate_block_transactions(&chain, &[]).is_err());
    }

    #[test]
    fn test_verify_chain() {
        let keypair = KeyPair::generate();
        let mut chain = chain_for(&keypair);
        for _ in 0..3 {
            let tx = Transaction::coinbase(&keypair.address(), None, 100).unwrap();
            chain.mine_block(vec![tx]).unwrap();
        }
        assert_eq!(verify_chain(&chain).unwrap(), 4);
    }
}
