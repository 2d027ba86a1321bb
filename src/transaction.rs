//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::PrevTransactions;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::ChainError;

    /// A coinbase paying `value` to `owner`, and an unsigned spend of it.
    fn funded_spend(owner: &KeyPair, recipient: &KeyPair, value: u64) -> (Transaction, PrevTransactions) {
        let funding = Transaction::coinbase(&owner.address(), Some("funding"), value).unwrap();

        let mut spend = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                txid: funding.id.clone(),
                vout: 0,
                signature: Vec::new(),
                pub_key: owner.public_key_bytes(),
            }],
            outputs: vec![
                TxOutput::new(30, &recipient.address()).unwrap(),
                TxOutput::new(value - 30, &owner.address()).unwrap(),
            ],
        };
        spend.id = spend.hash();

        let mut prev = PrevTransactions::new();
        prev.insert(funding.id.clone(), funding);
        (spend, prev)
    }

    #[test]
    fn test_coinbase_shape() {
        let keypair = KeyPair::generate();
        let tx = Transaction::coinbase(&keypair.address(), None, 100).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 100);
        assert!(tx.outputs[0].is_locked_with_key(&keypair.pub_key_hash()));
        assert_eq!(tx.inputs[0].pub_key.len(), COINBASE_DATA_BYTES * 2);
        assert_eq!(tx.id, tx.hash());
    }

    #[test]
    fn test_coinbase_ids_are_unique() {
        let address = KeyPair::generate().address();
        let a = Transaction::coinbase(&address, None, 100).unwrap();
        let b = Transaction::coinbase(&address, None, 100).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_hash_ignores_id() {
        let address = KeyPair::generate().address();
        let mut tx = Transaction::coinbase(&address, Some("fixed"), 100).unwrap();
        let before = tx.hash();
        tx.id = vec![0xAA; 32];
        assert_eq!(tx.hash(), before);
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (mut spend, prev) = funded_spend(&alice, &bob, 100);

        spend.sign(&alice, &prev).unwrap();
        assert_eq!(spend.inputs[0].signature.len(), 64);
        assert!(spend.verify(&prev).unwrap());
    }

    #[test]
    fn test_signing_refreshes_id() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (mut spend, prev) = funded_spend(&alice, &bob, 100);
        let unsigned_id = spend.id.clone();

        spend.sign(&alice, &prev).unwrap();
        assert_ne!(spend.id, unsigned_id);
        assert_eq!(spend.id, spend.hash());
        assert!(spend.verify(&prev).unwrap());
    }

    #[test]
    fn test_tampered_output_fails_verification() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (mut spend, prev) = funded_spend(&alice, &bob, 100);
        spend.sign(&alice, &prev).unwrap();

        spend.outputs[0].value = 99;
        assert!(!spend.verify(&prev).unwrap());
    }

    #[test]
    fn test_foreign_key_cannot_spend() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let (mut spend, prev) = funded_spend(&alice, &mallory, 100);

        spend.inputs[0].pub_key = mallory.public_key_bytes();
        spend.sign(&mallory, &prev).unwrap();
        assert!(!spend.verify(&prev).unwrap());
    }

    #[test]
    fn test_missing_previous_transaction() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (mut spend, _) = funded_spend(&alice, &bob, 100);

        let empty = PrevTransactions::new();
        assert!(matches!(spend.sign(&alice, &empty), Err(ChainError::NotFound(_))));
        assert!(matches!(spend.verify(&empty), Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_coinbase_always_verifies() {
        let tx = Transaction::coinbase(&KeyPair::generate().address(), None, 100).unwrap();
        assert!(tx.verify(&PrevTransactions::new()).unwrap());
    }

    #[test]
    fn test_trimmed_copy_clears_proofs() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (mut spend, prev) = funded_spend(&alice, &bob, 100);
        spend.sign(&alice, &prev).unwrap();

        let trimmed = spend.trimmed_copy();
        assert!(trimmed.inputs[0].signature.is_empty());
        assert!(trimmed.inputs[0].pub_key.is_empty());
        assert_eq!(trimmed.outputs, spend.outputs);
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(matches!(
            Transaction::coinbase("zz", None, 100),
            Err(ChainError::Validation(_))
        ));
    }
}
