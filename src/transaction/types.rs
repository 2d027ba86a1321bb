/// Transaction types for Coinpit
use crate::blockchain::UtxoSet;
use crate::crypto::{pub_key_hash_from_address, KeyPair, PubKeyHash};
use crate::error::ChainError;
use crate::games::GameOutcome;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Random bytes in a coinbase's default data field.
pub const COINBASE_DATA_BYTES: usize = 24;

/// A spendable amount locked to a public-key hash.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
}

impl TxOutput {
    /// Lock `value` to the holder of `address`.
    pub fn new(value: u64, address: &str) -> Result<Self, ChainError> {
        Ok(TxOutput {
            value,
            pub_key_hash: pub_key_hash_from_address(address)?,
        })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &PubKeyHash) -> bool {
        &self.pub_key_hash == pub_key_hash
    }
}

/// A reference to a previous output plus the proof that unlocks it.
///
/// For a coinbase `txid` is empty, `vout` is -1 and `pub_key` carries
/// arbitrary data.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxInput {
    pub txid: Vec<u8>,
    pub vout: i64,
    pub signature: Vec<u8>,
    pub pub_key: Vec<u8>,
}

impl TxInput {
    pub fn uses_key(&self, pub_key_hash: &PubKeyHash) -> bool {
        &crate::crypto::hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// A signed game transaction together with how the round went.
#[derive(Debug, Clone)]
pub struct GameTransaction {
    pub transaction: Transaction,
    pub outcome: GameOutcome,
    pub change: u64,
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

impl Transaction {
    /// Feed the canonical encoding into `hasher`, using `id` in place of the stored id.
    fn encode_with_id(&self, hasher: &mut Sha256, id: &[u8]) {
        write_bytes(hasher, id);
        hasher.update((self.inputs.len() as u64).to_be_bytes());
        for input in &self.inputs {
            write_bytes(hasher, &input.txid);
            hasher.update(input.vout.to_be_bytes());
            write_bytes(hasher, &input.signature);
            write_bytes(hasher, &input.pub_key);
        }
        hasher.update((self.outputs.len() as u64).to_be_bytes());
        for output in &self.outputs {
            hasher.update(output.value.to_be_bytes());
            write_bytes(hasher, &output.pub_key_hash);
        }
    }

    /// Canonical encoding of the whole transaction, id included.
    pub fn write_canonical(&self, hasher: &mut Sha256) {
        self.encode_with_id(hasher, &self.id);
    }

    /// SHA-256 of the canonical encoding with the id field empty.
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        self.encode_with_id(&mut hasher, &[]);
        hasher.finalize().to_vec()
    }

    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].txid.is_empty() && self.inputs[0].vout == -1
    }

    /// Coinbase minting `reward` to `to`. Without `data`, 24 random bytes are used.
    pub fn coinbase(to: &str, data: Option<&str>, reward: u64) -> Result<Self, ChainError> {
        let pub_key_hash = pub_key_hash_from_address(to)?;
        Ok(Self::coinbase_to_hash(pub_key_hash, data, reward))
    }

    pub fn coinbase_to_hash(pub_key_hash: PubKeyHash, data: Option<&str>, reward: u64) -> Self {
        let data = match data {
            Some(data) => data.as_bytes().to_vec(),
            None => {
                let mut random = [0u8; COINBASE_DATA_BYTES];
                rand::thread_rng().fill_bytes(&mut random);
                hex::encode(random).into_bytes()
            }
        };

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                txid: Vec::new(),
                vout: -1,
                signature: Vec::new(),
                pub_key: data,
            }],
            outputs: vec![TxOutput {
                value: reward,
                pub_key_hash,
            }],
        };
        tx.id = tx.hash();
        tx
    }

    /// Spend `amount` from `keypair`'s outputs, producing the inputs and the
    /// accumulated total.
    fn select_inputs(
        keypair: &KeyPair,
        amount: u64,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<(Vec<TxInput>, u64), ChainError> {
        if amount == 0 {
            return Err(ChainError::Validation("Amount must be greater than zero".to_string()));
        }

        let pub_key_hash = keypair.pub_key_hash();
        let (accumulated, spendable) = utxo_set.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(ChainError::InsufficientFunds {
                needed: amount,
                available: accumulated,
            });
        }

        let public_key = keypair.public_key_bytes();
        let inputs = spendable
            .into_iter()
            .flat_map(|(txid, indices)| {
                let public_key = public_key.clone();
                indices.into_iter().map(move |index| TxInput {
                    txid: txid.clone(),
                    vout: i64::from(index),
                    signature: Vec::new(),
                    pub_key: public_key.clone(),
                })
            })
            .collect();

        Ok((inputs, accumulated))
    }

    fn finish(
        keypair: &KeyPair,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<Self, ChainError> {
        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.id = tx.hash();
        utxo_set.chain().sign_transaction(&mut tx, keypair)?;
        Ok(tx)
    }

    /// Transfer `amount` to `to`, returning change to the sender.
    pub fn new_transfer(
        keypair: &KeyPair,
        to: &str,
        amount: u64,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<Self, ChainError> {
        let recipient = TxOutput::new(amount, to)?;
        let (inputs, accumulated) = Self::select_inputs(keypair, amount, utxo_set)?;

        let mut outputs = vec![recipient];
        if accumulated > amount {
            outputs.push(TxOutput {
                value: accumulated - amount,
                pub_key_hash: keypair.pub_key_hash(),
            });
        }

        Self::finish(keypair, inputs, outputs, utxo_set)
    }

    /// Stake `bet` on a game. `resolve` decides the round once the bet is
    /// known to be covered; a win pays back to the sender, a loss burns the bet.
    pub fn new_game<F>(
        keypair: &KeyPair,
        bet: u64,
        utxo_set: &UtxoSet<'_>,
        resolve: F,
    ) -> Result<GameTransaction, ChainError>
    where
        F: FnOnce(u64) -> GameOutcome,
    {
        let (inputs, accumulated) = Self::select_inputs(keypair, bet, utxo_set)?;
        let outcome = resolve(bet);
        let sender = keypair.pub_key_hash();

        let mut outputs = Vec::with_capacity(2);
        if outcome.payout > 0 {
            outputs.push(TxOutput {
                value: outcome.payout,
                pub_key_hash: sender,
            });
        }
        let change = accumulated - bet;
        if change > 0 {
            outputs.push(TxOutput {
                value: change,
                pub_key_hash: sender,
            });
        }

        let transaction = Self::finish(keypair, inputs, outputs, utxo_set)?;
        Ok(GameTransaction {
            transaction,
            outcome,
            change,
        })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id_hex())?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.txid))?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(output.pub_key_hash))?;
        }
        Ok(())
    }
}
