//! The node service: the one entry point the CLI and the HTTP API call into.
//!
//! A `Node` owns the ledger, its UTXO index and the local wallets. Every
//! operation that mines holds the ledger lock from block construction through
//! the index update, so writes from one process are strictly serialized.

use crate::blockchain::{verify_chain, Block, Blockchain, Sha256Hash, UtxoSet};
use crate::config::Config;
use crate::crypto::{pub_key_hash_from_address, validate_address};
use crate::error::ChainError;
use crate::games::{self, GameKind, GameOutcome};
use crate::persistence::{Database, Persistence};
use crate::transaction::Transaction;
use crate::wallet::{Wallet, Wallets};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Data carried by the coinbase that funds a new wallet.
pub const INITIAL_BALANCE_DATA: &str = "Initial balance";

/// How a game round went and where it was recorded.
#[derive(Debug, Clone)]
pub struct GameResult {
    pub transaction: Transaction,
    pub block_hash: Sha256Hash,
    pub won: bool,
    pub bet: u64,
    pub payout: u64,
    pub change: u64,
    pub game: GameKind,
    pub server_number: Option<u8>,
}

impl GameResult {
    /// Net effect on the player's balance.
    pub fn amount_change(&self) -> i128 {
        self.payout as i128 - self.bet as i128
    }
}

pub struct Node {
    config: Config,
    chain: Mutex<Blockchain>,
    wallets: Mutex<Wallets>,
}

impl Node {
    /// Create a new SQLite-backed ledger for this node, paying the genesis
    /// reward to `address`.
    pub fn create_ledger(config: Config, address: &str) -> Result<Self, ChainError> {
        let db = Database::open(&config.ledger_path())?;
        Self::with_persistence(config, Arc::new(db), Some(address))
    }

    /// Open this node's existing ledger.
    pub fn open(config: Config) -> Result<Self, ChainError> {
        let db = Database::open_existing(&config.ledger_path())?;
        Self::with_persistence(config, Arc::new(db), None)
    }

    /// Open the ledger, creating it for `genesis.address` when absent.
    pub fn open_or_create(config: Config) -> Result<Self, ChainError> {
        let db = Database::open(&config.ledger_path())?;
        let genesis = if db.tip()?.is_none() {
            Some(config.genesis.address.clone())
        } else {
            None
        };
        Self::with_persistence(config, Arc::new(db), genesis.as_deref())
    }

    /// Build a node over any backend. With `genesis_address` a fresh ledger is
    /// created and indexed, otherwise an existing one is opened.
    pub fn with_persistence(
        config: Config,
        persistence: Arc<dyn Persistence>,
        genesis_address: Option<&str>,
    ) -> Result<Self, ChainError> {
        config.validate()?;
        let difficulty = config.mining.difficulty;

        let chain = match genesis_address {
            Some(address) => {
                if !validate_address(address) {
                    return Err(ChainError::Validation(format!("Address is not valid: {}", address)));
                }
                let chain = Blockchain::init(persistence, address, difficulty, config.mining.block_reward)?;
                UtxoSet::new(&chain).reindex()?;
                chain
            }
            None => Blockchain::open(persistence, difficulty)?,
        };

        let wallets = Wallets::load_or_default(&config.wallets_path())?;
        info!(node_id = %config.node.node_id, tip = %hex::encode(chain.tip()), "node ready");

        Ok(Node {
            config,
            chain: Mutex::new(chain),
            wallets: Mutex::new(wallets),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mine `transactions` and fold the block into the index, under the
    /// caller's ledger lock.
    fn commit(chain: &mut Blockchain, transactions: Vec<Transaction>) -> Result<Block, ChainError> {
        let block = match chain.mine_block(transactions) {
            Ok(block) => block,
            Err(e @ ChainError::StaleTip { .. }) => {
                warn!(error = %e, "ledger moved underneath this node");
                chain.refresh_tip()?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = UtxoSet::new(chain).update(&block) {
            warn!(height = block.height, error = %e, "UTXO update failed, rebuilding index");
            UtxoSet::new(chain).reindex()?;
        }
        Ok(block)
    }

    /// Generate a wallet, fund it with the configured grant and store it.
    /// The wallet file is only written once the grant is mined.
    pub fn create_wallet(&self) -> Result<String, ChainError> {
        let wallet = Wallet::new(None);
        let address = wallet.address.clone();

        let grant = self.config.wallet.initial_grant;
        if grant > 0 {
            let coinbase = Transaction::coinbase(&address, Some(INITIAL_BALANCE_DATA), grant)?;
            let mut chain = self.chain.lock();
            Self::commit(&mut chain, vec![coinbase])?;
        }

        if let Err(e) = self.wallets.lock().insert(wallet) {
            warn!(%address, grant, error = %e, "funded wallet could not be stored");
            return Err(e);
        }

        info!(%address, grant, "created wallet");
        Ok(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.lock().addresses()
    }

    pub fn balance(&self, address: &str) -> Result<u64, ChainError> {
        let pub_key_hash = pub_key_hash_from_address(address)?;
        let chain = self.chain.lock();
        UtxoSet::new(&chain).balance(&pub_key_hash)
    }

    fn sender_keypair(&self, from: &str) -> Result<crate::crypto::KeyPair, ChainError> {
        if !validate_address(from) {
            return Err(ChainError::Validation(format!("Sender address is not valid: {}", from)));
        }
        self.wallets.lock().keypair(from)
    }

    /// Transfer `amount` from a local wallet to `to`.
    pub fn send(&self, from: &str, to: &str, amount: u64) -> Result<Block, ChainError> {
        if !validate_address(to) {
            return Err(ChainError::Validation(format!("Recipient address is not valid: {}", to)));
        }
        let keypair = self.sender_keypair(from)?;

        let mut chain = self.chain.lock();
        let tx = Transaction::new_transfer(&keypair, to, amount, &UtxoSet::new(&chain))?;

        let mut transactions = Vec::with_capacity(2);
        if self.config.mining.reward_sender_on_send {
            transactions.push(Transaction::coinbase(from, None, self.config.mining.block_reward)?);
        }
        transactions.push(tx);

        let block = Self::commit(&mut chain, transactions)?;
        info!(%from, %to, amount, height = block.height, "sent");
        Ok(block)
    }

    /// Play one round of `game`; `resolve` maps the bet to an outcome.
    pub fn play<F>(&self, from: &str, bet: u64, game: GameKind, resolve: F) -> Result<GameResult, ChainError>
    where
        F: FnOnce(u64) -> GameOutcome,
    {
        let keypair = self.sender_keypair(from)?;

        let mut chain = self.chain.lock();
        let round = Transaction::new_game(&keypair, bet, &UtxoSet::new(&chain), resolve)?;
        let block = Self::commit(&mut chain, vec![round.transaction.clone()])?;

        info!(
            %from,
            %game,
            bet,
            won = round.outcome.won,
            payout = round.outcome.payout,
            height = block.height,
            "game settled"
        );
        Ok(GameResult {
            transaction: round.transaction,
            block_hash: block.hash,
            won: round.outcome.won,
            bet,
            payout: round.outcome.payout,
            change: round.change,
            game,
            server_number: round.outcome.server_number,
        })
    }

    pub fn coinflip(&self, from: &str, bet: u64) -> Result<GameResult, ChainError> {
        self.play(from, bet, GameKind::Coinflip, |bet| {
            games::play_coinflip(&mut rand::thread_rng(), bet)
        })
    }

    pub fn dice_roll(&self, from: &str, bet: u64) -> Result<GameResult, ChainError> {
        self.play(from, bet, GameKind::Dice, |bet| {
            games::play_dice(&mut rand::thread_rng(), bet)
        })
    }

    pub fn number_range(&self, from: &str, bet: u64, guess: u8) -> Result<GameResult, ChainError> {
        games::validate_guess(guess)?;
        self.play(from, bet, GameKind::NumberRange, |bet| {
            games::play_number_range(&mut rand::thread_rng(), bet, guess)
        })
    }

    /// Mine externally built transactions as they are.
    pub fn mine_transactions(&self, transactions: Vec<Transaction>) -> Result<Block, ChainError> {
        let mut chain = self.chain.lock();
        Self::commit(&mut chain, transactions)
    }

    /// Rebuild the UTXO index; returns the number of indexed transactions.
    pub fn reindex(&self) -> Result<usize, ChainError> {
        let chain = self.chain.lock();
        UtxoSet::new(&chain).reindex()
    }

    pub fn count_transactions(&self) -> Result<usize, ChainError> {
        let chain = self.chain.lock();
        UtxoSet::new(&chain).count_transactions()
    }

    /// Up to `limit` blocks, newest first.
    pub fn blocks(&self, limit: usize) -> Result<Vec<Block>, ChainError> {
        self.chain.lock().blocks(limit)
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        self.chain.lock().height()
    }

    pub fn verify_chain(&self) -> Result<u64, ChainError> {
        verify_chain(&self.chain.lock())
    }

    /// Run `f` against the ledger while holding the lock.
    pub fn with_chain<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> R {
        f(&self.chain.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::{coinflip_outcome, number_range_outcome};
    use crate::persistence::InMemoryPersistence;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.mining.difficulty = 4;
        config
    }

    fn node_with_wallet(dir: &tempfile::TempDir) -> (Node, String) {
        let mut config = test_config(dir);
        config.wallet.initial_grant = 0;
        let mut wallets = Wallets::load_or_default(&config.wallets_path()).unwrap();
        let address = wallets.add_wallet().unwrap();
        config.wallet.initial_grant = 100;

        let node =
            Node::with_persistence(config, Arc::new(InMemoryPersistence::new()), Some(&address))
                .unwrap();
        (node, address)
    }

    #[test]
    fn test_create_wallet_grants_balance() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = node_with_wallet(&dir);

        let address = node.create_wallet().unwrap();
        assert_eq!(node.balance(&address).unwrap(), 100);
        assert!(node.addresses().contains(&address));
        assert_eq!(node.height().unwrap(), 1);
    }

    #[test]
    fn test_failed_grant_leaves_no_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.wallet.initial_grant = 0;
        let alice = Wallets::load_or_default(&config.wallets_path())
            .unwrap()
            .add_wallet()
            .unwrap();
        config.wallet.initial_grant = 100;
        let wallets_path = config.wallets_path();

        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let node = Node::with_persistence(config, store.clone(), Some(&alice)).unwrap();

        // Another writer moves the tip, so the next grant hits a stale tip.
        let mut other = Blockchain::open(store, 4).unwrap();
        other
            .mine_block(vec![Transaction::coinbase(&alice, None, 1).unwrap()])
            .unwrap();

        assert!(matches!(node.create_wallet(), Err(ChainError::StaleTip { .. })));
        assert_eq!(node.addresses(), vec![alice.clone()]);
        assert_eq!(Wallets::load_or_default(&wallets_path).unwrap().addresses(), vec![alice]);

        let address = node.create_wallet().unwrap();
        assert_eq!(node.balance(&address).unwrap(), 100);
        assert_eq!(node.addresses().len(), 2);
    }

    #[test]
    fn test_send_splits_balance() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);
        let bob = node.create_wallet().unwrap();

        node.send(&alice, &bob, 30).unwrap();
        assert_eq!(node.balance(&alice).unwrap(), 70);
        assert_eq!(node.balance(&bob).unwrap(), 130);
    }

    #[test]
    fn test_send_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);
        let stranger = crate::crypto::KeyPair::generate().address();

        assert!(matches!(node.send(&alice, "bogus", 1), Err(ChainError::Validation(_))));
        assert!(matches!(node.send("bogus", &alice, 1), Err(ChainError::Validation(_))));
        assert!(matches!(node.send(&stranger, &alice, 1), Err(ChainError::NotFound(_))));
        assert!(matches!(node.send(&alice, &stranger, 0), Err(ChainError::Validation(_))));
        assert!(matches!(
            node.send(&alice, &stranger, 500),
            Err(ChainError::InsufficientFunds { .. })
        ));
        assert_eq!(node.height().unwrap(), 0);
    }

    #[test]
    fn test_forced_coinflip_win() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);

        let result = node
            .play(&alice, 10, GameKind::Coinflip, |bet| coinflip_outcome(bet, true))
            .unwrap();
        assert!(result.won);
        assert_eq!(result.payout, 20);
        assert_eq!(result.change, 90);
        assert_eq!(result.amount_change(), 10);

        let values: Vec<u64> = result.transaction.outputs.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![20, 90]);
        assert_eq!(node.balance(&alice).unwrap(), 110);
    }

    #[test]
    fn test_forced_loss_burns_bet() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);

        let result = node
            .play(&alice, 100, GameKind::Coinflip, |bet| coinflip_outcome(bet, false))
            .unwrap();
        assert!(!result.won);
        assert!(result.transaction.outputs.is_empty());
        assert_eq!(node.balance(&alice).unwrap(), 0);
    }

    #[test]
    fn test_number_range_forced_draw() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);

        let result = node
            .play(&alice, 10, GameKind::NumberRange, |bet| number_range_outcome(bet, 50, 52))
            .unwrap();
        assert!(result.won);
        assert_eq!(result.payout, 50);
        assert_eq!(result.server_number, Some(52));
        assert_eq!(node.balance(&alice).unwrap(), 140);

        assert!(matches!(node.number_range(&alice, 10, 0), Err(ChainError::Validation(_))));
    }

    #[test]
    fn test_random_games_keep_index_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice) = node_with_wallet(&dir);

        node.coinflip(&alice, 5).unwrap();
        node.dice_roll(&alice, 5).unwrap();
        node.number_range(&alice, 5, 50).unwrap();

        let before = node.balance(&alice).unwrap();
        let count = node.count_transactions().unwrap();
        assert_eq!(node.reindex().unwrap(), count);
        assert_eq!(node.balance(&alice).unwrap(), before);
        assert_eq!(node.verify_chain().unwrap(), 4);
    }

    #[test]
    fn test_reward_sender_on_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.mining.reward_sender_on_send = true;
        config.wallet.initial_grant = 0;
        let alice = Wallets::load_or_default(&config.wallets_path())
            .unwrap()
            .add_wallet()
            .unwrap();
        let bob = crate::crypto::KeyPair::generate().address();

        let node =
            Node::with_persistence(config, Arc::new(InMemoryPersistence::new()), Some(&alice)).unwrap();
        let block = node.send(&alice, &bob, 30).unwrap();
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(node.balance(&alice).unwrap(), 170);
        assert_eq!(node.balance(&bob).unwrap(), 30);
    }
}
