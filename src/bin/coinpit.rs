#![forbid(unsafe_code)]
//! Command-line client for a Coinpit node

use clap::{Parser, Subcommand};
use colored::*;
use coinpit::blockchain::Block;
use coinpit::config::{load_config, Config};
use coinpit::discovery::PeerDiscovery;
use coinpit::node::{GameResult, Node};
use coinpit::transaction::Transaction;
use coinpit::wallet::Wallets;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Coinpit ledger client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger and pay the genesis reward to ADDRESS
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Generate a new wallet and fund it
    Createwallet,
    /// List the addresses in this node's wallet file
    Listaddresses,
    /// Show the balance of ADDRESS
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// Send AMOUNT from a local wallet to TO
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    /// Bet on a coin flip
    Coinflip {
        #[arg(long)]
        from: String,
        #[arg(long)]
        amount: u64,
    },
    /// Bet on a die roll
    Diceroll {
        #[arg(long)]
        from: String,
        #[arg(long)]
        amount: u64,
    },
    /// Guess a number in 1..=100
    Numberrange {
        #[arg(long)]
        from: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        guess: u8,
    },
    /// Print every block, newest first
    Printchain,
    /// Rebuild the UTXO index from the ledger
    Reindexutxo,
    /// Mine a block from a JSON array of transactions
    Mine {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show or update known seed nodes
    Peers {
        /// Register a seed node (host:port)
        #[arg(long)]
        add: Option<String>,
        /// Re-check the health of every known node
        #[arg(long)]
        refresh: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    match command {
        Commands::Createblockchain { address } => {
            let node = Node::create_ledger(config, &address)?;
            println!("{}", "✅ Ledger created".green().bold());
            println!("   Genesis reward paid to {}", address.bright_yellow());
            println!("   Height: {}", node.height()?);
        }
        Commands::Createwallet => {
            let node = Node::open(config)?;
            let address = node.create_wallet()?;
            println!("{}", "🔑 New wallet".bright_cyan().bold());
            println!("   Address: {}", address.bright_yellow());
            println!("   Balance: {}", node.balance(&address)?);
        }
        Commands::Listaddresses => {
            let wallets = Wallets::load_or_default(&config.wallets_path())?;
            let addresses = wallets.addresses();
            if addresses.is_empty() {
                println!("{}", "No wallets yet. Run `createwallet`.".yellow());
            }
            for address in addresses {
                println!("{}", address);
            }
        }
        Commands::Getbalance { address } => {
            let node = Node::open(config)?;
            let balance = node.balance(&address)?;
            println!("Balance of '{}': {}", address.bright_yellow(), balance.to_string().bright_green());
        }
        Commands::Send { from, to, amount } => {
            let node = Node::open(config)?;
            let block = node.send(&from, &to, amount)?;
            println!("{}", "✅ Success!".green().bold());
            println!("   {} -> {}: {}", from, to, amount);
            println!("   Block: {}", block.hash_hex().bright_blue());
        }
        Commands::Coinflip { from, amount } => {
            let node = Node::open(config)?;
            print_game(&node.coinflip(&from, amount)?);
        }
        Commands::Diceroll { from, amount } => {
            let node = Node::open(config)?;
            print_game(&node.dice_roll(&from, amount)?);
        }
        Commands::Numberrange { from, amount, guess } => {
            let node = Node::open(config)?;
            print_game(&node.number_range(&from, amount, guess)?);
        }
        Commands::Printchain => {
            let node = Node::open(config)?;
            let blocks = node.with_chain(|chain| chain.iter().collect::<Result<Vec<_>, _>>())?;
            for block in &blocks {
                print_block(block);
            }
        }
        Commands::Reindexutxo => {
            let node = Node::open(config)?;
            let count = node.reindex()?;
            println!(
                "{} There are {} transactions in the UTXO set.",
                "Done!".green().bold(),
                count
            );
        }
        Commands::Mine { file } => {
            let node = Node::open(config)?;
            let transactions: Vec<Transaction> = serde_json::from_str(&fs::read_to_string(&file)?)?;
            let count = transactions.len();
            let block = node.mine_transactions(transactions)?;
            println!("{}", "⛏️  Block mined".green().bold());
            println!("   Height: {}", block.height);
            println!("   Hash: {}", block.hash_hex().bright_blue());
            println!("   Transactions: {}", count);
        }
        Commands::Peers { add, refresh } => peers(&config, add, refresh)?,
    }

    Ok(())
}

fn peers(config: &Config, add: Option<String>, refresh: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut discovery = PeerDiscovery::load(&config.seed_nodes_path())?;

    if let Some(address) = add {
        if discovery.add_seed_node(&address)? {
            println!("Added seed node {}", address.bright_yellow());
        } else {
            println!("{} is already known", address);
        }
    }

    if refresh {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(discovery.update_known_nodes())?;
    }

    for node in discovery.seed_nodes() {
        let status = if node.is_healthy {
            "healthy".green()
        } else {
            "unreachable".red()
        };
        println!(
            "{:<24} {:<12} last seen {}",
            node.address,
            status,
            node.last_seen.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!("Next peer: {}", discovery.random_healthy_node().bright_cyan());
    Ok(())
}

fn print_game(result: &GameResult) {
    let headline = if result.won {
        format!("🎉 {} WIN!", result.game).green().bold()
    } else {
        format!("💸 {} LOSS", result.game).red().bold()
    };
    println!("{}", headline);
    if let Some(number) = result.server_number {
        println!("   Server number: {}", number);
    }
    println!("   Bet: {}", result.bet);
    println!("   Payout: {}", result.payout);
    println!("   Change: {}", result.change);
    println!("   Net: {:+}", result.amount_change());
    println!("   Block: {}", hex::encode(result.block_hash).bright_blue());
}

fn print_block(block: &Block) {
    println!("{}", format!("============ Block {} ============", block.hash_hex()).bright_cyan());
    println!("Height: {}", block.height);
    println!("Prev. block: {}", block.prev_hash_hex());
    println!("Timestamp: {}", block.timestamp);
    println!("Nonce: {}", block.nonce);
    let pow = if block.validate_pow() {
        "true".green()
    } else {
        "false".red()
    };
    println!("PoW: {}", pow);
    for tx in &block.transactions {
        println!("{}", tx);
    }
    println!();
}
