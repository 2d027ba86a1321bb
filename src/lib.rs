//! Coinpit - a single-chain proof-of-work UTXO ledger with on-chain games
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the ledger, the UTXO index and block validation
//! - [`transaction`] - Transaction types, builders and signing
//! - [`games`] - Coinflip, dice and number-range outcome functions
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work mining
//!
//! ## Cryptography
//! - [`crypto`] - P-256 signatures, public-key hashing and addresses
//!
//! ## State Management
//! - [`wallet`] - Wallet files
//! - [`persistence`] - Storage backends (SQLite, in-memory)
//! - [`node`] - The node service tying ledger, index and wallets together
//!
//! ## Networking & Integration
//! - [`discovery`] - Seed-node health tracking
//! - `api` - HTTP API (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod games;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod node;
pub mod persistence;
pub mod wallet;

// ============================================================================
// Networking
// ============================================================================
pub mod discovery;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
