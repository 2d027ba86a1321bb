// Thin re-export module: implementation lives in `blockchain/core/` split by
// responsibility (chain storage, UTXO index, block validation).

pub mod core;
pub use core::*;
