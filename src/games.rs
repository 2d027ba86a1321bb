//! Game resolvers
//!
//! Each game is a pure outcome function over a bet and a draw, plus a
//! `play_*` wrapper that makes the draw from an RNG. Payouts flow into
//! [`Transaction::new_game`](crate::transaction::Transaction::new_game).

use crate::error::ChainError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const COINFLIP_MULTIPLIER: u64 = 2;
pub const DICE_MULTIPLIER: u64 = 3;
pub const DICE_WINNING_FACE: u8 = 6;
pub const NUMBER_RANGE_MULTIPLIER: u64 = 5;
pub const NUMBER_RANGE_MIN: u8 = 1;
pub const NUMBER_RANGE_MAX: u8 = 100;
/// Half-width of the winning window around a guess.
pub const NUMBER_RANGE_SPREAD: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Coinflip,
    Dice,
    NumberRange,
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameKind::Coinflip => "coinflip",
            GameKind::Dice => "dice",
            GameKind::NumberRange => "numberrange",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameOutcome {
    pub won: bool,
    /// Paid back to the player; zero on a loss.
    pub payout: u64,
    /// The number drawn by the house, for games that draw one.
    pub server_number: Option<u8>,
}

impl GameOutcome {
    fn settle(won: bool, bet: u64, multiplier: u64, server_number: Option<u8>) -> Self {
        GameOutcome {
            won,
            payout: if won { bet.saturating_mul(multiplier) } else { 0 },
            server_number,
        }
    }

    /// Net effect on the player's balance.
    pub fn amount_change(&self, bet: u64) -> i128 {
        self.payout as i128 - bet as i128
    }
}

pub fn coinflip_outcome(bet: u64, won: bool) -> GameOutcome {
    GameOutcome::settle(won, bet, COINFLIP_MULTIPLIER, None)
}

pub fn dice_outcome(bet: u64, roll: u8) -> GameOutcome {
    GameOutcome::settle(roll == DICE_WINNING_FACE, bet, DICE_MULTIPLIER, Some(roll))
}

pub fn validate_guess(guess: u8) -> Result<(), ChainError> {
    if !(NUMBER_RANGE_MIN..=NUMBER_RANGE_MAX).contains(&guess) {
        return Err(ChainError::Validation(format!(
            "Guess must be between {} and {}, got {}",
            NUMBER_RANGE_MIN, NUMBER_RANGE_MAX, guess
        )));
    }
    Ok(())
}

/// Inclusive winning window for `guess`, clamped to the playable range.
pub fn number_range_window(guess: u8) -> (u8, u8) {
    let low = guess.saturating_sub(NUMBER_RANGE_SPREAD).max(NUMBER_RANGE_MIN);
    let high = guess.saturating_add(NUMBER_RANGE_SPREAD).min(NUMBER_RANGE_MAX);
    (low, high)
}

pub fn number_range_outcome(bet: u64, guess: u8, server_number: u8) -> GameOutcome {
    let (low, high) = number_range_window(guess);
    let won = (low..=high).contains(&server_number);
    GameOutcome::settle(won, bet, NUMBER_RANGE_MULTIPLIER, Some(server_number))
}

pub fn play_coinflip<R: Rng + ?Sized>(rng: &mut R, bet: u64) -> GameOutcome {
    coinflip_outcome(bet, rng.gen_bool(0.5))
}

pub fn play_dice<R: Rng + ?Sized>(rng: &mut R, bet: u64) -> GameOutcome {
    dice_outcome(bet, rng.gen_range(1..=6))
}

pub fn play_number_range<R: Rng + ?Sized>(rng: &mut R, bet: u64, guess: u8) -> GameOutcome {
    number_range_outcome(bet, guess, rng.gen_range(NUMBER_RANGE_MIN..=NUMBER_RANGE_MAX))
}
