//! Deposit and slash-split arithmetic
//!
//! Integer only. Division floors, every multiplication is checked.

use crate::types::TokenAmount;
use crate::{Error, Result};

/// Bond required for a message quota: `message_limit * minimal_deposit`
pub fn deposit(message_limit: u64, minimal_deposit: TokenAmount) -> Result<TokenAmount> {
    TokenAmount::from(message_limit)
        .checked_mul(minimal_deposit)
        .ok_or_else(|| {
            Error::ArithmeticOverflow(format!(
                "deposit {} * {}",
                message_limit, minimal_deposit
            ))
        })
}

/// Split of a slashed bond
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    /// Paid to the configured fee receiver
    pub fee: TokenAmount,
    /// Paid to the slash receiver
    pub remainder: TokenAmount,
}

/// `fee = deposit * fee_percentage / 100`, `remainder = deposit - fee`
pub fn fee_split(deposit: TokenAmount, fee_percentage: u8) -> Result<FeeSplit> {
    if fee_percentage > 100 {
        return Err(Error::Config(format!(
            "fee percentage {} exceeds 100",
            fee_percentage
        )));
    }

    let fee = deposit
        .checked_mul(TokenAmount::from(fee_percentage))
        .ok_or_else(|| Error::ArithmeticOverflow(format!("fee {} * {}%", deposit, fee_percentage)))?
        / 100;

    Ok(FeeSplit {
        fee,
        remainder: deposit - fee,
    })
}
