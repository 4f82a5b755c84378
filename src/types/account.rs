// Account - Minimal balance record kept by the local chain
use super::primitives::Balance;
use serde::{Deserialize, Serialize};

/// Account state on the chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Spendable balance
    pub free: Balance,

    /// Total ever received
    pub received: Balance,

    /// Total ever sent
    pub sent: Balance,
}

impl AccountInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(free: Balance) -> Self {
        Self {
            free,
            received: free,
            sent: 0,
        }
    }

    /// Can this account pay `amount`?
    pub fn can_transfer(&self, amount: Balance) -> bool {
        self.free >= amount
    }

    /// Removes `amount` from the free balance
    pub fn debit(&mut self, amount: Balance) -> Result<(), AccountError> {
        if !self.can_transfer(amount) {
            return Err(AccountError::InsufficientBalance {
                available: self.free,
                required: amount,
            });
        }
        let sent = self.sent.checked_add(amount).ok_or(AccountError::Overflow)?;
        self.free -= amount;
        self.sent = sent;
        Ok(())
    }

    /// Adds `amount` to the free balance
    pub fn credit(&mut self, amount: Balance) -> Result<(), AccountError> {
        let free = self.free.checked_add(amount).ok_or(AccountError::Overflow)?;
        let received = self
            .received
            .checked_add(amount)
            .ok_or(AccountError::Overflow)?;
        self.free = free;
        self.received = received;
        Ok(())
    }
}

/// Account errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient balance: available={available}, required={required}")]
    InsufficientBalance { available: Balance, required: Balance },

    #[error("Balance overflow")]
    Overflow,
}
