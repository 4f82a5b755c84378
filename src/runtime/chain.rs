// Chain - What the staking engine needs from the underlying chain
// Principle: A height counter and value transfers, nothing more

use crate::types::{AccountError, AccountInfo, Address, Balance, BlockNumber};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

/// Execution environment seen by the staking engine
pub trait Chain {
    /// Current block height, monotonically increasing
    fn height(&self) -> BlockNumber;

    /// Spendable balance of `who`
    fn balance(&self, who: &Address) -> Balance;

    /// Moves `amount` from `from` to `to`
    fn transfer(&mut self, from: &Address, to: &Address, amount: Balance) -> Result<(), ChainError>;
}

/// In-memory chain used by the simulator and the tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalChain {
    height: BlockNumber,
    accounts: BTreeMap<Address, AccountInfo>,
}

impl LocalChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the chain at `height`
    pub fn at_height(height: BlockNumber) -> Self {
        Self {
            height,
            accounts: BTreeMap::new(),
        }
    }

    /// Produces `blocks` blocks
    pub fn advance(&mut self, blocks: u64) -> Result<BlockNumber, ChainError> {
        self.height = self
            .height
            .checked_add(blocks)
            .ok_or(ChainError::HeightOverflow)?;
        Ok(self.height)
    }

    /// Produces blocks until `height` is reached
    pub fn advance_to(&mut self, height: BlockNumber) -> Result<BlockNumber, ChainError> {
        if height < self.height {
            return Err(ChainError::HeightRegression {
                current: self.height,
                requested: height,
            });
        }
        self.height = height;
        Ok(self.height)
    }

    /// Creates funds out of thin air (genesis allocations, tests)
    pub fn mint(&mut self, who: Address, amount: Balance) -> Result<(), ChainError> {
        match self.accounts.entry(who) {
            Entry::Vacant(slot) => {
                slot.insert(AccountInfo::with_balance(amount));
            }
            Entry::Occupied(mut slot) => slot
                .get_mut()
                .credit(amount)
                .map_err(|e| ChainError::from_account(who, e))?,
        }
        debug!(account = %who, amount = %amount, "Minted");
        Ok(())
    }

    pub fn account(&self, who: &Address) -> Option<&AccountInfo> {
        self.accounts.get(who)
    }
}

impl Chain for LocalChain {
    fn height(&self) -> BlockNumber {
        self.height
    }

    fn balance(&self, who: &Address) -> Balance {
        self.accounts.get(who).map(|a| a.free).unwrap_or(0)
    }

    fn transfer(&mut self, from: &Address, to: &Address, amount: Balance) -> Result<(), ChainError> {
        if amount == 0 || from == to {
            return Ok(());
        }

        let mut from_account = self.accounts.get(from).cloned().unwrap_or_default();
        let mut to_account = self.accounts.get(to).cloned().unwrap_or_default();

        from_account
            .debit(amount)
            .map_err(|e| ChainError::from_account(*from, e))?;
        to_account
            .credit(amount)
            .map_err(|e| ChainError::from_account(*to, e))?;

        // Both sides validated, write them together
        self.accounts.insert(*from, from_account);
        self.accounts.insert(*to, to_account);

        debug!(from = %from, to = %to, amount = %amount, "Transfer");
        Ok(())
    }
}

/// Chain errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Insufficient balance for {account}: available={available}, required={required}")]
    InsufficientBalance {
        account: Address,
        available: Balance,
        required: Balance,
    },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    #[error("Block height overflow")]
    HeightOverflow,

    #[error("Height cannot go backwards: current={current}, requested={requested}")]
    HeightRegression {
        current: BlockNumber,
        requested: BlockNumber,
    },
}

impl ChainError {
    fn from_account(account: Address, err: AccountError) -> Self {
        match err {
            AccountError::InsufficientBalance { available, required } => {
                ChainError::InsufficientBalance {
                    account,
                    available,
                    required,
                }
            }
            AccountError::Overflow => ChainError::BalanceOverflow(account),
        }
    }
}
