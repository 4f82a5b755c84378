// Stake - Bonded stake accounting shared by self-stake and delegations
// Principle: Stake earns only once it is active, rewards accrue through a cumulative index

use crate::types::{Balance, EpochNumber};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Fixed-point scale of reward indices
pub const REWARD_INDEX_SCALE: u128 = 10u128.pow(36);

/// Activation state of a stake tranche
///
/// Stake added during epoch `e` with an activation delay `d` is
/// `Pending(e + d)` until that epoch begins, then `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakeStatus {
    /// Counts for rewards
    Active,
    /// Becomes active when the given epoch begins
    Pending(EpochNumber),
}

impl StakeStatus {
    /// Status of stake added during `current_epoch` under `delay` epochs of warmup
    pub fn for_delay(current_epoch: EpochNumber, delay: u64) -> Result<Self, StakeError> {
        if delay == 0 {
            return Ok(StakeStatus::Active);
        }
        let activation = current_epoch
            .checked_add(delay)
            .ok_or(StakeError::ArithmeticOverflow)?;
        Ok(StakeStatus::Pending(activation))
    }
}

/// Index value at which stake activated in one epoch started earning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub index: U256,

    /// Stake activated in that epoch that its holders have not folded yet
    pub outstanding: Balance,
}

/// Reward accumulator of one validator
///
/// `current` is the distributed reward per unit of active stake since registration,
/// scaled by `REWARD_INDEX_SCALE`. A holder earns `stake * (current - start) / scale`,
/// floored, where `start` is the index at its last credit or at its activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardIndex {
    pub current: U256,

    /// Start index of every activation epoch some holder still has to fold
    pub activations: BTreeMap<EpochNumber, Activation>,

    /// Rewards spread over active stake so far
    pub distributions: u64,
}

impl RewardIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spreads `amount` over `active_stake`
    pub fn distribute(&mut self, amount: Balance, active_stake: Balance) -> Result<(), StakeError> {
        if active_stake == 0 {
            return Ok(());
        }
        let delta = U256::from(amount)
            .checked_mul(U256::from(REWARD_INDEX_SCALE))
            .ok_or(StakeError::ArithmeticOverflow)?
            / U256::from(active_stake);
        self.current = self
            .current
            .checked_add(delta)
            .ok_or(StakeError::ArithmeticOverflow)?;
        self.distributions = self.distributions.saturating_add(1);
        Ok(())
    }

    /// Records that `amount` bonded for `epoch` earns from the current index on
    pub fn activate(&mut self, epoch: EpochNumber, amount: Balance) {
        let current = self.current;
        let entry = self.activations.entry(epoch).or_insert(Activation {
            index: current,
            outstanding: 0,
        });
        // Bounded by the validator's total stake
        entry.outstanding = entry.outstanding.saturating_add(amount);
    }

    /// Index at which stake activated in `epoch` started earning
    pub fn index_at(&self, epoch: EpochNumber) -> Result<U256, StakeError> {
        self.activations
            .get(&epoch)
            .map(|activation| activation.index)
            .ok_or(StakeError::UnknownActivation(epoch))
    }

    /// Drops `amount` of the stake activated in `epoch` from the outstanding set
    ///
    /// Called when a holder folds the tranche or gives it back. The entry is removed
    /// once nothing is outstanding.
    pub fn settle(&mut self, epoch: EpochNumber, amount: Balance) -> Result<(), StakeError> {
        let Entry::Occupied(mut entry) = self.activations.entry(epoch) else {
            return Err(StakeError::UnknownActivation(epoch));
        };
        let outstanding = entry
            .get()
            .outstanding
            .checked_sub(amount)
            .ok_or(StakeError::UnknownActivation(epoch))?;
        if outstanding == 0 {
            entry.remove();
        } else {
            entry.get_mut().outstanding = outstanding;
        }
        Ok(())
    }
}

/// `floor(a * b / c)` with a 256-bit intermediate
pub fn mul_div(a: Balance, b: Balance, c: Balance) -> Result<Balance, StakeError> {
    if c == 0 {
        return Err(StakeError::ArithmeticOverflow);
    }
    // 128 x 128 bits always fits
    let quotient = U256::from(a) * U256::from(b) / U256::from(c);
    if quotient > U256::from(Balance::MAX) {
        return Err(StakeError::ArithmeticOverflow);
    }
    Ok(quotient.low_u128())
}

/// Floor reward of `stake` between two index values
fn share_between(stake: Balance, from: U256, to: U256) -> Result<Balance, StakeError> {
    if stake == 0 {
        return Ok(0);
    }
    let delta = to.checked_sub(from).ok_or(StakeError::ArithmeticOverflow)?;
    let share = U256::from(stake)
        .checked_mul(delta)
        .ok_or(StakeError::ArithmeticOverflow)?
        / U256::from(REWARD_INDEX_SCALE);
    if share > U256::from(Balance::MAX) {
        return Err(StakeError::ArithmeticOverflow);
    }
    Ok(share.low_u128())
}

/// Reward owed to a position since its last credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardQuote {
    pub share: Balance,
    pub index: U256,
}

/// Bonded stake of one holder towards one validator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePosition {
    /// Stake that counts for rewards
    pub active: Balance,

    /// Warming-up stake, keyed by activation epoch
    pub pending: BTreeMap<EpochNumber, Balance>,

    /// Validator reward index at the last credit
    pub reward_index: U256,

    /// Credited but unpaid reward
    pub accrued_reward: Balance,
}

impl StakePosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active plus pending stake
    pub fn principal(&self) -> Balance {
        // add() keeps the total representable
        self.pending
            .values()
            .fold(self.active, |acc, amount| acc.saturating_add(*amount))
    }

    /// Pending stake only
    pub fn pending_total(&self) -> Balance {
        self.pending
            .values()
            .fold(0, |acc: Balance, amount| acc.saturating_add(*amount))
    }

    /// Bonds `amount` with the given activation status
    ///
    /// Active stake must only be added right after a credit, so that it earns from
    /// the current index.
    pub fn add(&mut self, amount: Balance, status: StakeStatus) -> Result<(), StakeError> {
        self.principal()
            .checked_add(amount)
            .ok_or(StakeError::ArithmeticOverflow)?;

        match status {
            StakeStatus::Active => self.active += amount,
            StakeStatus::Pending(epoch) => {
                let entry = self.pending.entry(epoch).or_insert(0);
                *entry += amount;
            }
        }
        Ok(())
    }

    /// Folds every tranche whose activation epoch has begun into the active stake
    ///
    /// Returns the folded tranches. Only valid right after a credit.
    pub fn activate_through(&mut self, epoch: EpochNumber) -> Vec<(EpochNumber, Balance)> {
        let still_pending = self.pending.split_off(&(epoch.saturating_add(1)));
        let activated = std::mem::replace(&mut self.pending, still_pending);
        for amount in activated.values() {
            self.active = self.active.saturating_add(*amount);
        }
        activated.into_iter().collect()
    }

    /// Removes `amount` of stake, active first then oldest pending
    ///
    /// Returns the removed tranches so the aggregate can be adjusted the same way.
    pub fn release(&mut self, amount: Balance) -> Result<Vec<(Balance, StakeStatus)>, StakeError> {
        let available = self.principal();
        if available < amount {
            return Err(StakeError::InsufficientPrincipal {
                available,
                required: amount,
            });
        }

        let mut tranches = Vec::new();
        let mut remaining = amount;

        let from_active = remaining.min(self.active);
        if from_active > 0 {
            self.active -= from_active;
            remaining -= from_active;
            tranches.push((from_active, StakeStatus::Active));
        }

        while remaining > 0 {
            let Some(mut entry) = self.pending.first_entry() else {
                break;
            };
            let epoch = *entry.key();
            let taken = remaining.min(*entry.get());
            *entry.get_mut() -= taken;
            if *entry.get() == 0 {
                entry.remove();
            }
            remaining -= taken;
            tranches.push((taken, StakeStatus::Pending(epoch)));
        }

        Ok(tranches)
    }

    /// Computes what the position earned since its last credit
    ///
    /// Tranches activated by `epoch` but not folded yet earn from their activation index.
    pub fn quote(&self, rewards: &RewardIndex, epoch: EpochNumber) -> Result<RewardQuote, StakeError> {
        let mut share = share_between(self.active, self.reward_index, rewards.current)?;
        for (activation, amount) in self.pending.range(..=epoch) {
            let start = rewards.index_at(*activation)?;
            let part = share_between(*amount, start, rewards.current)?;
            share = share.checked_add(part).ok_or(StakeError::ArithmeticOverflow)?;
        }
        Ok(RewardQuote {
            share,
            index: rewards.current,
        })
    }

    /// Credits a quote and moves the position to the quoted index
    pub fn credit(&mut self, quote: RewardQuote) -> Result<(), StakeError> {
        self.accrued_reward = self
            .accrued_reward
            .checked_add(quote.share)
            .ok_or(StakeError::ArithmeticOverflow)?;
        self.reward_index = quote.index;
        Ok(())
    }

    /// Takes the whole accrued reward
    pub fn take_accrued(&mut self) -> Balance {
        std::mem::take(&mut self.accrued_reward)
    }
}

/// Stake accounting errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StakeError {
    #[error("Arithmetic overflow in stake accounting")]
    ArithmeticOverflow,

    #[error("Insufficient principal: available={available}, required={required}")]
    InsufficientPrincipal { available: Balance, required: Balance },

    #[error("No outstanding activation for epoch {0}")]
    UnknownActivation(EpochNumber),
}
