// Delegation - Per-delegator accounting for the delegators of one validator
// Principle: Positions are never deleted, an emptied position is simply inert

use super::stake::{StakeError, StakePosition};
use super::staking::{RegistryError, StakeRegistry};
use crate::types::{Address, Balance, EpochNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Ledger binding and policy, fixed by `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Validator receiving the delegated stake
    pub validator: Address,

    /// Address of the registry holding the aggregate (back-reference only)
    pub registry: Address,

    /// Epochs between an unstake request and the withdrawal
    /// Must not exceed the registry's global cooldown
    pub cooldown_epochs: u64,

    /// Smallest accepted delegation
    pub min_stake: Balance,
}

/// Outstanding unstake request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUnstake {
    pub amount: Balance,
    pub requested_epoch: EpochNumber,
    pub maturity_epoch: EpochNumber,
}

/// Last reward payout of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardWithdrawal {
    pub amount: Balance,
    pub epoch: EpochNumber,
}

/// Lifecycle of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    /// Never staked
    Idle,
    /// Holds principal
    Staked,
    /// Waiting for the cooldown to elapse
    UnstakeRequested,
    /// Fully withdrawn, kept for auditability
    Withdrawn,
}

/// One delegator's position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPosition {
    pub delegator: Address,
    pub validator: Address,
    pub stake: StakePosition,
    pub pending_unstake: Option<PendingUnstake>,

    /// Rewards paid out over the position's lifetime
    pub total_claimed: Balance,

    /// Principal returned over the position's lifetime
    pub total_withdrawn: Balance,

    pub last_reward_withdrawal: Option<RewardWithdrawal>,
}

impl DelegationPosition {
    fn new(delegator: Address, validator: Address) -> Self {
        Self {
            delegator,
            validator,
            stake: StakePosition::new(),
            pending_unstake: None,
            total_claimed: 0,
            total_withdrawn: 0,
            last_reward_withdrawal: None,
        }
    }

    pub fn principal(&self) -> Balance {
        self.stake.principal()
    }

    pub fn state(&self) -> PositionState {
        if self.pending_unstake.is_some() {
            PositionState::UnstakeRequested
        } else if self.principal() > 0 {
            PositionState::Staked
        } else if self.total_withdrawn > 0 {
            PositionState::Withdrawn
        } else {
            PositionState::Idle
        }
    }
}

/// Delegation ledger bound to one validator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationLedger {
    config: Option<LedgerConfig>,
    positions: BTreeMap<Address, DelegationPosition>,
}

impl DelegationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the ledger to its validator, once
    pub fn init(
        &mut self,
        config: LedgerConfig,
        registry: &dyn StakeRegistry,
    ) -> Result<(), DelegationError> {
        if self.config.is_some() {
            return Err(DelegationError::AlreadyInitialized);
        }
        let global_cooldown = registry.cooldown_epochs()?;
        if config.cooldown_epochs > global_cooldown {
            return Err(DelegationError::InvalidConfig(format!(
                "cooldown {} exceeds registry cooldown {}",
                config.cooldown_epochs, global_cooldown
            )));
        }
        let min_delegation = registry.min_delegation()?;
        if config.min_stake < min_delegation {
            return Err(DelegationError::InvalidConfig(format!(
                "min stake {} below registry minimum delegation {}",
                config.min_stake, min_delegation
            )));
        }

        info!(
            validator = %config.validator,
            cooldown_epochs = config.cooldown_epochs,
            min_stake = %config.min_stake,
            "Delegation ledger initialized"
        );
        self.config = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Result<&LedgerConfig, DelegationError> {
        self.config.as_ref().ok_or(DelegationError::NotInitialized)
    }

    /// Bonds `amount` from `delegator` to the ledger's validator
    ///
    /// The new stake earns only from its activation epoch on, so a reward queued
    /// earlier in the same epoch cannot be captured by it.
    pub fn delegate_stake(
        &mut self,
        registry: &mut dyn StakeRegistry,
        delegator: Address,
        amount: Balance,
    ) -> Result<(), DelegationError> {
        let config = self.config()?;
        if amount < config.min_stake {
            return Err(DelegationError::BelowMinimum {
                minimum: config.min_stake,
                provided: amount,
            });
        }
        let validator = config.validator;

        let mut position = self
            .positions
            .get(&delegator)
            .cloned()
            .unwrap_or_else(|| DelegationPosition::new(delegator, validator));

        // Fail before any cross-call rather than after it
        let principal = position
            .principal()
            .checked_add(amount)
            .ok_or(DelegationError::ArithmeticOverflow)?;

        Self::accrue(registry, &mut position)?;
        let status = registry.bond(&validator, amount)?;
        position.stake.add(amount, status)?;
        self.positions.insert(delegator, position);

        info!(
            delegator = %delegator,
            validator = %validator,
            amount = %amount,
            principal = %principal,
            status = ?status,
            "Stake delegated"
        );
        Ok(())
    }

    /// Requests the whole principal back after the cooldown
    pub fn request_unstake_delegated_stakes(
        &mut self,
        registry: &dyn StakeRegistry,
        delegator: Address,
    ) -> Result<PendingUnstake, DelegationError> {
        let cooldown = self.config()?.cooldown_epochs;
        let position = self
            .positions
            .get_mut(&delegator)
            .ok_or(DelegationError::NothingStaked)?;

        if let Some(pending) = position.pending_unstake {
            return Err(DelegationError::UnstakeAlreadyRequested {
                maturity_epoch: pending.maturity_epoch,
            });
        }
        let principal = position.principal();
        if principal == 0 {
            return Err(DelegationError::NothingStaked);
        }

        let epoch = registry.current_epoch();
        let request = PendingUnstake {
            amount: principal,
            requested_epoch: epoch,
            maturity_epoch: epoch
                .checked_add(cooldown)
                .ok_or(DelegationError::ArithmeticOverflow)?,
        };
        position.pending_unstake = Some(request);

        info!(
            delegator = %delegator,
            amount = %principal,
            maturity_epoch = request.maturity_epoch,
            "Unstake requested"
        );
        Ok(request)
    }

    /// Releases a matured unstake request and returns the amount to transfer
    pub fn withdraw(
        &mut self,
        registry: &mut dyn StakeRegistry,
        delegator: Address,
    ) -> Result<Balance, DelegationError> {
        let validator = self.config()?.validator;
        let current = self
            .positions
            .get(&delegator)
            .ok_or(DelegationError::NothingStaked)?;
        let request = current.pending_unstake.ok_or(DelegationError::NothingStaked)?;

        let epoch = registry.current_epoch();
        if epoch < request.maturity_epoch {
            return Err(DelegationError::NotMatured {
                current: epoch,
                maturity: request.maturity_epoch,
            });
        }

        let mut position = current.clone();
        Self::accrue(registry, &mut position)?;
        let tranches = position.stake.release(request.amount)?;
        for (amount, status) in tranches {
            registry.unbond(&validator, amount, status)?;
        }
        position.total_withdrawn = position
            .total_withdrawn
            .checked_add(request.amount)
            .ok_or(DelegationError::ArithmeticOverflow)?;
        position.pending_unstake = None;
        let remaining = position.principal();
        self.positions.insert(delegator, position);

        info!(
            delegator = %delegator,
            amount = %request.amount,
            remaining = %remaining,
            "Unstaked principal withdrawn"
        );
        Ok(request.amount)
    }

    /// Pays out everything the position has earned so far
    ///
    /// Rewards are not subject to the cooldown, so this path pays synchronously.
    pub fn request_withdraw_rewards(
        &mut self,
        registry: &mut dyn StakeRegistry,
        delegator: Address,
    ) -> Result<Balance, DelegationError> {
        let validator = self.config()?.validator;
        let mut position = self
            .positions
            .get(&delegator)
            .cloned()
            .ok_or(DelegationError::NothingStaked)?;

        Self::accrue(registry, &mut position)?;
        let amount = position.stake.accrued_reward;
        if amount > 0 {
            position.total_claimed = position
                .total_claimed
                .checked_add(amount)
                .ok_or(DelegationError::ArithmeticOverflow)?;
            registry.pay_reward(&validator, amount)?;
            position.stake.take_accrued();
            position.last_reward_withdrawal = Some(RewardWithdrawal {
                amount,
                epoch: registry.current_epoch(),
            });
        }
        self.positions.insert(delegator, position);

        info!(delegator = %delegator, validator = %validator, amount = %amount, "Rewards withdrawn");
        Ok(amount)
    }

    /// Reward `delegator` could withdraw right now
    pub fn pending_rewards(
        &self,
        registry: &dyn StakeRegistry,
        delegator: &Address,
    ) -> Result<Balance, DelegationError> {
        let validator = self.config()?.validator;
        let Some(position) = self.positions.get(delegator) else {
            return Ok(0);
        };
        let quote = registry.reward_share(&validator, &position.stake)?;
        position
            .stake
            .accrued_reward
            .checked_add(quote.share)
            .ok_or(DelegationError::ArithmeticOverflow)
    }

    /// Credits the position up to the current index, then folds tranches whose epoch has begun
    fn accrue(
        registry: &mut dyn StakeRegistry,
        position: &mut DelegationPosition,
    ) -> Result<(), DelegationError> {
        let quote = registry.reward_share(&position.validator, &position.stake)?;
        position.stake.credit(quote)?;
        let folded = position.stake.activate_through(registry.current_epoch());
        if !folded.is_empty() {
            registry.fold_activations(&position.validator, &folded)?;
        }

        debug!(delegator = %position.delegator, share = %quote.share, "Rewards accrued");
        Ok(())
    }

    pub fn position(&self, delegator: &Address) -> Option<&DelegationPosition> {
        self.positions.get(delegator)
    }

    pub fn positions(&self) -> impl Iterator<Item = &DelegationPosition> {
        self.positions.values()
    }

    /// Sum of every position's principal
    pub fn total_principal(&self) -> Balance {
        self.positions
            .values()
            .fold(0, |acc: Balance, p| acc.saturating_add(p.principal()))
    }

    /// Deterministic snapshot, positions sorted by delegator
    pub fn get_state(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            config: self.config.clone(),
            total_principal: self.total_principal(),
            positions: self
                .positions
                .values()
                .map(|p| PositionSnapshot {
                    delegator: p.delegator,
                    state: p.state(),
                    principal: p.principal(),
                    active: p.stake.active,
                    pending: p.stake.pending_total(),
                    accrued_reward: p.stake.accrued_reward,
                    total_claimed: p.total_claimed,
                    pending_unstake: p.pending_unstake,
                })
                .collect(),
        }
    }
}

/// Ledger snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub config: Option<LedgerConfig>,
    pub total_principal: Balance,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub delegator: Address,
    pub state: PositionState,
    pub principal: Balance,
    pub active: Balance,
    pub pending: Balance,
    pub accrued_reward: Balance,
    pub total_claimed: Balance,
    pub pending_unstake: Option<PendingUnstake>,
}

/// Delegation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    #[error("Delegation ledger already initialized")]
    AlreadyInitialized,

    #[error("Delegation ledger not initialized")]
    NotInitialized,

    #[error("Invalid delegation configuration: {0}")]
    InvalidConfig(String),

    #[error("Delegation below minimum: minimum={minimum}, provided={provided}")]
    BelowMinimum { minimum: Balance, provided: Balance },

    #[error("Nothing staked or no pending unstake request")]
    NothingStaked,

    #[error("Unstake already requested, matures at epoch {maturity_epoch}")]
    UnstakeAlreadyRequested { maturity_epoch: EpochNumber },

    #[error("Unstake not matured: current epoch {current}, maturity epoch {maturity}")]
    NotMatured { current: EpochNumber, maturity: EpochNumber },

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<StakeError> for DelegationError {
    fn from(err: StakeError) -> Self {
        match err {
            StakeError::ArithmeticOverflow => DelegationError::ArithmeticOverflow,
            other => DelegationError::Registry(other.into()),
        }
    }
}
