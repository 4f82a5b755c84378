// Staking - Validator registry, the single source of truth for stake and rewards
use super::stake::{mul_div, RewardIndex, RewardQuote, StakeError, StakePosition, StakeStatus};
use crate::types::{Address, Balance, EpochNumber, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Global staking policy, fixed by `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Minimum initial stake to register a validator
    pub min_validator_stake: Balance,

    /// Minimum single delegation accepted by delegation ledgers
    pub min_delegation: Balance,

    /// Epochs between an unstake request and the withdrawal
    pub cooldown_epochs: u64,

    /// Epochs before newly bonded stake starts earning
    pub activation_delay_epochs: u64,

    /// Validator commission on every reward (basis points)
    pub commission_bps: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_validator_stake: 10,
            min_delegation: 10,
            cooldown_epochs: 2,
            activation_delay_epochs: 1,
            commission_bps: 0,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if u128::from(self.commission_bps) > BPS_DENOMINATOR {
            return Err(RegistryError::InvalidConfig(format!(
                "commission_bps {} exceeds {}",
                self.commission_bps, BPS_DENOMINATOR
            )));
        }
        Ok(())
    }
}

/// Validator record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: Address,

    pub registered: bool,

    /// Epoch of registration
    pub registered_epoch: EpochNumber,

    /// The validator's own bonded stake
    pub self_stake: StakePosition,

    /// Self stake plus every delegated principal
    pub total_stake: Balance,

    /// Part of `total_stake` that earns rewards this epoch
    pub active_stake: Balance,

    /// Warming-up part of `total_stake`, keyed by activation epoch
    pub pending_stake: BTreeMap<EpochNumber, Balance>,

    /// Rewards received and not yet paid out
    pub reward_pool: Balance,

    /// Part of the pool owed to the validator as commission
    pub commission: Balance,

    /// Rewards received since registration
    pub total_rewarded: Balance,

    /// Cumulative reward per unit of active stake
    pub rewards: RewardIndex,
}

impl ValidatorInfo {
    fn new(address: Address, epoch: EpochNumber) -> Self {
        Self {
            address,
            registered: true,
            registered_epoch: epoch,
            self_stake: StakePosition::new(),
            total_stake: 0,
            active_stake: 0,
            pending_stake: BTreeMap::new(),
            reward_pool: 0,
            commission: 0,
            total_rewarded: 0,
            rewards: RewardIndex::new(),
        }
    }

    pub fn pending_total(&self) -> Balance {
        self.pending_stake
            .values()
            .fold(0, |acc: Balance, amount| acc.saturating_add(*amount))
    }

    /// Adds `amount` to the aggregate under `status`
    fn bond(&mut self, amount: Balance, status: StakeStatus) -> Result<(), RegistryError> {
        let total = self
            .total_stake
            .checked_add(amount)
            .ok_or(RegistryError::ArithmeticOverflow)?;

        match status {
            StakeStatus::Active => {
                self.active_stake = self
                    .active_stake
                    .checked_add(amount)
                    .ok_or(RegistryError::ArithmeticOverflow)?;
            }
            StakeStatus::Pending(epoch) => {
                let pending = self
                    .pending_stake
                    .get(&epoch)
                    .copied()
                    .unwrap_or(0)
                    .checked_add(amount)
                    .ok_or(RegistryError::ArithmeticOverflow)?;
                self.pending_stake.insert(epoch, pending);
            }
        }
        self.total_stake = total;
        Ok(())
    }

    /// Removes `amount` from the aggregate under `status`
    fn unbond(
        &mut self,
        amount: Balance,
        status: StakeStatus,
        current_epoch: EpochNumber,
    ) -> Result<(), RegistryError> {
        let total = self
            .total_stake
            .checked_sub(amount)
            .ok_or(RegistryError::UnbondExceedsStake {
                available: self.total_stake,
                required: amount,
            })?;

        match status {
            StakeStatus::Pending(epoch) if epoch > current_epoch => {
                let available = self.pending_stake.get(&epoch).copied().unwrap_or(0);
                if available < amount {
                    return Err(RegistryError::UnbondExceedsStake {
                        available,
                        required: amount,
                    });
                }
                if available == amount {
                    self.pending_stake.remove(&epoch);
                } else {
                    self.pending_stake.insert(epoch, available - amount);
                }
            }
            _ => {
                let active = self.active_stake.checked_sub(amount).ok_or(
                    RegistryError::UnbondExceedsStake {
                        available: self.active_stake,
                        required: amount,
                    },
                )?;
                // Activated here but never folded by its holder
                if let StakeStatus::Pending(epoch) = status {
                    self.rewards.settle(epoch, amount)?;
                }
                self.active_stake = active;
            }
        }
        self.total_stake = total;
        Ok(())
    }

    /// Credits the self stake up to the current index, then folds activated tranches
    fn accrue_self(&mut self, current_epoch: EpochNumber) -> Result<(), RegistryError> {
        let quote = self.self_stake.quote(&self.rewards, current_epoch)?;
        self.self_stake.credit(quote)?;
        for (epoch, amount) in self.self_stake.activate_through(current_epoch) {
            self.rewards.settle(epoch, amount)?;
        }
        Ok(())
    }
}

/// Narrow cross-call surface used by delegation ledgers
///
/// Ledgers never touch `ValidatorInfo` directly: they adjust aggregate stake and
/// query/pay rewards through this trait only.
pub trait StakeRegistry {
    /// Epoch the registry considers current for activation
    fn current_epoch(&self) -> EpochNumber;

    /// Global cooldown, in epochs
    fn cooldown_epochs(&self) -> Result<u64, RegistryError>;

    /// Smallest delegation any ledger may accept
    fn min_delegation(&self) -> Result<Balance, RegistryError>;

    /// Adds delegated stake to `validator`, returning the activation status assigned to it
    fn bond(&mut self, validator: &Address, amount: Balance) -> Result<StakeStatus, RegistryError>;

    /// Removes delegated stake previously bonded with `status`
    fn unbond(
        &mut self,
        validator: &Address,
        amount: Balance,
        status: StakeStatus,
    ) -> Result<(), RegistryError>;

    /// Reward `position` earned since its last credit
    fn reward_share(
        &self,
        validator: &Address,
        position: &StakePosition,
    ) -> Result<RewardQuote, RegistryError>;

    /// Reports tranches a position folded into its active stake
    fn fold_activations(
        &mut self,
        validator: &Address,
        tranches: &[(EpochNumber, Balance)],
    ) -> Result<(), RegistryError>;

    /// Releases `amount` from the validator's reward pool for payout
    fn pay_reward(&mut self, validator: &Address, amount: Balance) -> Result<(), RegistryError>;
}

/// Validator registry
///
/// # Thread Safety
/// Not internally synchronized. The runtime executes one operation at a time and
/// restores a snapshot when an operation fails, see `runtime::StakingRuntime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    config: Option<RegistryConfig>,

    /// Mirror of the controller epoch, advanced at settlement
    epoch: EpochNumber,

    validators: BTreeMap<Address, ValidatorInfo>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self {
            config: None,
            epoch: 1,
            validators: BTreeMap::new(),
        }
    }

    /// Sets the global policy, once
    pub fn init(&mut self, config: RegistryConfig) -> Result<(), RegistryError> {
        if self.config.is_some() {
            return Err(RegistryError::AlreadyInitialized);
        }
        config.validate()?;

        info!(
            min_validator_stake = %config.min_validator_stake,
            min_delegation = %config.min_delegation,
            cooldown_epochs = config.cooldown_epochs,
            activation_delay_epochs = config.activation_delay_epochs,
            commission_bps = config.commission_bps,
            "Validator registry initialized"
        );
        self.config = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Result<&RegistryConfig, RegistryError> {
        self.config.as_ref().ok_or(RegistryError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// Registers `caller` as a validator with an initial self stake
    pub fn register_validator(
        &mut self,
        caller: Address,
        initial_stake: Balance,
    ) -> Result<(), RegistryError> {
        let config = self.config()?;
        if self.validators.contains_key(&caller) {
            return Err(RegistryError::AlreadyRegistered(caller));
        }
        if initial_stake < config.min_validator_stake {
            return Err(RegistryError::InsufficientStake {
                minimum: config.min_validator_stake,
                provided: initial_stake,
            });
        }
        let status = StakeStatus::for_delay(self.epoch, config.activation_delay_epochs)?;

        let mut validator = ValidatorInfo::new(caller, self.epoch);
        validator.self_stake.add(initial_stake, status)?;
        validator.bond(initial_stake, status)?;
        self.validators.insert(caller, validator);

        info!(validator = %caller, stake = %initial_stake, epoch = self.epoch, "Validator registered");
        Ok(())
    }

    /// Adds self stake for the calling validator
    pub fn stake(&mut self, caller: Address, amount: Balance) -> Result<(), RegistryError> {
        let delay = self.config()?.activation_delay_epochs;
        let epoch = self.epoch;
        let status = StakeStatus::for_delay(epoch, delay)?;

        let current = self
            .validators
            .get(&caller)
            .ok_or(RegistryError::NotRegistered(caller))?;
        let mut validator = current.clone();
        validator.accrue_self(epoch)?;
        validator.self_stake.add(amount, status)?;
        validator.bond(amount, status)?;
        let total = validator.total_stake;
        self.validators.insert(caller, validator);

        debug!(validator = %caller, amount = %amount, total = %total, "Self stake added");
        Ok(())
    }

    /// Credits a reward to `validator`'s pool
    ///
    /// The commission part belongs to the validator; the rest is split pro rata over
    /// the stake active right now. With no active stake the validator keeps it all.
    pub fn reward(&mut self, validator: &Address, amount: Balance) -> Result<(), RegistryError> {
        let commission_bps = u128::from(self.config()?.commission_bps);
        let epoch = self.epoch;
        let record = self
            .validators
            .get_mut(validator)
            .ok_or(RegistryError::UnknownValidator(*validator))?;

        let pool = record
            .reward_pool
            .checked_add(amount)
            .ok_or(RegistryError::ArithmeticOverflow)?;
        let total_rewarded = record
            .total_rewarded
            .checked_add(amount)
            .ok_or(RegistryError::ArithmeticOverflow)?;

        let mut commission = mul_div(amount, commission_bps, BPS_DENOMINATOR)?;
        let distributable = amount - commission;

        if record.active_stake == 0 {
            commission = amount;
        }
        let total_commission = record
            .commission
            .checked_add(commission)
            .ok_or(RegistryError::ArithmeticOverflow)?;

        if record.active_stake > 0 && distributable > 0 {
            record.rewards.distribute(distributable, record.active_stake)?;
        }
        record.reward_pool = pool;
        record.total_rewarded = total_rewarded;
        record.commission = total_commission;

        info!(
            validator = %validator,
            amount = %amount,
            commission = %commission,
            pool = %pool,
            epoch,
            "Reward applied"
        );
        Ok(())
    }

    /// Pays the calling validator its commission plus its self-stake share
    pub fn withdraw_validator_rewards(&mut self, caller: Address) -> Result<Balance, RegistryError> {
        let epoch = self.epoch;
        let current = self
            .validators
            .get(&caller)
            .ok_or(RegistryError::NotRegistered(caller))?;

        let mut validator = current.clone();
        validator.accrue_self(epoch)?;
        let amount = validator
            .self_stake
            .accrued_reward
            .checked_add(validator.commission)
            .ok_or(RegistryError::ArithmeticOverflow)?;
        validator.reward_pool = validator.reward_pool.checked_sub(amount).ok_or(
            RegistryError::InsufficientRewardPool {
                available: validator.reward_pool,
                required: amount,
            },
        )?;
        validator.self_stake.take_accrued();
        validator.commission = 0;
        self.validators.insert(caller, validator);

        info!(validator = %caller, amount = %amount, "Validator rewards withdrawn");
        Ok(amount)
    }

    /// What `withdraw_validator_rewards` would pay right now
    pub fn pending_validator_rewards(&self, validator: &Address) -> Result<Balance, RegistryError> {
        let record = self
            .validators
            .get(validator)
            .ok_or(RegistryError::UnknownValidator(*validator))?;
        let quote = record.self_stake.quote(&record.rewards, self.epoch)?;
        record
            .self_stake
            .accrued_reward
            .checked_add(quote.share)
            .and_then(|v| v.checked_add(record.commission))
            .ok_or(RegistryError::ArithmeticOverflow)
    }

    /// Starts `epoch`: pending stake due by then becomes active
    ///
    /// Every validator's new active stake is computed before anything is written, so
    /// an overflow leaves the registry untouched.
    pub(crate) fn begin_epoch(&mut self, epoch: EpochNumber) -> Result<(), RegistryError> {
        let first_pending = epoch.saturating_add(1);
        let mut due: Vec<(Address, Balance)> = Vec::new();
        for (address, validator) in &self.validators {
            let amount = validator
                .pending_stake
                .range(..first_pending)
                .try_fold(0, |acc: Balance, (_, amount)| acc.checked_add(*amount))
                .ok_or(RegistryError::ArithmeticOverflow)?;
            if amount > 0 {
                let active = validator
                    .active_stake
                    .checked_add(amount)
                    .ok_or(RegistryError::ArithmeticOverflow)?;
                due.push((*address, active));
            }
        }

        let mut activated: Balance = 0;
        for (address, active) in due {
            let validator = self.validator_mut(&address)?;
            let still_pending = validator.pending_stake.split_off(&first_pending);
            let tranches = std::mem::replace(&mut validator.pending_stake, still_pending);
            for (activation, amount) in tranches {
                validator.rewards.activate(activation, amount);
                activated = activated.saturating_add(amount);
            }
            validator.active_stake = active;
        }
        self.epoch = epoch;

        debug!(epoch, activated = %activated, "Registry entered epoch");
        Ok(())
    }

    pub fn epoch(&self) -> EpochNumber {
        self.epoch
    }

    pub fn get_validator(&self, address: &Address) -> Option<&ValidatorInfo> {
        self.validators.get(address)
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.validators
            .get(address)
            .map(|v| v.registered)
            .unwrap_or(false)
    }

    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    /// Stake across all validators
    pub fn total_stake(&self) -> Balance {
        self.validators
            .values()
            .fold(0, |acc: Balance, v| acc.saturating_add(v.total_stake))
    }

    /// Deterministic snapshot, validators sorted by address
    pub fn get_state(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            epoch: self.epoch,
            config: self.config.clone(),
            validators: self
                .validators
                .values()
                .map(|v| ValidatorSnapshot {
                    address: v.address,
                    registered: v.registered,
                    registered_epoch: v.registered_epoch,
                    self_stake: v.self_stake.principal(),
                    total_stake: v.total_stake,
                    active_stake: v.active_stake,
                    pending_stake: v.pending_total(),
                    reward_pool: v.reward_pool,
                    commission: v.commission,
                    total_rewarded: v.total_rewarded,
                    reward_events: v.rewards.distributions,
                    open_activations: v.rewards.activations.len(),
                })
                .collect(),
        }
    }

    fn validator_mut(&mut self, address: &Address) -> Result<&mut ValidatorInfo, RegistryError> {
        self.validators
            .get_mut(address)
            .ok_or(RegistryError::UnknownValidator(*address))
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StakeRegistry for ValidatorRegistry {
    fn current_epoch(&self) -> EpochNumber {
        self.epoch
    }

    fn cooldown_epochs(&self) -> Result<u64, RegistryError> {
        Ok(self.config()?.cooldown_epochs)
    }

    fn min_delegation(&self) -> Result<Balance, RegistryError> {
        Ok(self.config()?.min_delegation)
    }

    fn bond(&mut self, validator: &Address, amount: Balance) -> Result<StakeStatus, RegistryError> {
        let delay = self.config()?.activation_delay_epochs;
        let status = StakeStatus::for_delay(self.epoch, delay)?;
        self.validator_mut(validator)?.bond(amount, status)?;
        Ok(status)
    }

    fn unbond(
        &mut self,
        validator: &Address,
        amount: Balance,
        status: StakeStatus,
    ) -> Result<(), RegistryError> {
        let epoch = self.epoch;
        self.validator_mut(validator)?.unbond(amount, status, epoch)
    }

    fn reward_share(
        &self,
        validator: &Address,
        position: &StakePosition,
    ) -> Result<RewardQuote, RegistryError> {
        let record = self
            .validators
            .get(validator)
            .ok_or(RegistryError::UnknownValidator(*validator))?;
        Ok(position.quote(&record.rewards, self.epoch)?)
    }

    fn fold_activations(
        &mut self,
        validator: &Address,
        tranches: &[(EpochNumber, Balance)],
    ) -> Result<(), RegistryError> {
        let record = self.validator_mut(validator)?;
        let mut rewards = record.rewards.clone();
        for (epoch, amount) in tranches {
            rewards.settle(*epoch, *amount)?;
        }
        record.rewards = rewards;
        Ok(())
    }

    fn pay_reward(&mut self, validator: &Address, amount: Balance) -> Result<(), RegistryError> {
        let record = self.validator_mut(validator)?;
        record.reward_pool = record.reward_pool.checked_sub(amount).ok_or(
            RegistryError::InsufficientRewardPool {
                available: record.reward_pool,
                required: amount,
            },
        )?;
        Ok(())
    }
}

/// Registry snapshot returned by `get_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub epoch: EpochNumber,
    pub config: Option<RegistryConfig>,
    pub validators: Vec<ValidatorSnapshot>,
}

impl RegistrySnapshot {
    pub fn validator(&self, address: &Address) -> Option<&ValidatorSnapshot> {
        self.validators.iter().find(|v| &v.address == address)
    }
}

/// Per-validator part of the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSnapshot {
    pub address: Address,
    pub registered: bool,
    pub registered_epoch: EpochNumber,
    pub self_stake: Balance,
    pub total_stake: Balance,
    pub active_stake: Balance,
    pub pending_stake: Balance,
    pub reward_pool: Balance,
    pub commission: Balance,
    pub total_rewarded: Balance,
    /// Rewards spread over active stake so far
    pub reward_events: u64,

    /// Activation epochs some holder has not folded yet
    pub open_activations: usize,
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry already initialized")]
    AlreadyInitialized,

    #[error("Registry not initialized")]
    NotInitialized,

    #[error("Invalid registry configuration: {0}")]
    InvalidConfig(String),

    #[error("Validator {0} already registered")]
    AlreadyRegistered(Address),

    #[error("Caller {0} is not a registered validator")]
    NotRegistered(Address),

    #[error("Unknown validator {0}")]
    UnknownValidator(Address),

    #[error("Insufficient stake: minimum={minimum}, provided={provided}")]
    InsufficientStake { minimum: Balance, provided: Balance },

    #[error("Unbond exceeds bonded stake: available={available}, required={required}")]
    UnbondExceedsStake { available: Balance, required: Balance },

    #[error("Reward pool too small: available={available}, required={required}")]
    InsufficientRewardPool { available: Balance, required: Balance },

    #[error("No outstanding activation for epoch {0}")]
    UnknownActivation(EpochNumber),

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,
}

impl From<StakeError> for RegistryError {
    fn from(err: StakeError) -> Self {
        match err {
            StakeError::ArithmeticOverflow => RegistryError::ArithmeticOverflow,
            StakeError::InsufficientPrincipal { available, required } => {
                RegistryError::UnbondExceedsStake { available, required }
            }
            StakeError::UnknownActivation(epoch) => RegistryError::UnknownActivation(epoch),
        }
    }
}
