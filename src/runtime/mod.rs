// Runtime - Transactional front of the staking engine
// Principle: An operation either commits everything or nothing, value transfers included

pub mod chain;

pub use chain::{Chain, ChainError, LocalChain};

use crate::consensus::{Epoch, EpochController, EpochError, SettlementRecord};
use crate::contracts::{
    DelegationError, DelegationLedger, LedgerConfig, LedgerSnapshot, PendingUnstake,
    RegistryConfig, RegistryError, RegistrySnapshot, StakePosition, ValidatorRegistry,
};
use crate::types::{Address, Balance, BlockNumber, EpochNumber};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{info, warn};

/// Account holding every bonded principal and undistributed reward
pub fn vault_address() -> Address {
    Address::from_seed("epoch-staking/vault")
}

/// Address the delegation ledgers record as their registry
pub fn registry_address() -> Address {
    Address::from_seed("epoch-staking/registry")
}

/// Everything rolled back when an operation fails
#[derive(Clone)]
struct Checkpoint<C> {
    chain: C,
    controller: EpochController,
    registry: ValidatorRegistry,
    ledgers: BTreeMap<Address, DelegationLedger>,
}

/// The staking engine bound to a chain
///
/// Owns the epoch controller, the validator registry and one delegation ledger per
/// validator. Every public mutation goes through `execute_atomic`.
#[derive(Debug)]
pub struct StakingRuntime<C: Chain + Clone = LocalChain> {
    chain: C,
    vault: Address,
    controller: EpochController,
    registry: ValidatorRegistry,
    ledgers: BTreeMap<Address, DelegationLedger>,
    in_call: bool,
}

impl<C: Chain + Clone> StakingRuntime<C> {
    pub fn new(chain: C) -> Self {
        Self {
            chain,
            vault: vault_address(),
            controller: EpochController::new(),
            registry: ValidatorRegistry::new(),
            ledgers: BTreeMap::new(),
            in_call: false,
        }
    }

    /// Runs `f` as one transaction
    ///
    /// State is checkpointed before `f` and restored if it fails. Nested calls are
    /// rejected.
    pub fn execute_atomic<F, R>(&mut self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&mut Self) -> Result<R, RuntimeError>,
    {
        if self.in_call {
            return Err(RuntimeError::Reentrancy);
        }

        let checkpoint = self.checkpoint();
        self.in_call = true;
        let result = f(self);
        self.in_call = false;

        if let Err(err) = &result {
            warn!(error = %err, "Operation failed, state rolled back");
            self.restore(checkpoint);
        }
        result
    }

    fn checkpoint(&self) -> Checkpoint<C> {
        Checkpoint {
            chain: self.chain.clone(),
            controller: self.controller.clone(),
            registry: self.registry.clone(),
            ledgers: self.ledgers.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint<C>) {
        self.chain = checkpoint.chain;
        self.controller = checkpoint.controller;
        self.registry = checkpoint.registry;
        self.ledgers = checkpoint.ledgers;
    }

    // ---- Epoch controller ----

    /// Opens epoch 1 at the current height
    pub fn init_epochs(
        &mut self,
        caller: Address,
        length: u64,
        first_length: u64,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            let height = rt.chain.height();
            rt.controller.init_epochs(height, length, first_length)?;
            info!(caller = %caller, height, "Epoch schedule started");
            Ok(())
        })
    }

    pub fn epoch(&self) -> Result<EpochNumber, RuntimeError> {
        Ok(self.controller.epoch()?)
    }

    pub fn epoch_info(&self) -> Result<Epoch, RuntimeError> {
        Ok(self.controller.epoch_info()?)
    }

    /// Settles the current epoch; `caller` is recorded as the trigger
    pub fn step_eoe(
        &mut self,
        caller: Address,
        a: u64,
        b: u64,
        c: u64,
        last_step: bool,
    ) -> Result<SettlementRecord, RuntimeError> {
        self.execute_atomic(|rt| {
            let height = rt.chain.height();
            Ok(rt
                .controller
                .step_eoe(&mut rt.registry, height, caller, [a, b, c], last_step)?)
        })
    }

    /// Queues a reward paid by `caller` for the next settlement
    pub fn add_reward(
        &mut self,
        caller: Address,
        height: BlockNumber,
        validator: Address,
        amount: Balance,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            rt.controller
                .add_reward(&rt.registry, height, validator, amount)?;
            let vault = rt.vault;
            rt.chain.transfer(&caller, &vault, amount)?;
            Ok(())
        })
    }

    pub fn queued_rewards(&self) -> Balance {
        self.controller
            .queued_rewards()
            .iter()
            .fold(0, |acc: Balance, e| acc.saturating_add(e.amount))
    }

    pub fn settlements(&self) -> &VecDeque<SettlementRecord> {
        self.controller.settlements()
    }

    pub fn settled_epochs(&self) -> u64 {
        self.controller.settled_epochs()
    }

    // ---- Validator registry ----

    pub fn init_registry(
        &mut self,
        caller: Address,
        config: RegistryConfig,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            rt.registry.init(config)?;
            info!(caller = %caller, "Registry configured");
            Ok(())
        })
    }

    /// Registers `caller` as a validator, bonding `amount` from its balance
    pub fn register_validator(
        &mut self,
        caller: Address,
        amount: Balance,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            rt.registry.register_validator(caller, amount)?;
            let vault = rt.vault;
            rt.chain.transfer(&caller, &vault, amount)?;
            Ok(())
        })
    }

    pub fn stake(&mut self, caller: Address, amount: Balance) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            rt.registry.stake(caller, amount)?;
            let vault = rt.vault;
            rt.chain.transfer(&caller, &vault, amount)?;
            Ok(())
        })
    }

    /// Rewards `validator` immediately, paid by `caller`
    pub fn reward(
        &mut self,
        caller: Address,
        validator: Address,
        amount: Balance,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            rt.registry.reward(&validator, amount)?;
            let vault = rt.vault;
            rt.chain.transfer(&caller, &vault, amount)?;
            Ok(())
        })
    }

    /// Pays the calling validator its commission and self-stake share
    pub fn withdraw_validator_rewards(&mut self, caller: Address) -> Result<Balance, RuntimeError> {
        self.execute_atomic(|rt| {
            let amount = rt.registry.withdraw_validator_rewards(caller)?;
            let vault = rt.vault;
            rt.chain.transfer(&vault, &caller, amount)?;
            Ok(amount)
        })
    }

    pub fn get_state(&self) -> RegistrySnapshot {
        self.registry.get_state()
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    // ---- Delegation ledgers ----

    /// Opens the delegation ledger of `validator`
    ///
    /// Only the validator itself may open its ledger.
    pub fn init_delegation(
        &mut self,
        caller: Address,
        validator: Address,
        cooldown_epochs: u64,
        min_stake: Balance,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            if caller != validator {
                return Err(RuntimeError::Unauthorized {
                    caller,
                    expected: validator,
                });
            }
            if !rt.registry.is_registered(&validator) {
                return Err(RegistryError::NotRegistered(validator).into());
            }

            let config = LedgerConfig {
                validator,
                registry: registry_address(),
                cooldown_epochs,
                min_stake,
            };
            let ledger = rt.ledgers.entry(validator).or_default();
            ledger.init(config, &rt.registry)?;
            Ok(())
        })
    }

    pub fn delegate_stake(
        &mut self,
        caller: Address,
        validator: Address,
        amount: Balance,
    ) -> Result<(), RuntimeError> {
        self.execute_atomic(|rt| {
            let ledger = rt
                .ledgers
                .get_mut(&validator)
                .ok_or(RuntimeError::NoDelegationLedger(validator))?;
            ledger.delegate_stake(&mut rt.registry, caller, amount)?;
            let vault = rt.vault;
            rt.chain.transfer(&caller, &vault, amount)?;
            Ok(())
        })
    }

    pub fn request_unstake_delegated_stakes(
        &mut self,
        caller: Address,
        validator: Address,
    ) -> Result<PendingUnstake, RuntimeError> {
        self.execute_atomic(|rt| {
            let ledger = rt
                .ledgers
                .get_mut(&validator)
                .ok_or(RuntimeError::NoDelegationLedger(validator))?;
            Ok(ledger.request_unstake_delegated_stakes(&rt.registry, caller)?)
        })
    }

    /// Withdraws a matured unstake request to `caller`
    pub fn withdraw(&mut self, caller: Address, validator: Address) -> Result<Balance, RuntimeError> {
        self.execute_atomic(|rt| {
            let ledger = rt
                .ledgers
                .get_mut(&validator)
                .ok_or(RuntimeError::NoDelegationLedger(validator))?;
            let amount = ledger.withdraw(&mut rt.registry, caller)?;
            let vault = rt.vault;
            rt.chain.transfer(&vault, &caller, amount)?;
            Ok(amount)
        })
    }

    /// Pays `caller` every reward its delegation has earned
    pub fn request_withdraw_rewards(
        &mut self,
        caller: Address,
        validator: Address,
    ) -> Result<Balance, RuntimeError> {
        self.execute_atomic(|rt| {
            let ledger = rt
                .ledgers
                .get_mut(&validator)
                .ok_or(RuntimeError::NoDelegationLedger(validator))?;
            let amount = ledger.request_withdraw_rewards(&mut rt.registry, caller)?;
            let vault = rt.vault;
            rt.chain.transfer(&vault, &caller, amount)?;
            Ok(amount)
        })
    }

    pub fn ledger(&self, validator: &Address) -> Option<&DelegationLedger> {
        self.ledgers.get(validator)
    }

    pub fn ledger_state(&self, validator: &Address) -> Option<LedgerSnapshot> {
        self.ledgers.get(validator).map(DelegationLedger::get_state)
    }

    pub fn pending_rewards(
        &self,
        validator: &Address,
        delegator: &Address,
    ) -> Result<Balance, RuntimeError> {
        let ledger = self
            .ledgers
            .get(validator)
            .ok_or(RuntimeError::NoDelegationLedger(*validator))?;
        Ok(ledger.pending_rewards(&self.registry, delegator)?)
    }

    // ---- Chain ----

    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Direct chain access, outside of any transaction
    pub fn chain_mut(&mut self) -> &mut C {
        &mut self.chain
    }

    pub fn vault(&self) -> Address {
        self.vault
    }

    pub fn balance(&self, who: &Address) -> Balance {
        self.chain.balance(who)
    }

    /// Full deterministic snapshot
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            height: self.chain.height(),
            epoch: self.controller.epoch_info().ok(),
            queued_rewards: self.queued_rewards(),
            vault_balance: self.chain.balance(&self.vault),
            registry: self.registry.get_state(),
            ledgers: self
                .ledgers
                .iter()
                .map(|(validator, ledger)| (*validator, ledger.get_state()))
                .collect(),
        }
    }

    /// Checks the accounting identities that must hold between operations
    ///
    /// * every validator's total stake is its self stake plus its delegated principal
    /// * every validator's total stake splits into active and pending stake
    /// * every open activation record is matched by tranches their holders have not folded
    /// * the vault covers all bonded stake, all reward pools and the queued rewards
    pub fn verify_invariants(&self) -> Result<(), RuntimeError> {
        let mut owed: Balance = self.queued_rewards();
        let epoch = self.registry.epoch();
        let unfolded = |stake: &StakePosition| {
            stake
                .pending
                .range(..=epoch)
                .fold(0, |acc: Balance, (_, amount)| acc.saturating_add(*amount))
        };

        for snapshot in self.registry.get_state().validators {
            let delegated = self
                .ledgers
                .get(&snapshot.address)
                .map(DelegationLedger::total_principal)
                .unwrap_or(0);
            let expected = snapshot
                .self_stake
                .checked_add(delegated)
                .ok_or(RuntimeError::ArithmeticOverflow)?;
            if snapshot.total_stake != expected {
                return Err(RuntimeError::InvariantViolation(format!(
                    "{}: total stake {} != self stake {} + delegated {}",
                    snapshot.address, snapshot.total_stake, snapshot.self_stake, delegated
                )));
            }

            let split = snapshot
                .active_stake
                .checked_add(snapshot.pending_stake)
                .ok_or(RuntimeError::ArithmeticOverflow)?;
            if snapshot.total_stake != split {
                return Err(RuntimeError::InvariantViolation(format!(
                    "{}: total stake {} != active {} + pending {}",
                    snapshot.address, snapshot.total_stake, snapshot.active_stake, snapshot.pending_stake
                )));
            }

            if let Some(info) = self.registry.get_validator(&snapshot.address) {
                let delegated_unfolded = self
                    .ledgers
                    .get(&snapshot.address)
                    .map(|ledger| {
                        ledger
                            .positions()
                            .fold(0, |acc: Balance, p| acc.saturating_add(unfolded(&p.stake)))
                    })
                    .unwrap_or(0);
                let held = unfolded(&info.self_stake).saturating_add(delegated_unfolded);
                let open = info
                    .rewards
                    .activations
                    .values()
                    .fold(0, |acc: Balance, a| acc.saturating_add(a.outstanding));
                if held != open {
                    return Err(RuntimeError::InvariantViolation(format!(
                        "{}: open activations {} != unfolded tranches {}",
                        snapshot.address, open, held
                    )));
                }
            }

            owed = owed
                .checked_add(snapshot.total_stake)
                .and_then(|o| o.checked_add(snapshot.reward_pool))
                .ok_or(RuntimeError::ArithmeticOverflow)?;
        }

        let held = self.chain.balance(&self.vault);
        if held < owed {
            return Err(RuntimeError::InvariantViolation(format!(
                "vault holds {} but owes {}",
                held, owed
            )));
        }
        Ok(())
    }
}

/// Snapshot of the whole engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub height: BlockNumber,
    pub epoch: Option<Epoch>,
    pub queued_rewards: Balance,
    pub vault_balance: Balance,
    pub registry: RegistrySnapshot,
    pub ledgers: Vec<(Address, LedgerSnapshot)>,
}

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Epoch(#[from] EpochError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Delegation(#[from] DelegationError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Reentrant call rejected")]
    Reentrancy,

    #[error("No delegation ledger for validator {0}")]
    NoDelegationLedger(Address),

    #[error("Caller {caller} is not {expected}")]
    Unauthorized { caller: Address, expected: Address },

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str) -> Address {
        Address::from_seed(name)
    }

    fn runtime() -> StakingRuntime {
        let mut chain = LocalChain::new();
        for name in ["admin", "validator", "alice", "bob"] {
            chain.mint(account(name), 100_000).unwrap();
        }
        let mut rt = StakingRuntime::new(chain);
        rt.init_epochs(account("admin"), 10, 10).unwrap();
        rt.init_registry(account("admin"), RegistryConfig::default())
            .unwrap();
        rt
    }

    #[test]
    fn test_register_moves_funds_to_vault() {
        let mut rt = runtime();
        let validator = account("validator");

        rt.register_validator(validator, 500).unwrap();

        assert_eq!(rt.balance(&validator), 99_500);
        assert_eq!(rt.balance(&rt.vault()), 500);
        rt.verify_invariants().unwrap();
    }

    #[test]
    fn test_failed_transfer_rolls_back_registration() {
        let mut chain = LocalChain::new();
        let poor = account("poor");
        chain.mint(poor, 5).unwrap();
        let mut rt = StakingRuntime::new(chain);
        rt.init_registry(account("admin"), RegistryConfig::default())
            .unwrap();

        let before = rt.snapshot();
        let err = rt.register_validator(poor, 50).unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::Chain(ChainError::InsufficientBalance { .. })
        ));
        assert!(!rt.registry().is_registered(&poor));
        assert_eq!(rt.snapshot(), before);
    }

    #[test]
    fn test_nested_call_is_rejected() {
        let mut rt = runtime();
        let validator = account("validator");

        let err = rt
            .execute_atomic(|inner| inner.register_validator(validator, 100))
            .unwrap_err();

        assert_eq!(err, RuntimeError::Reentrancy);
        assert!(!rt.registry().is_registered(&validator));
    }

    #[test]
    fn test_only_validator_opens_its_ledger() {
        let mut rt = runtime();
        let validator = account("validator");
        rt.register_validator(validator, 100).unwrap();

        let err = rt
            .init_delegation(account("alice"), validator, 2, 10)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Unauthorized {
                caller: account("alice"),
                expected: validator
            }
        );
        assert!(rt.ledger(&validator).is_none());

        rt.init_delegation(validator, validator, 2, 10).unwrap();
        assert!(rt.ledger(&validator).is_some());
    }

    #[test]
    fn test_delegate_without_ledger() {
        let mut rt = runtime();
        let validator = account("validator");
        rt.register_validator(validator, 100).unwrap();

        let err = rt
            .delegate_stake(account("alice"), validator, 50)
            .unwrap_err();
        assert_eq!(err, RuntimeError::NoDelegationLedger(validator));
        assert_eq!(rt.balance(&account("alice")), 100_000);
    }

    #[test]
    fn test_validator_reward_roundtrip_through_vault() {
        let mut rt = runtime();
        let validator = account("validator");
        let admin = account("admin");
        rt.register_validator(validator, 100).unwrap();

        // Nothing is active yet, the validator keeps the whole reward
        rt.reward(admin, validator, 1_000).unwrap();
        let paid = rt.withdraw_validator_rewards(validator).unwrap();

        assert_eq!(paid, 1_000);
        assert_eq!(rt.balance(&validator), 100_000 - 100 + 1_000);
        assert_eq!(rt.balance(&rt.vault()), 100);
        rt.verify_invariants().unwrap();
    }
}
