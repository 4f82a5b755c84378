// Epoch Staking - Validator staking engine with epoch-based rewards
// Principle: Stake, rewards and epochs are accounted for exactly, in integers

pub mod cli;
pub mod consensus;
pub mod contracts;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod tests;

pub use consensus::{Epoch, EpochController, EpochError, SettlementRecord};
pub use contracts::{DelegationError, DelegationLedger, RegistryConfig, RegistryError, ValidatorRegistry};
pub use runtime::{Chain, LocalChain, RuntimeError, StakingRuntime};
