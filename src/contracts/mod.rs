// Contracts - Staking system contracts embedded in the runtime
// Principle: No deployable code, everything is hardcoded and auditable

pub mod stake;
pub mod staking;
pub mod delegation;

pub use stake::{
    mul_div, Activation, RewardIndex, RewardQuote, StakeError, StakePosition, StakeStatus,
    REWARD_INDEX_SCALE,
};
pub use staking::{
    RegistryConfig, RegistryError, RegistrySnapshot, StakeRegistry, ValidatorInfo,
    ValidatorRegistry, ValidatorSnapshot,
};
pub use delegation::{
    DelegationError, DelegationLedger, DelegationPosition, LedgerConfig, LedgerSnapshot,
    PendingUnstake, PositionSnapshot, PositionState, RewardWithdrawal,
};
