// Consensus - Epoch timing for the staking engine
// Principle: Rewards land at epoch boundaries, never mid-epoch

pub mod epoch;

pub use epoch::{
    Epoch, EpochController, EpochError, RewardQueueEntry, SettlementRecord, GENESIS_EPOCH,
    SETTLEMENT_HISTORY,
};
