// Epoch - Height windows and end-of-epoch settlement
use crate::contracts::staking::{RegistryError, ValidatorRegistry};
use crate::types::{Address, Balance, BlockNumber, EpochNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Index of the first epoch
pub const GENESIS_EPOCH: EpochNumber = 1;

/// Settlement records kept by the controller, newest last
pub const SETTLEMENT_HISTORY: usize = 64;

/// An epoch window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Epoch number
    pub index: EpochNumber,

    /// First block of the window
    pub start_height: BlockNumber,

    /// Number of blocks in the window
    pub length: u64,
}

impl Epoch {
    /// First block after the window
    pub fn end_height(&self) -> Result<BlockNumber, EpochError> {
        self.start_height
            .checked_add(self.length)
            .ok_or(EpochError::ArithmeticOverflow)
    }

    /// Last block of the window; settlement is allowed from here on
    pub fn last_height(&self) -> Result<BlockNumber, EpochError> {
        Ok(self.end_height()? - 1)
    }

    /// Checks whether a block belongs to this epoch
    pub fn contains_block(&self, height: BlockNumber) -> bool {
        match self.end_height() {
            Ok(end) => height >= self.start_height && height < end,
            Err(_) => height >= self.start_height,
        }
    }

    /// Following epoch, `length` blocks long
    pub fn next(&self, length: u64) -> Result<Self, EpochError> {
        Ok(Self {
            index: self
                .index
                .checked_add(1)
                .ok_or(EpochError::ArithmeticOverflow)?,
            start_height: self.end_height()?,
            length,
        })
    }
}

/// Reward injected mid-epoch, applied at the next settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardQueueEntry {
    pub height: BlockNumber,
    pub validator: Address,
    pub amount: Balance,
}

/// Record of one end-of-epoch step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Epoch that was concluded
    pub epoch: EpochNumber,
    pub start_height: BlockNumber,
    pub length: u64,

    /// Chain height at settlement
    pub settled_at: BlockNumber,

    /// Address that triggered the step
    pub trigger: Address,

    /// Opaque attribution values supplied with the step
    pub step_args: [u64; 3],

    pub last_step: bool,

    /// Rewards applied, summed per validator
    pub rewards: Vec<(Address, Balance)>,
}

/// Epoch controller
///
/// Cycles `Active(n) -> Settling -> Active(n + 1)`. Settling happens entirely inside
/// `step_eoe`, so outside a call the controller is always `Active`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochController {
    current: Option<Epoch>,

    /// Length of every epoch after the first
    epoch_length: u64,

    reward_queue: Vec<RewardQueueEntry>,

    /// The last `SETTLEMENT_HISTORY` settlements
    settlements: VecDeque<SettlementRecord>,

    /// Settlements since genesis
    settled_epochs: u64,
}

impl EpochController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens epoch 1 at `height`
    ///
    /// Epoch 1 lasts `first_length` blocks, every later epoch `length` blocks.
    pub fn init_epochs(
        &mut self,
        height: BlockNumber,
        length: u64,
        first_length: u64,
    ) -> Result<(), EpochError> {
        if self.current.is_some() {
            return Err(EpochError::AlreadyInitialized);
        }
        if length == 0 || first_length == 0 {
            return Err(EpochError::InvalidLength);
        }

        let epoch = Epoch {
            index: GENESIS_EPOCH,
            start_height: height,
            length: first_length,
        };
        epoch.end_height()?;

        info!(start_height = height, length, first_length, "Epochs initialized");
        self.current = Some(epoch);
        self.epoch_length = length;
        Ok(())
    }

    /// Current epoch index
    pub fn epoch(&self) -> Result<EpochNumber, EpochError> {
        Ok(self.epoch_info()?.index)
    }

    /// Current epoch window
    pub fn epoch_info(&self) -> Result<Epoch, EpochError> {
        self.current.ok_or(EpochError::NotInitialized)
    }

    /// Length used for epochs after the first
    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    /// Queues a reward for the current epoch
    pub fn add_reward(
        &mut self,
        registry: &ValidatorRegistry,
        height: BlockNumber,
        validator: Address,
        amount: Balance,
    ) -> Result<(), EpochError> {
        let epoch = self.epoch_info()?;
        if !epoch.contains_block(height) {
            return Err(EpochError::InvalidHeight {
                height,
                start: epoch.start_height,
                end: epoch.end_height()?,
            });
        }
        // Checked now so that settlement cannot fail on it later
        if !registry.is_registered(&validator) {
            return Err(EpochError::UnknownValidator(validator));
        }

        self.reward_queue.push(RewardQueueEntry {
            height,
            validator,
            amount,
        });

        debug!(epoch = epoch.index, height, validator = %validator, amount = %amount, "Reward queued");
        Ok(())
    }

    /// Settles the current epoch and opens the next one
    ///
    /// The queued rewards are summed per validator and applied to the registry as a
    /// single batch, then the registry is moved to the new epoch.
    pub fn step_eoe(
        &mut self,
        registry: &mut ValidatorRegistry,
        height: BlockNumber,
        trigger: Address,
        step_args: [u64; 3],
        last_step: bool,
    ) -> Result<SettlementRecord, EpochError> {
        let epoch = self.epoch_info()?;
        let last_height = epoch.last_height()?;
        if height < last_height {
            warn!(
                epoch = epoch.index,
                height,
                end = last_height,
                trigger = %trigger,
                "End of epoch requested too early"
            );
            return Err(EpochError::EpochNotElapsed {
                height,
                end: last_height,
            });
        }

        let mut grouped: BTreeMap<Address, Balance> = BTreeMap::new();
        for entry in &self.reward_queue {
            let total = grouped.entry(entry.validator).or_insert(0);
            *total = total
                .checked_add(entry.amount)
                .ok_or(EpochError::ArithmeticOverflow)?;
        }

        for (validator, amount) in &grouped {
            registry.reward(validator, *amount)?;
        }

        let next = epoch.next(self.epoch_length)?;
        registry.begin_epoch(next.index)?;

        let record = SettlementRecord {
            epoch: epoch.index,
            start_height: epoch.start_height,
            length: epoch.length,
            settled_at: height,
            trigger,
            step_args,
            last_step,
            rewards: grouped.into_iter().collect(),
        };

        info!(
            epoch = epoch.index,
            next = next.index,
            next_start = next.start_height,
            height,
            trigger = %trigger,
            step_args = ?step_args,
            last_step,
            rewards = record.rewards.len(),
            "Epoch settled"
        );

        self.reward_queue.clear();
        self.current = Some(next);
        if self.settlements.len() == SETTLEMENT_HISTORY {
            self.settlements.pop_front();
        }
        self.settlements.push_back(record.clone());
        self.settled_epochs += 1;
        Ok(record)
    }

    /// Rewards waiting for the next settlement
    pub fn queued_rewards(&self) -> &[RewardQueueEntry] {
        &self.reward_queue
    }

    /// Recent settlements, oldest first
    pub fn settlements(&self) -> &VecDeque<SettlementRecord> {
        &self.settlements
    }

    /// Number of settlements since genesis
    pub fn settled_epochs(&self) -> u64 {
        self.settled_epochs
    }
}

/// Epoch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EpochError {
    #[error("Epochs already initialized")]
    AlreadyInitialized,

    #[error("Epochs not initialized")]
    NotInitialized,

    #[error("Epoch length must be positive")]
    InvalidLength,

    #[error("Epoch window not yet elapsed: height {height}, settlement allowed from {end}")]
    EpochNotElapsed { height: BlockNumber, end: BlockNumber },

    #[error("Height {height} outside current epoch window [{start}, {end})")]
    InvalidHeight {
        height: BlockNumber,
        start: BlockNumber,
        end: BlockNumber,
    },

    #[error("Unknown validator {0}")]
    UnknownValidator(Address),

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::staking::RegistryConfig;

    fn registry_with(validator: Address) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new();
        registry.init(RegistryConfig::default()).unwrap();
        registry.register_validator(validator, 10).unwrap();
        registry
    }

    fn trigger() -> Address {
        Address::from_bytes([42; 32])
    }

    #[test]
    fn test_epoch_contains() {
        let epoch = Epoch {
            index: 1,
            start_height: 100,
            length: 10,
        };
        assert!(epoch.contains_block(100));
        assert!(epoch.contains_block(109));
        assert!(!epoch.contains_block(110));
        assert!(!epoch.contains_block(99));
        assert_eq!(epoch.last_height().unwrap(), 109);
    }

    #[test]
    fn test_init_twice() {
        let mut controller = EpochController::new();
        controller.init_epochs(0, 10, 10).unwrap();
        assert_eq!(
            controller.init_epochs(0, 10, 10),
            Err(EpochError::AlreadyInitialized)
        );
        assert_eq!(
            EpochController::new().init_epochs(0, 0, 10),
            Err(EpochError::InvalidLength)
        );
    }

    #[test]
    fn test_queries_before_init() {
        let controller = EpochController::new();
        assert_eq!(controller.epoch(), Err(EpochError::NotInitialized));
        assert_eq!(controller.epoch_info(), Err(EpochError::NotInitialized));
    }

    #[test]
    fn test_step_advances_epoch() {
        let validator = Address::from_bytes([1; 32]);
        let mut registry = registry_with(validator);
        let mut controller = EpochController::new();
        controller.init_epochs(5, 10, 20).unwrap();
        assert_eq!(controller.epoch().unwrap(), 1);

        // First window is [5, 25)
        let err = controller
            .step_eoe(&mut registry, 23, trigger(), [0; 3], false)
            .unwrap_err();
        assert_eq!(err, EpochError::EpochNotElapsed { height: 23, end: 24 });
        assert_eq!(controller.epoch().unwrap(), 1);

        controller
            .step_eoe(&mut registry, 24, trigger(), [0; 3], false)
            .unwrap();
        let info = controller.epoch_info().unwrap();
        assert_eq!(info.index, 2);
        assert_eq!(info.start_height, 25);
        assert_eq!(info.length, 10);
        assert_eq!(registry.epoch(), 2);

        controller
            .step_eoe(&mut registry, 34, trigger(), [1, 2, 3], true)
            .unwrap();
        let info = controller.epoch_info().unwrap();
        assert_eq!(info.index, 3);
        assert_eq!(info.start_height, 35);

        let last = controller.settlements().back().unwrap();
        assert_eq!(last.epoch, 2);
        assert_eq!(last.step_args, [1, 2, 3]);
        assert!(last.last_step);
    }

    #[test]
    fn test_settlement_history_is_bounded() {
        let validator = Address::from_bytes([1; 32]);
        let mut registry = registry_with(validator);
        let mut controller = EpochController::new();
        controller.init_epochs(0, 1, 1).unwrap();

        let total = SETTLEMENT_HISTORY as u64 + 6;
        for height in 0..total {
            controller
                .step_eoe(&mut registry, height, trigger(), [0; 3], false)
                .unwrap();
        }

        assert_eq!(controller.settled_epochs(), total);
        assert_eq!(controller.epoch().unwrap(), GENESIS_EPOCH + total);
        assert_eq!(controller.settlements().len(), SETTLEMENT_HISTORY);
        assert_eq!(controller.settlements().front().unwrap().epoch, 7);
        assert_eq!(controller.settlements().back().unwrap().epoch, total);
    }

    #[test]
    fn test_add_reward_window() {
        let validator = Address::from_bytes([1; 32]);
        let registry = registry_with(validator);
        let mut controller = EpochController::new();
        controller.init_epochs(10, 10, 10).unwrap();

        assert_eq!(
            controller.add_reward(&registry, 20, validator, 5),
            Err(EpochError::InvalidHeight {
                height: 20,
                start: 10,
                end: 20
            })
        );
        assert!(matches!(
            controller.add_reward(&registry, 9, validator, 5),
            Err(EpochError::InvalidHeight { .. })
        ));

        let stranger = Address::from_bytes([2; 32]);
        assert_eq!(
            controller.add_reward(&registry, 12, stranger, 5),
            Err(EpochError::UnknownValidator(stranger))
        );

        controller.add_reward(&registry, 12, validator, 5).unwrap();
        assert_eq!(controller.queued_rewards().len(), 1);
        // Registry untouched until settlement
        assert_eq!(registry.get_validator(&validator).unwrap().reward_pool, 0);
    }

    #[test]
    fn test_settlement_groups_rewards() {
        let v1 = Address::from_bytes([1; 32]);
        let v2 = Address::from_bytes([2; 32]);
        let mut registry = registry_with(v1);
        registry.register_validator(v2, 10).unwrap();

        let mut controller = EpochController::new();
        controller.init_epochs(0, 10, 10).unwrap();
        controller.add_reward(&registry, 1, v2, 7).unwrap();
        controller.add_reward(&registry, 2, v1, 3).unwrap();
        controller.add_reward(&registry, 3, v1, 4).unwrap();

        let record = controller
            .step_eoe(&mut registry, 9, trigger(), [0; 3], false)
            .unwrap();

        assert_eq!(record.rewards, vec![(v1, 7), (v2, 7)]);
        assert!(controller.queued_rewards().is_empty());
        assert_eq!(registry.get_validator(&v1).unwrap().reward_pool, 7);
        assert_eq!(registry.get_validator(&v2).unwrap().reward_pool, 7);
    }
}
