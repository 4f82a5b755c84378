// Runner - Scenario execution against an in-memory chain
// Principle: Every step is checked against the accounting invariants before the next one

use crate::cli::config::SimConfig;
use crate::consensus::SettlementRecord;
use crate::contracts::PendingUnstake;
use crate::runtime::{
    Chain, ChainError, LocalChain, RuntimeError, RuntimeSnapshot, StakingRuntime,
};
use crate::types::{Address, Balance};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Scripted sequence of operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| RunnerError::Parse(format!("{}: {}", path.display(), e)))
    }
}

/// One step plus its expected result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub op: Step,

    /// The step must fail; the scenario aborts if it succeeds
    #[serde(default)]
    pub expect_error: bool,
}

impl From<Step> for ScenarioStep {
    fn from(op: Step) -> Self {
        Self {
            op,
            expect_error: false,
        }
    }
}

/// Operations available to a scenario; accounts are referred to by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Produce blocks
    AdvanceBlocks { blocks: u64 },

    /// Produce blocks up to the last block of the current epoch
    AdvanceToEpochEnd,

    /// Settle the current epoch
    StepEoe {
        caller: String,
        #[serde(default)]
        args: [u64; 3],
        #[serde(default)]
        last_step: bool,
    },

    /// Queue a reward at the current height
    AddReward {
        caller: String,
        validator: String,
        amount: Balance,
    },

    RegisterValidator { caller: String, amount: Balance },

    Stake { caller: String, amount: Balance },

    /// Reward a validator immediately
    Reward {
        caller: String,
        validator: String,
        amount: Balance,
    },

    WithdrawValidatorRewards { caller: String },

    /// Open a delegation ledger; missing parameters come from the configuration
    InitDelegation {
        validator: String,
        #[serde(default)]
        cooldown_epochs: Option<u64>,
        #[serde(default)]
        min_stake: Option<Balance>,
    },

    DelegateStake {
        caller: String,
        validator: String,
        amount: Balance,
    },

    RequestUnstake { caller: String, validator: String },

    Withdraw { caller: String, validator: String },

    WithdrawRewards { caller: String, validator: String },

    /// Record a full snapshot
    Snapshot,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::AdvanceBlocks { .. } => "advance_blocks",
            Step::AdvanceToEpochEnd => "advance_to_epoch_end",
            Step::StepEoe { .. } => "step_eoe",
            Step::AddReward { .. } => "add_reward",
            Step::RegisterValidator { .. } => "register_validator",
            Step::Stake { .. } => "stake",
            Step::Reward { .. } => "reward",
            Step::WithdrawValidatorRewards { .. } => "withdraw_validator_rewards",
            Step::InitDelegation { .. } => "init_delegation",
            Step::DelegateStake { .. } => "delegate_stake",
            Step::RequestUnstake { .. } => "request_unstake",
            Step::Withdraw { .. } => "withdraw",
            Step::WithdrawRewards { .. } => "withdraw_rewards",
            Step::Snapshot => "snapshot",
        }
    }
}

/// What a successful step produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Height(u64),
    Paid(Balance),
    Unstake(PendingUnstake),
    Settled(SettlementRecord),
    Snapshot(Box<RuntimeSnapshot>),
}

/// Line of the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub outcome: Option<StepOutcome>,
    pub error: Option<String>,
}

/// Account address for a scenario name
pub fn account(name: &str) -> Address {
    Address::from_seed(name)
}

/// Engine plus the configuration it was built from
pub struct Simulator {
    config: SimConfig,
    admin: Address,
    runtime: StakingRuntime<LocalChain>,
}

impl Simulator {
    /// Funds the configured accounts and initializes epochs and registry
    pub fn new(config: SimConfig) -> Result<Self, RunnerError> {
        config
            .validate()
            .map_err(|e| RunnerError::Config(e.to_string()))?;

        let mut chain = LocalChain::at_height(config.start_height);
        for genesis in &config.accounts {
            chain.mint(account(&genesis.name), genesis.balance)?;
            debug!(name = %genesis.name, address = %account(&genesis.name), "Account funded");
        }

        let admin = account(&config.admin);
        let mut runtime = StakingRuntime::new(chain);
        runtime.init_epochs(admin, config.epochs.length, config.epochs.first_length)?;
        runtime.init_registry(admin, config.registry.clone())?;

        info!(
            accounts = config.accounts.len(),
            epoch_length = config.epochs.length,
            first_epoch_length = config.epochs.first_length,
            "Simulator ready"
        );
        Ok(Self {
            config,
            admin,
            runtime,
        })
    }

    pub fn runtime(&self) -> &StakingRuntime<LocalChain> {
        &self.runtime
    }

    pub fn admin(&self) -> Address {
        self.admin
    }

    /// Applies one step to the engine
    pub fn apply(&mut self, step: &Step) -> Result<StepOutcome, RuntimeError> {
        let rt = &mut self.runtime;
        let outcome = match step {
            Step::AdvanceBlocks { blocks } => StepOutcome::Height(rt.chain_mut().advance(*blocks)?),
            Step::AdvanceToEpochEnd => {
                let last = rt.epoch_info()?.last_height()?;
                let chain = rt.chain_mut();
                let height = chain.height().max(last);
                StepOutcome::Height(chain.advance_to(height)?)
            }
            Step::StepEoe {
                caller,
                args,
                last_step,
            } => StepOutcome::Settled(rt.step_eoe(
                account(caller),
                args[0],
                args[1],
                args[2],
                *last_step,
            )?),
            Step::AddReward {
                caller,
                validator,
                amount,
            } => {
                let height = rt.chain().height();
                rt.add_reward(account(caller), height, account(validator), *amount)?;
                StepOutcome::Done
            }
            Step::RegisterValidator { caller, amount } => {
                rt.register_validator(account(caller), *amount)?;
                StepOutcome::Done
            }
            Step::Stake { caller, amount } => {
                rt.stake(account(caller), *amount)?;
                StepOutcome::Done
            }
            Step::Reward {
                caller,
                validator,
                amount,
            } => {
                rt.reward(account(caller), account(validator), *amount)?;
                StepOutcome::Done
            }
            Step::WithdrawValidatorRewards { caller } => {
                StepOutcome::Paid(rt.withdraw_validator_rewards(account(caller))?)
            }
            Step::InitDelegation {
                validator,
                cooldown_epochs,
                min_stake,
            } => {
                let validator = account(validator);
                rt.init_delegation(
                    validator,
                    validator,
                    cooldown_epochs.unwrap_or(self.config.delegation.cooldown_epochs),
                    min_stake.unwrap_or(self.config.delegation.min_stake),
                )?;
                StepOutcome::Done
            }
            Step::DelegateStake {
                caller,
                validator,
                amount,
            } => {
                rt.delegate_stake(account(caller), account(validator), *amount)?;
                StepOutcome::Done
            }
            Step::RequestUnstake { caller, validator } => StepOutcome::Unstake(
                rt.request_unstake_delegated_stakes(account(caller), account(validator))?,
            ),
            Step::Withdraw { caller, validator } => {
                StepOutcome::Paid(rt.withdraw(account(caller), account(validator))?)
            }
            Step::WithdrawRewards { caller, validator } => StepOutcome::Paid(
                rt.request_withdraw_rewards(account(caller), account(validator))?,
            ),
            Step::Snapshot => StepOutcome::Snapshot(Box::new(rt.snapshot())),
        };
        Ok(outcome)
    }

    /// Runs every step, checking the invariants after each one
    ///
    /// `trace_state` attaches a snapshot to every report line.
    pub fn run(
        &mut self,
        scenario: &Scenario,
        trace_state: bool,
    ) -> Result<Vec<StepReport>, RunnerError> {
        info!(name = %scenario.name, steps = scenario.steps.len(), "Running scenario");
        let mut reports = Vec::with_capacity(scenario.steps.len());

        for (index, step) in scenario.steps.iter().enumerate() {
            let op = step.op.name();
            let report = match (self.apply(&step.op), step.expect_error) {
                (Ok(_), true) => return Err(RunnerError::UnexpectedSuccess { index, op }),
                (Err(source), false) => return Err(RunnerError::StepFailed { index, op, source }),
                (Ok(outcome), false) => StepReport {
                    index,
                    op,
                    outcome: Some(outcome),
                    error: None,
                },
                (Err(err), true) => {
                    debug!(index, op, error = %err, "Step failed as expected");
                    StepReport {
                        index,
                        op,
                        outcome: None,
                        error: Some(err.to_string()),
                    }
                }
            };

            if let Err(err) = self.runtime.verify_invariants() {
                warn!(index, op, error = %err, "Invariant check failed");
                return Err(RunnerError::StepFailed {
                    index,
                    op,
                    source: err,
                });
            }

            reports.push(report);
            if trace_state && !matches!(step.op, Step::Snapshot) {
                reports.push(StepReport {
                    index,
                    op: "snapshot",
                    outcome: Some(StepOutcome::Snapshot(Box::new(self.runtime.snapshot()))),
                    error: None,
                });
            }
        }

        info!(
            name = %scenario.name,
            validators = self.runtime.registry().validator_count(),
            settled_epochs = self.runtime.settled_epochs(),
            "Scenario completed"
        );
        Ok(reports)
    }
}

/// Walkthrough of one full delegation cycle
///
/// A validator registers and opens its ledger, two delegators join in different
/// epochs, a queued reward is settled, and one delegator leaves after the cooldown.
pub fn demo_scenario(config: &SimConfig) -> Scenario {
    let admin = config.admin.clone();
    let settle = || {
        vec![
            Step::AdvanceToEpochEnd.into(),
            Step::StepEoe {
                caller: admin.clone(),
                args: [0, 0, 0],
                last_step: false,
            }
            .into(),
            Step::AdvanceBlocks { blocks: 1 }.into(),
        ]
    };
    let s = |n: &str| n.to_string();

    let mut steps: Vec<ScenarioStep> = vec![
        Step::RegisterValidator {
            caller: s("validator"),
            amount: 100,
        }
        .into(),
        Step::InitDelegation {
            validator: s("validator"),
            cooldown_epochs: None,
            min_stake: None,
        }
        .into(),
        Step::DelegateStake {
            caller: s("alice"),
            validator: s("validator"),
            amount: 300,
        }
        .into(),
    ];
    steps.extend(settle());
    steps.push(
        Step::DelegateStake {
            caller: s("bob"),
            validator: s("validator"),
            amount: 600,
        }
        .into(),
    );
    steps.push(
        Step::AddReward {
            caller: admin.clone(),
            validator: s("validator"),
            amount: 1_000,
        }
        .into(),
    );
    steps.extend(settle());
    steps.push(
        Step::RequestUnstake {
            caller: s("alice"),
            validator: s("validator"),
        }
        .into(),
    );
    steps.push(ScenarioStep {
        op: Step::Withdraw {
            caller: s("alice"),
            validator: s("validator"),
        },
        expect_error: true,
    });
    for _ in 0..config.delegation.cooldown_epochs {
        steps.extend(settle());
    }
    steps.push(
        Step::Withdraw {
            caller: s("alice"),
            validator: s("validator"),
        }
        .into(),
    );
    for delegator in ["alice", "bob"] {
        steps.push(
            Step::WithdrawRewards {
                caller: s(delegator),
                validator: s("validator"),
            }
            .into(),
        );
    }
    steps.push(
        Step::WithdrawValidatorRewards {
            caller: s("validator"),
        }
        .into(),
    );
    steps.push(Step::Snapshot.into());

    Scenario {
        name: "delegation-cycle".to_string(),
        steps,
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Scenario parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step {index} ({op}) failed: {source}")]
    StepFailed {
        index: usize,
        op: &'static str,
        #[source]
        source: RuntimeError,
    },

    #[error("Step {index} ({op}) was expected to fail")]
    UnexpectedSuccess { index: usize, op: &'static str },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}
