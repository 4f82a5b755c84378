// Integration Tests
// End-to-end staking lifecycles through the transactional runtime

#[cfg(test)]
mod lifecycle_tests {
    use crate::consensus::{EpochError, SETTLEMENT_HISTORY};
    use crate::contracts::{DelegationError, PositionState, RegistryConfig, RegistryError};
    use crate::runtime::{Chain, ChainError, LocalChain, RuntimeError, StakingRuntime};
    use crate::types::{Address, Balance};

    // ===== HELPER FUNCTIONS =====

    const FUNDS: Balance = 1_000_000;

    fn account(name: &str) -> Address {
        Address::from_seed(name)
    }

    fn admin() -> Address {
        account("admin")
    }

    fn validator() -> Address {
        account("validator")
    }

    fn runtime_with(length: u64, first_length: u64, config: RegistryConfig) -> StakingRuntime {
        let mut chain = LocalChain::new();
        for name in ["admin", "validator", "alice", "bob"] {
            chain.mint(account(name), FUNDS).unwrap();
        }
        let mut rt = StakingRuntime::new(chain);
        rt.init_epochs(admin(), length, first_length).unwrap();
        rt.init_registry(admin(), config).unwrap();
        rt
    }

    fn runtime() -> StakingRuntime {
        runtime_with(10, 10, RegistryConfig::default())
    }

    /// Runtime with a registered validator and an open delegation ledger
    fn runtime_with_ledger() -> StakingRuntime {
        let mut rt = runtime();
        rt.register_validator(validator(), 100).unwrap();
        rt.init_delegation(validator(), validator(), 2, 10).unwrap();
        rt
    }

    /// Moves to the last block of the epoch, settles it, and enters the next one
    fn settle(rt: &mut StakingRuntime) {
        let last = rt.epoch_info().unwrap().last_height().unwrap();
        let height = rt.chain().height().max(last);
        rt.chain_mut().advance_to(height).unwrap();
        rt.step_eoe(admin(), 0, 0, 0, false).unwrap();
        rt.chain_mut().advance(1).unwrap();
    }

    fn total_supply(rt: &StakingRuntime) -> Balance {
        ["admin", "validator", "alice", "bob"]
            .iter()
            .map(|name| rt.balance(&account(name)))
            .sum::<Balance>()
            + rt.balance(&rt.vault())
    }

    // ===== SCENARIO A: EPOCH PROGRESSION =====

    #[test]
    fn test_epoch_progression() {
        let mut rt = runtime_with(10, 10_000, RegistryConfig::default());
        assert_eq!(rt.epoch().unwrap(), 1);

        let info = rt.epoch_info().unwrap();
        assert_eq!(info.start_height, 0);
        assert_eq!(info.length, 10_000);

        // Too early
        rt.chain_mut().advance_to(9_998).unwrap();
        let err = rt.step_eoe(admin(), 0, 0, 0, false).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Epoch(EpochError::EpochNotElapsed {
                height: 9_998,
                end: 9_999
            })
        );
        assert_eq!(rt.epoch().unwrap(), 1);

        rt.chain_mut().advance(1).unwrap();
        let record = rt.step_eoe(admin(), 7, 8, 9, true).unwrap();
        assert_eq!(record.epoch, 1);
        assert_eq!(record.trigger, admin());
        assert_eq!(rt.epoch().unwrap(), 2);

        // Later epochs use the regular length
        let info = rt.epoch_info().unwrap();
        assert_eq!(info.start_height, 10_000);
        assert_eq!(info.length, 10);
        assert_eq!(rt.registry().epoch(), 2);
    }

    #[test]
    fn test_epoch_count_follows_settlements() {
        let mut rt = runtime();
        for n in 1..=5u64 {
            settle(&mut rt);
            assert_eq!(rt.epoch().unwrap(), 1 + n);
        }
        assert_eq!(rt.settlements().len(), 5);
        assert_eq!(rt.settled_epochs(), 5);
    }

    #[test]
    fn test_init_epochs_twice() {
        let mut rt = runtime();
        let err = rt.init_epochs(admin(), 5, 5).unwrap_err();
        assert_eq!(err, RuntimeError::Epoch(EpochError::AlreadyInitialized));
    }

    // ===== SCENARIO B: VALIDATOR STAKE AND REWARD =====

    #[test]
    fn test_register_stake_reward() {
        let mut rt = runtime();
        let v = validator();

        rt.register_validator(v, 10).unwrap();
        rt.stake(v, 100).unwrap();
        assert_eq!(rt.get_state().validator(&v).unwrap().total_stake, 110);

        rt.reward(admin(), v, 1_000).unwrap();
        let snapshot = rt.get_state();
        assert_eq!(snapshot.validator(&v).unwrap().reward_pool, 1_000);
        assert_eq!(rt.balance(&rt.vault()), 1_110);
        assert_eq!(rt.balance(&admin()), FUNDS - 1_000);
    }

    #[test]
    fn test_register_twice() {
        let mut rt = runtime();
        rt.register_validator(validator(), 10).unwrap();

        let err = rt.register_validator(validator(), 10).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Registry(RegistryError::AlreadyRegistered(validator()))
        );
        assert_eq!(rt.balance(&validator()), FUNDS - 10);
    }

    #[test]
    fn test_register_below_minimum() {
        let mut rt = runtime();
        let err = rt.register_validator(validator(), 9).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Registry(RegistryError::InsufficientStake {
                minimum: 10,
                provided: 9
            })
        );
    }

    #[test]
    fn test_stake_unregistered() {
        let mut rt = runtime();
        let err = rt.stake(account("alice"), 50).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Registry(RegistryError::NotRegistered(account("alice")))
        );
    }

    #[test]
    fn test_queued_reward_for_unknown_validator() {
        let mut rt = runtime();
        let err = rt
            .add_reward(admin(), 0, account("nobody"), 100)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Epoch(EpochError::UnknownValidator(account("nobody")))
        );
        assert_eq!(rt.balance(&admin()), FUNDS);
    }

    #[test]
    fn test_queued_reward_outside_window() {
        let mut rt = runtime();
        rt.register_validator(validator(), 10).unwrap();

        let err = rt.add_reward(admin(), 10, validator(), 100).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Epoch(EpochError::InvalidHeight { height: 10, .. })
        ));
    }

    // ===== SCENARIO C: DELEGATION LIFECYCLE =====

    #[test]
    fn test_delegation_lifecycle() {
        let mut rt = runtime_with_ledger();
        let v = validator();
        let alice = account("alice");

        rt.delegate_stake(alice, v, 100).unwrap();
        settle(&mut rt);
        rt.delegate_stake(alice, v, 100).unwrap();
        settle(&mut rt);

        let ledger = rt.ledger(&v).unwrap();
        assert_eq!(ledger.position(&alice).unwrap().principal(), 200);
        assert_eq!(rt.get_state().validator(&v).unwrap().total_stake, 300);

        let request = rt.request_unstake_delegated_stakes(alice, v).unwrap();
        assert_eq!(request.amount, 200);
        assert_eq!(request.maturity_epoch, rt.epoch().unwrap() + 2);

        let err = rt.request_unstake_delegated_stakes(alice, v).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Delegation(DelegationError::UnstakeAlreadyRequested { .. })
        ));

        let err = rt.withdraw(alice, v).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Delegation(DelegationError::NotMatured { .. })
        ));

        settle(&mut rt);
        assert!(rt.withdraw(alice, v).is_err());
        settle(&mut rt);

        let before = rt.balance(&alice);
        assert_eq!(rt.withdraw(alice, v).unwrap(), 200);
        assert_eq!(rt.balance(&alice), before + 200);

        let position = rt.ledger(&v).unwrap().position(&alice).unwrap();
        assert_eq!(position.principal(), 0);
        assert_eq!(position.state(), PositionState::Withdrawn);
        assert_eq!(rt.get_state().validator(&v).unwrap().total_stake, 100);

        let err = rt.withdraw(alice, v).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Delegation(DelegationError::NothingStaked)
        );
        rt.verify_invariants().unwrap();
    }

    #[test]
    fn test_delegate_below_ledger_minimum() {
        let mut rt = runtime_with_ledger();
        let err = rt
            .delegate_stake(account("alice"), validator(), 9)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Delegation(DelegationError::BelowMinimum {
                minimum: 10,
                provided: 9
            })
        );
    }

    #[test]
    fn test_ledger_cooldown_bounded_by_registry() {
        let mut rt = runtime();
        rt.register_validator(validator(), 100).unwrap();

        let err = rt
            .init_delegation(validator(), validator(), 3, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Delegation(DelegationError::InvalidConfig(_))
        ));
        // The failed init left no ledger behind
        assert!(rt.ledger(&validator()).is_none());
    }

    #[test]
    fn test_ledger_minimum_bounded_by_registry() {
        let mut rt = runtime();
        rt.register_validator(validator(), 100).unwrap();

        // Registry minimum delegation is 10
        let err = rt
            .init_delegation(validator(), validator(), 2, 9)
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Delegation(DelegationError::InvalidConfig(_))
        ));
        assert!(rt.ledger(&validator()).is_none());

        rt.init_delegation(validator(), validator(), 2, 10).unwrap();
        assert_eq!(rt.ledger(&validator()).unwrap().config().unwrap().min_stake, 10);
    }

    // ===== REWARD DISTRIBUTION =====

    #[test]
    fn test_reward_queued_before_delegation_not_captured() {
        let mut rt = runtime_with_ledger();
        let v = validator();
        let alice = account("alice");

        // Validator stake becomes active in epoch 2
        settle(&mut rt);

        let height = rt.chain().height();
        rt.add_reward(admin(), height, v, 1_000).unwrap();
        rt.delegate_stake(alice, v, 100).unwrap();
        settle(&mut rt);

        assert_eq!(rt.pending_rewards(&v, &alice).unwrap(), 0);
        assert_eq!(rt.registry().pending_validator_rewards(&v).unwrap(), 1_000);

        // From now on alice earns pro rata
        rt.reward(admin(), v, 1_000).unwrap();
        assert_eq!(rt.pending_rewards(&v, &alice).unwrap(), 500);
        assert_eq!(rt.registry().pending_validator_rewards(&v).unwrap(), 1_500);

        assert_eq!(rt.request_withdraw_rewards(alice, v).unwrap(), 500);
        assert_eq!(rt.withdraw_validator_rewards(v).unwrap(), 1_500);
        assert_eq!(rt.get_state().validator(&v).unwrap().reward_pool, 0);
        rt.verify_invariants().unwrap();
    }

    #[test]
    fn test_commission_split() {
        let config = RegistryConfig {
            commission_bps: 1_000,
            activation_delay_epochs: 0,
            ..RegistryConfig::default()
        };
        let mut rt = runtime_with(10, 10, config);
        let v = validator();
        let alice = account("alice");
        rt.register_validator(v, 100).unwrap();
        rt.init_delegation(v, v, 2, 10).unwrap();
        rt.delegate_stake(alice, v, 300).unwrap();

        rt.reward(admin(), v, 1_000).unwrap();

        // 100 commission, 900 split 1:3
        assert_eq!(rt.pending_rewards(&v, &alice).unwrap(), 675);
        assert_eq!(rt.registry().pending_validator_rewards(&v).unwrap(), 325);
    }

    #[test]
    fn test_floor_remainder_stays_in_vault() {
        let config = RegistryConfig {
            activation_delay_epochs: 0,
            ..RegistryConfig::default()
        };
        let mut rt = runtime_with(10, 10, config);
        let v = validator();
        rt.register_validator(v, 100).unwrap();
        rt.init_delegation(v, v, 2, 10).unwrap();
        rt.delegate_stake(account("alice"), v, 100).unwrap();
        rt.delegate_stake(account("bob"), v, 100).unwrap();

        rt.reward(admin(), v, 10).unwrap();

        let alice_paid = rt.request_withdraw_rewards(account("alice"), v).unwrap();
        let bob_paid = rt.request_withdraw_rewards(account("bob"), v).unwrap();
        let validator_paid = rt.withdraw_validator_rewards(v).unwrap();
        assert_eq!((alice_paid, bob_paid, validator_paid), (3, 3, 3));
        assert_eq!(rt.get_state().validator(&v).unwrap().reward_pool, 1);
        rt.verify_invariants().unwrap();
    }

    #[test]
    fn test_withdraw_rewards_without_position() {
        let mut rt = runtime_with_ledger();
        let err = rt
            .request_withdraw_rewards(account("bob"), validator())
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Delegation(DelegationError::NothingStaked)
        );
    }

    // ===== ATOMICITY =====

    #[test]
    fn test_failed_delegation_rolls_back() {
        let mut rt = runtime_with_ledger();
        let poor = account("poor");
        rt.chain_mut().mint(poor, 50).unwrap();

        let before = rt.snapshot();
        let err = rt.delegate_stake(poor, validator(), 80).unwrap_err();

        assert_eq!(
            err,
            RuntimeError::Chain(ChainError::InsufficientBalance {
                account: poor,
                available: 50,
                required: 80
            })
        );
        assert_eq!(rt.snapshot(), before);
        assert!(rt.ledger(&validator()).unwrap().position(&poor).is_none());
        assert_eq!(rt.balance(&poor), 50);
    }

    #[test]
    fn test_failed_reward_rolls_back() {
        let mut rt = runtime();
        let poor = account("poor");
        rt.chain_mut().mint(poor, 5).unwrap();
        rt.register_validator(validator(), 100).unwrap();

        let before = rt.snapshot();
        assert!(rt.reward(poor, validator(), 500).is_err());
        assert_eq!(rt.snapshot(), before);
        assert_eq!(rt.get_state().validator(&validator()).unwrap().reward_pool, 0);
    }

    #[test]
    fn test_state_stable_without_mutation() {
        let mut rt = runtime_with_ledger();
        rt.delegate_stake(account("alice"), validator(), 100).unwrap();
        settle(&mut rt);

        assert_eq!(rt.get_state(), rt.get_state());
        assert_eq!(rt.ledger_state(&validator()), rt.ledger_state(&validator()));
        assert_eq!(rt.snapshot(), rt.snapshot());
    }

    #[test]
    fn test_supply_is_conserved() {
        let mut rt = runtime_with_ledger();
        let v = validator();
        let supply = total_supply(&rt);

        rt.delegate_stake(account("alice"), v, 400).unwrap();
        rt.delegate_stake(account("bob"), v, 250).unwrap();
        settle(&mut rt);
        let height = rt.chain().height();
        rt.add_reward(admin(), height, v, 777).unwrap();
        settle(&mut rt);
        rt.request_unstake_delegated_stakes(account("bob"), v).unwrap();
        settle(&mut rt);
        settle(&mut rt);
        rt.withdraw(account("bob"), v).unwrap();
        rt.request_withdraw_rewards(account("alice"), v).unwrap();
        rt.request_withdraw_rewards(account("bob"), v).unwrap();
        rt.withdraw_validator_rewards(v).unwrap();

        assert_eq!(total_supply(&rt), supply);
        rt.verify_invariants().unwrap();
    }

    // ===== LARGE AMOUNTS AND LONG RUNS =====

    #[test]
    fn test_eighteen_decimal_exit() {
        const E18: Balance = 1_000_000_000_000_000_000;
        let v = validator();
        let alice = account("alice");

        let mut chain = LocalChain::new();
        for name in ["admin", "validator", "alice"] {
            chain.mint(account(name), 10_000 * E18).unwrap();
        }
        let mut rt = StakingRuntime::new(chain);
        rt.init_epochs(admin(), 10, 10).unwrap();
        rt.init_registry(
            admin(),
            RegistryConfig {
                activation_delay_epochs: 0,
                ..RegistryConfig::default()
            },
        )
        .unwrap();
        rt.register_validator(v, 100 * E18).unwrap();
        rt.init_delegation(v, v, 2, 10).unwrap();

        rt.delegate_stake(alice, v, 1_000 * E18).unwrap();
        rt.reward(admin(), v, E18).unwrap();
        rt.request_unstake_delegated_stakes(alice, v).unwrap();
        settle(&mut rt);
        settle(&mut rt);

        assert_eq!(rt.withdraw(alice, v).unwrap(), 1_000 * E18);
        assert_eq!(
            rt.request_withdraw_rewards(alice, v).unwrap(),
            909_090_909_090_909_090
        );
        rt.delegate_stake(alice, v, 10 * E18).unwrap();
        assert_eq!(
            rt.withdraw_validator_rewards(v).unwrap(),
            90_909_090_909_090_909
        );

        assert_eq!(
            rt.balance(&alice),
            10_000 * E18 - 10 * E18 + 909_090_909_090_909_090
        );
        rt.verify_invariants().unwrap();
    }

    #[test]
    fn test_long_run_state_stays_bounded() {
        let mut rt = runtime_with_ledger();
        let v = validator();
        let alice = account("alice");
        rt.delegate_stake(alice, v, 100).unwrap();
        settle(&mut rt);

        let rounds = SETTLEMENT_HISTORY as u64 + 10;
        for _ in 0..rounds {
            let height = rt.chain().height();
            rt.add_reward(admin(), height, v, 10).unwrap();
            settle(&mut rt);
        }

        assert_eq!(rt.settled_epochs(), rounds + 1);
        assert_eq!(rt.settlements().len(), SETTLEMENT_HISTORY);

        // Validator and Alice hold 100 each
        assert_eq!(
            rt.request_withdraw_rewards(alice, v).unwrap(),
            5 * rounds as Balance
        );
        assert_eq!(
            rt.withdraw_validator_rewards(v).unwrap(),
            5 * rounds as Balance
        );

        let snapshot = rt.get_state();
        let record = snapshot.validator(&v).unwrap();
        assert_eq!(record.reward_events, rounds);
        assert_eq!(record.open_activations, 0);
        assert_eq!(record.reward_pool, 0);
        rt.verify_invariants().unwrap();
    }
}
