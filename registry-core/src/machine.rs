//! Registry state machine
//!
//! Pure planning of lifecycle transitions. Each `plan_*` function checks the
//! preconditions of one operation against a [`MembershipLedger`] and returns
//! the [`Transition`] it would cause: the event to emit and the token
//! transfers that must commit with it. Nothing here performs I/O; the
//! registry actor submits the transition and then folds the emitted event
//! back into the ledger.
//!
//! ```text
//!               register             withdraw              release
//! (none) ───────────────▶ Active ───────────────▶ WithdrawRequested ───────▶ Released
//!                            │                          │
//!                            │ slash                    │ slash (policy flag)
//!                            ▼                          ▼
//!                         Slashed ◀─────────────────────┘
//! ```

use crate::config::RegistryConfig;
use crate::economics;
use crate::membership::MembershipLedger;
use crate::types::{
    Address, IdentityCommitment, MemberRecord, MemberState, RegistryEvent, TokenAmount, Transfer,
    WithdrawPhase,
};
use crate::{Error, Result};

/// Effects of a transition (data, not side effects)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Event emitted on commit
    pub event: RegistryEvent,
    /// Transfers that commit atomically with the event
    pub transfers: Vec<Transfer>,
}

impl Transition {
    /// Net change of the bonded pool (positive on deposit)
    pub fn pool_delta(&self, registry_address: Address) -> Result<i128> {
        self.transfers.iter().try_fold(0i128, |acc, t| {
            let amount = i128::try_from(t.amount)
                .map_err(|_| Error::ArithmeticOverflow(format!("transfer of {}", t.amount)))?;
            let next = if t.to == registry_address {
                acc.checked_add(amount)
            } else if t.from == registry_address {
                acc.checked_sub(amount)
            } else {
                Some(acc)
            };
            next.ok_or_else(|| Error::ArithmeticOverflow("pool delta".to_string()))
        })
    }
}

/// Lifecycle rules for the registry
#[derive(Debug, Clone)]
pub struct RegistryStateMachine {
    config: RegistryConfig,
}

impl RegistryStateMachine {
    /// Create a state machine for a configuration
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Configuration in force
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Plan a registration
    pub fn plan_register(
        &self,
        ledger: &MembershipLedger,
        caller: Address,
        commitment: IdentityCommitment,
        message_limit: u64,
    ) -> Result<Transition> {
        if commitment.is_zero() {
            return Err(Error::InvalidCommitment("commitment must be non-zero".to_string()));
        }
        if message_limit == 0 || message_limit > self.config.max_message_limit {
            return Err(Error::InvalidQuota {
                limit: message_limit,
                max: self.config.max_message_limit,
            });
        }
        if let Some(existing) = ledger.get(&commitment) {
            if existing.state.is_bonded() {
                return Err(Error::DuplicateCommitment(commitment.to_string()));
            }
        }

        let index = ledger.next_index();
        if index >= self.config.capacity() {
            return Err(Error::RegistryFull(self.config.capacity()));
        }

        let deposit = economics::deposit(message_limit, self.config.minimal_deposit())?;

        Ok(Transition {
            event: RegistryEvent::MemberRegistered {
                index,
                commitment,
                message_limit,
                owner: caller,
            },
            transfers: vec![Transfer {
                from: caller,
                to: self.config.registry_address,
                amount: deposit,
            }],
        })
    }

    /// Plan a withdrawal request.
    ///
    /// `proof_accepted` is the verifier's verdict on the proof supplied with
    /// the request; it only matters when `caller` is not the owner.
    pub fn plan_withdraw(
        &self,
        ledger: &MembershipLedger,
        caller: Address,
        commitment: IdentityCommitment,
        now: u64,
        proof_accepted: bool,
    ) -> Result<Transition> {
        let record = find(ledger, &commitment)?;

        if record.owner != caller && !proof_accepted {
            return Err(Error::NotOwner {
                caller,
                commitment: commitment.to_string(),
            });
        }

        match record.state {
            MemberState::Active => {}
            MemberState::WithdrawRequested { .. } => {
                return Err(Error::AlreadyWithdrawing(commitment.to_string()))
            }
            other => return Err(wrong_state(&commitment, other)),
        }

        let freeze_until = now
            .checked_add(self.config.freeze_period_secs)
            .ok_or_else(|| Error::ArithmeticOverflow(format!("freeze end {} + period", now)))?;

        Ok(Transition {
            event: RegistryEvent::MemberWithdrawn {
                commitment,
                phase: WithdrawPhase::Requested { freeze_until },
            },
            transfers: Vec::new(),
        })
    }

    /// Plan a release; callable by anyone once the freeze period is over
    pub fn plan_release(
        &self,
        ledger: &MembershipLedger,
        commitment: IdentityCommitment,
        now: u64,
    ) -> Result<Transition> {
        let record = find(ledger, &commitment)?;

        let freeze_until = match record.state {
            MemberState::WithdrawRequested { freeze_until } => freeze_until,
            other => return Err(wrong_state(&commitment, other)),
        };
        if now < freeze_until {
            return Err(Error::ReleaseTooEarly { freeze_until, now });
        }

        Ok(Transition {
            event: RegistryEvent::MemberWithdrawn {
                commitment,
                phase: WithdrawPhase::Released {
                    owner: record.owner,
                    amount: record.deposit,
                },
            },
            transfers: vec![Transfer {
                from: self.config.registry_address,
                to: record.owner,
                amount: record.deposit,
            }],
        })
    }

    /// Check whether a member can be slashed at all, before spending a
    /// verifier call on the proof
    pub fn check_slashable(
        &self,
        ledger: &MembershipLedger,
        commitment: IdentityCommitment,
        receiver: Address,
    ) -> Result<()> {
        if receiver.is_zero() || receiver == self.config.registry_address {
            return Err(Error::InvalidReceiver(receiver));
        }

        let record = find(ledger, &commitment)?;
        match record.state {
            MemberState::Active => Ok(()),
            MemberState::WithdrawRequested { .. } if self.config.slash_during_withdraw_allowed => {
                Ok(())
            }
            other => Err(wrong_state(&commitment, other)),
        }
    }

    /// Plan a slash given the verifier's verdict on the violation proof
    pub fn plan_slash(
        &self,
        ledger: &MembershipLedger,
        commitment: IdentityCommitment,
        receiver: Address,
        proof_valid: bool,
    ) -> Result<Transition> {
        self.check_slashable(ledger, commitment, receiver)?;
        if !proof_valid {
            return Err(Error::InvalidProof(format!(
                "violation proof for {} rejected",
                commitment
            )));
        }

        let record = find(ledger, &commitment)?;
        let split = economics::fee_split(record.deposit, self.config.fee_percentage)?;

        let mut transfers = Vec::with_capacity(2);
        push_payout(&mut transfers, self.config.registry_address, self.config.fee_receiver, split.fee);
        push_payout(&mut transfers, self.config.registry_address, receiver, split.remainder);

        Ok(Transition {
            event: RegistryEvent::MemberSlashed {
                commitment,
                receiver,
                amount: split.remainder,
                fee: split.fee,
            },
            transfers,
        })
    }
}

fn find<'a>(ledger: &'a MembershipLedger, commitment: &IdentityCommitment) -> Result<&'a MemberRecord> {
    ledger
        .get(commitment)
        .ok_or_else(|| Error::NotFound(commitment.to_string()))
}

fn wrong_state(commitment: &IdentityCommitment, state: MemberState) -> Error {
    Error::WrongState {
        commitment: commitment.to_string(),
        state: state.name(),
    }
}

// Zero-amount transfers are left out of the transaction
fn push_payout(transfers: &mut Vec<Transfer>, from: Address, to: Address, amount: TokenAmount) {
    if amount > 0 {
        transfers.push(Transfer { from, to, amount });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldValue;
    use crate::types::LogEntry;
    use uuid::Uuid;

    fn config() -> RegistryConfig {
        RegistryConfig {
            minimal_deposit: 10,
            fee_percentage: 10,
            freeze_period_secs: 100,
            ..RegistryConfig::default()
        }
    }

    fn commit(ledger: &mut MembershipLedger, transition: &Transition, block: u64, timestamp: u64) {
        let entry = LogEntry {
            block_number: block,
            log_index: 0,
            block_timestamp: timestamp,
            tx_id: Uuid::now_v7(),
            event: transition.event.clone(),
        };
        ledger.apply(&entry).unwrap();
    }

    fn owner() -> Address {
        Address::from_low_u64(1)
    }

    fn registered_ledger(machine: &RegistryStateMachine) -> MembershipLedger {
        let mut ledger = MembershipLedger::new(10);
        let t = machine
            .plan_register(&ledger, owner(), FieldValue::from_u64(42), 2)
            .unwrap();
        commit(&mut ledger, &t, 1, 0);
        ledger
    }

    #[test]
    fn test_register_deposit_transfer() {
        let machine = RegistryStateMachine::new(config());
        let ledger = MembershipLedger::new(10);
        let t = machine
            .plan_register(&ledger, owner(), FieldValue::from_u64(42), 2)
            .unwrap();
        assert_eq!(
            t.transfers,
            vec![Transfer {
                from: owner(),
                to: machine.config().registry_address,
                amount: 20,
            }]
        );
        assert_eq!(t.pool_delta(machine.config().registry_address).unwrap(), 20);
    }

    #[test]
    fn test_register_validation() {
        let machine = RegistryStateMachine::new(config());
        let ledger = registered_ledger(&machine);

        assert!(matches!(
            machine.plan_register(&ledger, owner(), FieldValue::from_u64(7), 0),
            Err(Error::InvalidQuota { .. })
        ));
        assert!(matches!(
            machine.plan_register(&ledger, owner(), FieldValue::from_u64(7), 21),
            Err(Error::InvalidQuota { .. })
        ));
        assert!(matches!(
            machine.plan_register(&ledger, owner(), FieldValue::ZERO, 1),
            Err(Error::InvalidCommitment(_))
        ));
        assert!(matches!(
            machine.plan_register(&ledger, owner(), FieldValue::from_u64(42), 1),
            Err(Error::DuplicateCommitment(_))
        ));
    }

    #[test]
    fn test_registry_full() {
        let machine = RegistryStateMachine::new(RegistryConfig {
            tree_depth: 1,
            ..config()
        });
        let mut ledger = MembershipLedger::new(10);
        for i in 1..=2u64 {
            let t = machine
                .plan_register(&ledger, owner(), FieldValue::from_u64(i), 1)
                .unwrap();
            commit(&mut ledger, &t, i, 0);
        }
        assert!(matches!(
            machine.plan_register(&ledger, owner(), FieldValue::from_u64(3), 1),
            Err(Error::RegistryFull(2))
        ));
    }

    #[test]
    fn test_withdraw_ownership() {
        let machine = RegistryStateMachine::new(config());
        let ledger = registered_ledger(&machine);
        let stranger = Address::from_low_u64(99);

        assert!(matches!(
            machine.plan_withdraw(&ledger, stranger, FieldValue::from_u64(42), 0, false),
            Err(Error::NotOwner { .. })
        ));
        // A proof attesting eligibility stands in for ownership
        assert!(machine
            .plan_withdraw(&ledger, stranger, FieldValue::from_u64(42), 0, true)
            .is_ok());
        assert!(matches!(
            machine.plan_withdraw(&ledger, owner(), FieldValue::from_u64(1), 0, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_withdraw_then_release_timing() {
        let machine = RegistryStateMachine::new(config());
        let mut ledger = registered_ledger(&machine);
        let c = FieldValue::from_u64(42);

        let t = machine.plan_withdraw(&ledger, owner(), c, 50, false).unwrap();
        assert!(t.transfers.is_empty());
        commit(&mut ledger, &t, 2, 50);

        assert!(matches!(
            machine.plan_withdraw(&ledger, owner(), c, 60, false),
            Err(Error::AlreadyWithdrawing(_))
        ));

        let early = machine.plan_release(&ledger, c, 149).unwrap_err();
        assert_eq!(early.to_string(), "cannot release yet");

        let t = machine.plan_release(&ledger, c, 150).unwrap();
        assert_eq!(
            t.transfers,
            vec![Transfer {
                from: machine.config().registry_address,
                to: owner(),
                amount: 20,
            }]
        );
        commit(&mut ledger, &t, 3, 150);

        assert!(matches!(
            machine.plan_release(&ledger, c, 200),
            Err(Error::WrongState { .. })
        ));
    }

    #[test]
    fn test_release_requires_withdraw() {
        let machine = RegistryStateMachine::new(config());
        let ledger = registered_ledger(&machine);
        assert!(matches!(
            machine.plan_release(&ledger, FieldValue::from_u64(42), 1_000),
            Err(Error::WrongState { state: "Active", .. })
        ));
    }

    #[test]
    fn test_slash_split() {
        let machine = RegistryStateMachine::new(config());
        let ledger = registered_ledger(&machine);
        let receiver = Address::from_low_u64(5);

        let t = machine
            .plan_slash(&ledger, FieldValue::from_u64(42), receiver, true)
            .unwrap();
        assert_eq!(
            t.event,
            RegistryEvent::MemberSlashed {
                commitment: FieldValue::from_u64(42),
                receiver,
                amount: 18,
                fee: 2,
            }
        );
        assert_eq!(t.pool_delta(machine.config().registry_address).unwrap(), -20);
    }

    #[test]
    fn test_slash_rejections() {
        let machine = RegistryStateMachine::new(config());
        let ledger = registered_ledger(&machine);
        let c = FieldValue::from_u64(42);

        assert!(matches!(
            machine.plan_slash(&ledger, c, Address::from_low_u64(5), false),
            Err(Error::InvalidProof(_))
        ));
        assert!(matches!(
            machine.plan_slash(&ledger, c, Address::ZERO, true),
            Err(Error::InvalidReceiver(_))
        ));
        assert!(matches!(
            machine.plan_slash(&ledger, c, machine.config().registry_address, true),
            Err(Error::InvalidReceiver(_))
        ));
    }

    #[test]
    fn test_slash_during_withdraw_policy() {
        let strict = RegistryStateMachine::new(config());
        let lenient = RegistryStateMachine::new(RegistryConfig {
            slash_during_withdraw_allowed: true,
            ..config()
        });

        let mut ledger = registered_ledger(&strict);
        let c = FieldValue::from_u64(42);
        let t = strict.plan_withdraw(&ledger, owner(), c, 0, false).unwrap();
        commit(&mut ledger, &t, 2, 0);

        let receiver = Address::from_low_u64(5);
        assert!(matches!(
            strict.plan_slash(&ledger, c, receiver, true),
            Err(Error::WrongState {
                state: "WithdrawRequested",
                ..
            })
        ));
        assert!(lenient.plan_slash(&ledger, c, receiver, true).is_ok());
    }

    #[test]
    fn test_zero_fee_skips_transfer() {
        let machine = RegistryStateMachine::new(RegistryConfig {
            fee_percentage: 0,
            ..config()
        });
        let ledger = registered_ledger(&machine);
        let t = machine
            .plan_slash(&ledger, FieldValue::from_u64(42), Address::from_low_u64(5), true)
            .unwrap();
        assert_eq!(t.transfers.len(), 1);
        assert_eq!(t.transfers[0].amount, 20);
    }

    #[test]
    fn test_pool_delta_rejects_oversized_amount() {
        let registry = Address::from_low_u64(0x4e61);
        let t = Transition {
            event: RegistryEvent::MemberWithdrawn {
                commitment: FieldValue::from_u64(1),
                phase: WithdrawPhase::Requested { freeze_until: 0 },
            },
            transfers: vec![Transfer {
                from: Address::from_low_u64(1),
                to: registry,
                amount: u128::MAX,
            }],
        };
        assert!(matches!(
            t.pool_delta(registry),
            Err(Error::ArithmeticOverflow(_))
        ));
    }
}
