//! Membership ledger: the projection of registry events
//!
//! The ledger is a pure fold over the ordered event log. [`MembershipLedger::apply`]
//! is the only way to change it, and it is used both when the registry
//! commits its own transactions and when the synchronizer replays the
//! confirmed log, so both paths produce identical state.
//!
//! # Invariants
//!
//! - Leaf indices are dense and assigned in log order
//! - `bonded_pool == Σ deposit` over members in a bonded state
//! - `total_deposited == bonded_pool + total_paid_out`
//! - The cursor only moves forward

use crate::codec::FieldValue;
use crate::economics;
use crate::types::{
    IdentityCommitment, LogEntry, LogPosition, MemberRecord, MemberState, RegistryEvent,
    TokenAmount, WithdrawPhase,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running token totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Bonds currently held
    pub bonded_pool: TokenAmount,
    /// Every deposit ever made
    pub total_deposited: TokenAmount,
    /// Every payout ever made (releases, slash receivers, slash fees)
    pub total_paid_out: TokenAmount,
    /// Portion of payouts that went to the fee receiver
    pub total_fees: TokenAmount,
}

/// Everything in the ledger except the member records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    /// Minimal deposit per unit of message limit
    pub minimal_deposit: TokenAmount,
    /// Leaf set; zero marks a freed slot
    pub leaves: Vec<IdentityCommitment>,
    /// Token totals
    pub totals: Totals,
    /// Position of the last applied entry
    pub cursor: Option<LogPosition>,
}

/// In-memory projection of registry members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipLedger {
    minimal_deposit: TokenAmount,
    members: BTreeMap<IdentityCommitment, MemberRecord>,
    leaves: Vec<IdentityCommitment>,
    totals: Totals,
    cursor: Option<LogPosition>,
}

impl MembershipLedger {
    /// Empty ledger
    pub fn new(minimal_deposit: TokenAmount) -> Self {
        Self {
            minimal_deposit,
            members: BTreeMap::new(),
            leaves: Vec::new(),
            totals: Totals::default(),
            cursor: None,
        }
    }

    /// Reassemble a ledger from persisted parts
    pub fn from_parts(meta: LedgerMeta, members: impl IntoIterator<Item = MemberRecord>) -> Self {
        Self {
            minimal_deposit: meta.minimal_deposit,
            members: members.into_iter().map(|m| (m.commitment, m)).collect(),
            leaves: meta.leaves,
            totals: meta.totals,
            cursor: meta.cursor,
        }
    }

    /// Metadata for persistence
    pub fn meta(&self) -> LedgerMeta {
        LedgerMeta {
            minimal_deposit: self.minimal_deposit,
            leaves: self.leaves.clone(),
            totals: self.totals,
            cursor: self.cursor,
        }
    }

    /// Apply one log entry.
    ///
    /// Either the whole entry is applied or the ledger is left untouched.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        let position = entry.position();
        if let Some(cursor) = self.cursor {
            if position <= cursor {
                return Err(Error::InvalidEvent(format!(
                    "entry {} at or before cursor {}",
                    position, cursor
                )));
            }
        }

        match &entry.event {
            RegistryEvent::MemberRegistered {
                index,
                commitment,
                message_limit,
                owner,
            } => {
                if commitment.is_zero() {
                    return Err(Error::InvalidEvent("registration of zero commitment".to_string()));
                }
                if *index != self.next_index() {
                    return Err(Error::InvalidEvent(format!(
                        "index gap: expected {}, got {}",
                        self.next_index(),
                        index
                    )));
                }
                if let Some(existing) = self.members.get(commitment) {
                    if existing.state.is_bonded() {
                        return Err(Error::InvalidEvent(format!(
                            "{} registered while {}",
                            commitment,
                            existing.state.name()
                        )));
                    }
                }

                let deposit = economics::deposit(*message_limit, self.minimal_deposit)?;
                let bonded_pool = checked_add(self.totals.bonded_pool, deposit, "bonded pool")?;
                let total_deposited =
                    checked_add(self.totals.total_deposited, deposit, "total deposited")?;

                self.members.insert(
                    *commitment,
                    MemberRecord {
                        commitment: *commitment,
                        owner: *owner,
                        message_limit: *message_limit,
                        index: *index,
                        deposit,
                        state: MemberState::Active,
                    },
                );
                self.leaves.push(*commitment);
                self.totals.bonded_pool = bonded_pool;
                self.totals.total_deposited = total_deposited;
            }

            RegistryEvent::MemberWithdrawn {
                commitment,
                phase: WithdrawPhase::Requested { freeze_until },
            } => {
                let record = self
                    .members
                    .get_mut(commitment)
                    .ok_or_else(|| unknown_member(commitment))?;
                if record.state != MemberState::Active {
                    return Err(Error::InvalidEvent(format!(
                        "withdraw request for {} while {}",
                        commitment,
                        record.state.name()
                    )));
                }
                record.state = MemberState::WithdrawRequested {
                    freeze_until: *freeze_until,
                };
            }

            RegistryEvent::MemberWithdrawn {
                commitment,
                phase: WithdrawPhase::Released { owner, amount },
            } => {
                let record = self
                    .members
                    .get_mut(commitment)
                    .ok_or_else(|| unknown_member(commitment))?;
                let freeze_until = match record.state {
                    MemberState::WithdrawRequested { freeze_until } => freeze_until,
                    other => {
                        return Err(Error::InvalidEvent(format!(
                            "release of {} while {}",
                            commitment,
                            other.name()
                        )))
                    }
                };
                if entry.block_timestamp < freeze_until {
                    return Err(Error::InvalidEvent(format!(
                        "release of {} at {} before freeze end {}",
                        commitment, entry.block_timestamp, freeze_until
                    )));
                }
                if *owner != record.owner || *amount != record.deposit {
                    return Err(Error::InvalidEvent(format!(
                        "release of {} pays {} to {}, expected {} to {}",
                        commitment, amount, owner, record.deposit, record.owner
                    )));
                }

                let bonded_pool = checked_sub(self.totals.bonded_pool, record.deposit)?;
                let total_paid_out =
                    checked_add(self.totals.total_paid_out, record.deposit, "total paid out")?;

                record.state = MemberState::Released;
                free_leaf(&mut self.leaves, record.index);
                self.totals.bonded_pool = bonded_pool;
                self.totals.total_paid_out = total_paid_out;
            }

            RegistryEvent::MemberSlashed {
                commitment,
                amount,
                fee,
                ..
            } => {
                let record = self
                    .members
                    .get_mut(commitment)
                    .ok_or_else(|| unknown_member(commitment))?;
                if !record.state.is_bonded() {
                    return Err(Error::InvalidEvent(format!(
                        "slash of {} while {}",
                        commitment,
                        record.state.name()
                    )));
                }
                if checked_add(*amount, *fee, "slash payout")? != record.deposit {
                    return Err(Error::InvalidEvent(format!(
                        "slash of {} pays {} + {}, deposit is {}",
                        commitment, amount, fee, record.deposit
                    )));
                }

                let bonded_pool = checked_sub(self.totals.bonded_pool, record.deposit)?;
                let total_paid_out =
                    checked_add(self.totals.total_paid_out, record.deposit, "total paid out")?;
                let total_fees = checked_add(self.totals.total_fees, *fee, "total fees")?;

                record.state = MemberState::Slashed;
                free_leaf(&mut self.leaves, record.index);
                self.totals.bonded_pool = bonded_pool;
                self.totals.total_paid_out = total_paid_out;
                self.totals.total_fees = total_fees;
            }
        }

        self.cursor = Some(position);
        Ok(())
    }

    /// Record for a commitment, if any
    pub fn get(&self, commitment: &IdentityCommitment) -> Option<&MemberRecord> {
        self.members.get(commitment)
    }

    /// Record for a commitment, or `NotFound`
    pub fn get_user(&self, commitment: &IdentityCommitment) -> Result<MemberRecord> {
        self.members
            .get(commitment)
            .cloned()
            .ok_or_else(|| Error::NotFound(commitment.to_string()))
    }

    /// All records, ordered by commitment
    pub fn members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    /// Number of members in `Active`
    pub fn active_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Active)
            .count()
    }

    /// Index the next registration receives
    pub fn next_index(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Leaf set; freed slots hold zero
    pub fn leaves(&self) -> &[IdentityCommitment] {
        &self.leaves
    }

    /// Minimal deposit this ledger was built with
    pub fn minimal_deposit(&self) -> TokenAmount {
        self.minimal_deposit
    }

    /// Token totals
    pub fn totals(&self) -> Totals {
        self.totals
    }

    /// Bonds currently held
    pub fn bonded_pool(&self) -> TokenAmount {
        self.totals.bonded_pool
    }

    /// Position of the last applied entry
    pub fn cursor(&self) -> Option<LogPosition> {
        self.cursor
    }

    /// Recompute the pool from the records and check both conservation equations
    pub fn check_conservation(&self) -> Result<()> {
        let mut bonded: TokenAmount = 0;
        for record in self.members.values().filter(|m| m.state.is_bonded()) {
            bonded = checked_add(bonded, record.deposit, "bonded sum")?;
        }

        if bonded != self.totals.bonded_pool {
            return Err(Error::InvariantViolation(format!(
                "bonded pool {} != sum of bonded deposits {}",
                self.totals.bonded_pool, bonded
            )));
        }

        let accounted = checked_add(self.totals.bonded_pool, self.totals.total_paid_out, "accounted")?;
        if accounted != self.totals.total_deposited {
            return Err(Error::InvariantViolation(format!(
                "pool {} + paid out {} != deposited {}",
                self.totals.bonded_pool, self.totals.total_paid_out, self.totals.total_deposited
            )));
        }

        Ok(())
    }
}

fn unknown_member(commitment: &IdentityCommitment) -> Error {
    Error::InvalidEvent(format!("event for unknown member {}", commitment))
}

fn free_leaf(leaves: &mut [IdentityCommitment], index: u64) {
    if let Some(leaf) = leaves.get_mut(index as usize) {
        *leaf = FieldValue::ZERO;
    }
}

fn checked_add(a: TokenAmount, b: TokenAmount, what: &str) -> Result<TokenAmount> {
    a.checked_add(b)
        .ok_or_else(|| Error::ArithmeticOverflow(format!("{}: {} + {}", what, a, b)))
}

fn checked_sub(pool: TokenAmount, amount: TokenAmount) -> Result<TokenAmount> {
    pool.checked_sub(amount).ok_or_else(|| {
        Error::InvariantViolation(format!("bonded pool {} below payout {}", pool, amount))
    })
}
