//! Core types for the registry
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (unsigned integers for token amounts)
//! - A log entry layout that orders by `(block_number, log_index)`

use crate::codec::FieldValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Token amount in the token's smallest unit
pub type TokenAmount = u128;

/// Identity commitment of a member
pub type IdentityCommitment = FieldValue;

/// 20-byte account address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    /// The zero address
    pub const ZERO: Address = Address([0u8; 20]);

    /// Create from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Address whose low 8 bytes hold `value`
    pub fn from_low_u64(value: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this is the zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Parse `0x`-prefixed hex (40 digits)
    pub fn from_hex(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let decoded =
            hex::decode(digits).map_err(|e| Error::Config(format!("bad address {}: {}", s, e)))?;
        let bytes: [u8; 20] = decoded
            .try_into()
            .map_err(|_| Error::Config(format!("address {} is not 20 bytes", s)))?;
        Ok(Self(bytes))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Lifecycle state of a member
///
/// `Unregistered` has no variant: an unknown commitment has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Bonded and in good standing
    Active,
    /// Withdrawal requested; bond still held until `freeze_until`
    WithdrawRequested {
        /// Block timestamp from which release is allowed
        freeze_until: u64,
    },
    /// Bond returned to the owner (terminal)
    Released,
    /// Bond seized and redistributed (terminal)
    Slashed,
}

impl MemberState {
    /// Terminal states free the slot and allow re-registration
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemberState::Released | MemberState::Slashed)
    }

    /// Whether the registry still holds this member's bond
    pub fn is_bonded(&self) -> bool {
        !self.is_terminal()
    }

    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            MemberState::Active => "Active",
            MemberState::WithdrawRequested { .. } => "WithdrawRequested",
            MemberState::Released => "Released",
            MemberState::Slashed => "Slashed",
        }
    }
}

/// Member record (derived from events)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Identity commitment
    pub commitment: IdentityCommitment,

    /// Account that registered and receives the bond back
    pub owner: Address,

    /// Message quota per epoch
    pub message_limit: u64,

    /// Leaf index in the membership tree
    pub index: u64,

    /// Bond held for this member
    pub deposit: TokenAmount,

    /// Lifecycle state
    pub state: MemberState,
}

/// Name of a registry event as it appears in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventName {
    /// A member was admitted
    MemberRegistered = 1,
    /// A member requested or completed withdrawal
    MemberWithdrawn = 2,
    /// A member was slashed
    MemberSlashed = 3,
}

impl EventName {
    /// Event name string
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::MemberRegistered => "MemberRegistered",
            EventName::MemberWithdrawn => "MemberWithdrawn",
            EventName::MemberSlashed => "MemberSlashed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the two-step withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawPhase {
    /// Withdrawal requested, freeze period started
    Requested {
        /// Block timestamp from which release is allowed
        freeze_until: u64,
    },
    /// Freeze elapsed and the bond went back to the owner
    Released {
        /// Owner credited
        owner: Address,
        /// Amount returned
        amount: TokenAmount,
    },
}

/// Registry event (state transition)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// Member admitted at `index`
    MemberRegistered {
        /// Assigned leaf index
        index: u64,
        /// Identity commitment
        commitment: IdentityCommitment,
        /// Message quota
        message_limit: u64,
        /// Registering account
        owner: Address,
    },

    /// Withdrawal requested or released
    MemberWithdrawn {
        /// Identity commitment
        commitment: IdentityCommitment,
        /// Which half of the withdrawal this is
        phase: WithdrawPhase,
    },

    /// Member slashed
    MemberSlashed {
        /// Identity commitment
        commitment: IdentityCommitment,
        /// Account receiving the remainder
        receiver: Address,
        /// Amount paid to `receiver`
        amount: TokenAmount,
        /// Amount paid to the fee receiver
        fee: TokenAmount,
    },
}

impl RegistryEvent {
    /// Event name
    pub fn name(&self) -> EventName {
        match self {
            RegistryEvent::MemberRegistered { .. } => EventName::MemberRegistered,
            RegistryEvent::MemberWithdrawn { .. } => EventName::MemberWithdrawn,
            RegistryEvent::MemberSlashed { .. } => EventName::MemberSlashed,
        }
    }

    /// Commitment the event is about
    pub fn commitment(&self) -> IdentityCommitment {
        match self {
            RegistryEvent::MemberRegistered { commitment, .. }
            | RegistryEvent::MemberWithdrawn { commitment, .. }
            | RegistryEvent::MemberSlashed { commitment, .. } => *commitment,
        }
    }
}

/// Position of a log entry in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// Block number
    pub block_number: u64,
    /// Index of the log within its block
    pub log_index: u32,
}

impl LogPosition {
    /// Storage key (big-endian so byte order matches log order)
    pub fn to_key(&self) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&self.block_number.to_be_bytes());
        key[8..].copy_from_slice(&self.log_index.to_be_bytes());
        key
    }

    /// Parse a storage key
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 12 {
            return None;
        }
        let block_number = u64::from_be_bytes(key[..8].try_into().ok()?);
        let log_index = u32::from_be_bytes(key[8..].try_into().ok()?);
        Some(Self {
            block_number,
            log_index,
        })
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Event log entry as delivered by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Block containing the transaction
    pub block_number: u64,

    /// Index of the log within its block
    pub log_index: u32,

    /// Timestamp of the block (seconds)
    pub block_timestamp: u64,

    /// Transaction that emitted the event
    pub tx_id: Uuid,

    /// The event
    pub event: RegistryEvent,
}

impl LogEntry {
    /// Ordering key
    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    /// Event name
    pub fn name(&self) -> EventName {
        self.event.name()
    }

    /// Build the entry a receipt describes
    pub fn from_receipt(receipt: &Receipt, event: RegistryEvent) -> Result<Self> {
        let log_index = receipt.log_index.ok_or_else(|| {
            Error::InvariantViolation(format!("receipt for {} carries no log", receipt.tx_id))
        })?;
        Ok(Self {
            block_number: receipt.block_number,
            log_index,
            block_timestamp: receipt.block_timestamp,
            tx_id: receipt.tx_id,
            event,
        })
    }
}

/// Header of a mined block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height
    pub number: u64,
    /// Block timestamp (seconds)
    pub timestamp: u64,
    /// Hash of this block
    pub hash: [u8; 32],
    /// Hash of the parent block
    pub parent_hash: [u8; 32],
}

/// Inclusive block range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// First block (inclusive)
    pub from_block: u64,
    /// Last block (inclusive)
    pub to_block: u64,
}

impl BlockRange {
    /// Whether the range contains `block`
    pub fn contains(&self, block: u64) -> bool {
        block >= self.from_block && block <= self.to_block
    }
}

/// Token movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Debited account
    pub from: Address,
    /// Credited account
    pub to: Address,
    /// Amount
    pub amount: TokenAmount,
}

/// State-changing transaction submitted to the ledger
///
/// Transfers and the event commit together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Idempotency key (UUIDv7)
    pub tx_id: Uuid,

    /// Token moved by `transfers`
    pub token: Address,

    /// Account executing the transfers; debits from anyone else spend allowance
    pub spender: Address,

    /// Token transfers
    pub transfers: Vec<Transfer>,

    /// Event emitted by the transaction
    pub event: Option<RegistryEvent>,
}

/// Transaction receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction ID
    pub tx_id: Uuid,
    /// Block that included the transaction
    pub block_number: u64,
    /// Timestamp of that block
    pub block_timestamp: u64,
    /// Log index of the emitted event, if any
    pub log_index: Option<u32>,
    /// Transaction hash
    pub tx_hash: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex() {
        let address = Address::from_low_u64(0xabcd);
        let text = address.to_string();
        assert_eq!(text, "0x000000000000000000000000000000000000abcd");
        assert_eq!(text.parse::<Address>().unwrap(), address);
        assert!(Address::from_hex("0x1234").is_err());
    }

    #[test]
    fn test_member_state_terminal() {
        assert!(!MemberState::Active.is_terminal());
        assert!(!MemberState::WithdrawRequested { freeze_until: 1 }.is_terminal());
        assert!(MemberState::Released.is_terminal());
        assert!(MemberState::Slashed.is_terminal());
    }

    #[test]
    fn test_log_position_key_order() {
        let a = LogPosition {
            block_number: 1,
            log_index: 7,
        };
        let b = LogPosition {
            block_number: 2,
            log_index: 0,
        };
        assert!(a < b);
        assert!(a.to_key() < b.to_key());
        assert_eq!(LogPosition::from_key(&b.to_key()), Some(b));
    }

    #[test]
    fn test_event_names() {
        let event = RegistryEvent::MemberWithdrawn {
            commitment: FieldValue::from_u64(1),
            phase: WithdrawPhase::Requested { freeze_until: 10 },
        };
        assert_eq!(event.name().as_str(), "MemberWithdrawn");
        assert_eq!(event.commitment(), FieldValue::from_u64(1));
    }
}
