//! Core type definitions for rollup transactions.
//!
//! Every transaction is one of three closed variants of [`Transaction`].
//! Code that consumes transactions matches on the enum, so a new variant
//! cannot be added without revisiting each consumer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, Signature};
use crate::error::{CommanderError, CommanderResult};

// ---------------------------------------------------------------------------
// TxType
// ---------------------------------------------------------------------------

/// Wire discriminant, shared with the rollup contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    Transfer = 1,
    Create2Transfer = 3,
    MassMigration = 5,
}

impl TxType {
    /// The order in which the batch builder tries transaction types.
    pub const BUILD_ORDER: [TxType; 3] = [
        TxType::Transfer,
        TxType::Create2Transfer,
        TxType::MassMigration,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "TRANSFER"),
            Self::Create2Transfer => write!(f, "CREATE2TRANSFER"),
            Self::MassMigration => write!(f, "MASS_MIGRATION"),
        }
    }
}

impl FromStr for TxType {
    type Err = CommanderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRANSFER" => Ok(Self::Transfer),
            "CREATE2TRANSFER" => Ok(Self::Create2Transfer),
            "MASS_MIGRATION" | "MASSMIGRATION" => Ok(Self::MassMigration),
            _ => Err(CommanderError::UnsupportedType(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Fields common to every transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBase {
    pub hash: H256,
    pub from_state_id: u32,
    pub amount: U256,
    pub fee: U256,
    pub nonce: U256,
    pub signature: Signature,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub base: TxBase,
    pub to_state_id: u32,
}

/// Transfer to a public key. The destination state (and, if needed, the
/// account) is created by the batch builder, which fills in the two IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Create2Transfer {
    pub base: TxBase,
    pub to_public_key: PublicKey,
    pub to_state_id: Option<u32>,
    pub to_pub_key_id: Option<u32>,
}

/// Withdrawal of funds to a spoke on the base chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassMigration {
    pub base: TxBase,
    pub spoke_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Transfer(Transfer),
    Create2Transfer(Create2Transfer),
    MassMigration(MassMigration),
}

impl Transaction {
    pub fn base(&self) -> &TxBase {
        match self {
            Self::Transfer(tx) => &tx.base,
            Self::Create2Transfer(tx) => &tx.base,
            Self::MassMigration(tx) => &tx.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut TxBase {
        match self {
            Self::Transfer(tx) => &mut tx.base,
            Self::Create2Transfer(tx) => &mut tx.base,
            Self::MassMigration(tx) => &mut tx.base,
        }
    }

    pub fn tx_type(&self) -> TxType {
        match self {
            Self::Transfer(_) => TxType::Transfer,
            Self::Create2Transfer(_) => TxType::Create2Transfer,
            Self::MassMigration(_) => TxType::MassMigration,
        }
    }

    pub fn hash(&self) -> H256 {
        self.base().hash
    }

    pub fn from_state_id(&self) -> u32 {
        self.base().from_state_id
    }

    pub fn nonce(&self) -> U256 {
        self.base().nonce
    }

    /// `amount + fee`, the sender's total debit.
    pub fn total_cost(&self) -> CommanderResult<U256> {
        let base = self.base();
        base.amount
            .checked_add(base.fee)
            .ok_or(CommanderError::BalanceOverflow)
    }
}

impl From<Transfer> for Transaction {
    fn from(tx: Transfer) -> Self {
        Self::Transfer(tx)
    }
}

impl From<Create2Transfer> for Transaction {
    fn from(tx: Create2Transfer) -> Self {
        Self::Create2Transfer(tx)
    }
}

impl From<MassMigration> for Transaction {
    fn from(tx: MassMigration) -> Self {
        Self::MassMigration(tx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
