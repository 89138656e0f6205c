//! Byte encodings of transactions.
//!
//! Three encodings exist for every transaction and none of them may drift,
//! because the base chain recomputes all of them:
//!
//! - the **hash payload** (ABI words) that yields the transaction hash,
//! - the **signing message** the user's BLS signature covers,
//! - the **commitment calldata**, a compact fixed-width record with amount
//!   and fee squeezed into 16-bit decimals.

use primitive_types::{H256, U256};

use super::types::{Create2Transfer, MassMigration, Transaction, Transfer, TxType};
use crate::crypto::hash::{u256_word, AbiEncoder};
use crate::error::{CommanderError, CommanderResult, DecimalField};

pub const TRANSFER_CALLDATA_LEN: usize = 12;
pub const CREATE2TRANSFER_CALLDATA_LEN: usize = 16;
pub const MASS_MIGRATION_CALLDATA_LEN: usize = 8;
pub const MASS_MIGRATION_SIGNING_LEN: usize = 77;

const MAX_MANTISSA: u64 = 0xfff;
const MAX_EXPONENT: u16 = 15;

// ---------------------------------------------------------------------------
// Decimal
// ---------------------------------------------------------------------------

/// Pack `value` as `exponent << 12 | mantissa` with `value = m * 10^e`.
/// Returns `None` when the value has no such representation.
pub fn encode_decimal(value: &U256) -> Option<u16> {
    let ten = U256::from(10u8);
    let mut mantissa = *value;
    let mut exponent = 0u16;
    while exponent < MAX_EXPONENT && !mantissa.is_zero() && (mantissa % ten).is_zero() {
        mantissa = mantissa / ten;
        exponent += 1;
    }
    if mantissa > U256::from(MAX_MANTISSA) {
        return None;
    }
    Some((exponent << 12) | mantissa.low_u64() as u16)
}

pub fn decode_decimal(encoded: u16) -> U256 {
    let mantissa = U256::from(encoded & 0x0fff);
    let exponent = u32::from(encoded >> 12);
    mantissa * U256::exp10(exponent as usize)
}

pub fn is_decimal_encodable(value: &U256) -> bool {
    encode_decimal(value).is_some()
}

fn decimal(value: &U256, field: DecimalField) -> CommanderResult<u16> {
    encode_decimal(value).ok_or(CommanderError::NotDecimalEncodable(field))
}

// ---------------------------------------------------------------------------
// Hash payload
// ---------------------------------------------------------------------------

/// The transaction's canonical hash.
pub fn hash_transaction(tx: &Transaction) -> H256 {
    match tx {
        Transaction::Transfer(t) => hash_transfer(t),
        Transaction::Create2Transfer(t) => hash_create2transfer(t),
        Transaction::MassMigration(t) => hash_mass_migration(t),
    }
}

pub fn hash_transfer(tx: &Transfer) -> H256 {
    AbiEncoder::new()
        .u32(TxType::Transfer.as_u8().into())
        .u32(tx.base.from_state_id)
        .u32(tx.to_state_id)
        .u256(&tx.base.amount)
        .u256(&tx.base.fee)
        .u256(&tx.base.nonce)
        .hash()
}

pub fn hash_create2transfer(tx: &Create2Transfer) -> H256 {
    AbiEncoder::new()
        .u32(TxType::Create2Transfer.as_u8().into())
        .u32(tx.base.from_state_id)
        .h256(&tx.to_public_key.hash())
        .u256(&tx.base.amount)
        .u256(&tx.base.fee)
        .u256(&tx.base.nonce)
        .hash()
}

pub fn hash_mass_migration(tx: &MassMigration) -> H256 {
    AbiEncoder::new()
        .u32(TxType::MassMigration.as_u8().into())
        .u32(tx.base.from_state_id)
        .u256(&tx.base.amount)
        .u256(&tx.base.fee)
        .u32(tx.spoke_id)
        .u256(&tx.base.nonce)
        .hash()
}

// ---------------------------------------------------------------------------
// Signing message
// ---------------------------------------------------------------------------

/// Bytes covered by the sender's signature.
pub fn signing_message(tx: &Transaction) -> Vec<u8> {
    match tx {
        Transaction::Transfer(t) => AbiEncoder::new()
            .u32(TxType::Transfer.as_u8().into())
            .u32(t.base.from_state_id)
            .u32(t.to_state_id)
            .u256(&t.base.nonce)
            .u256(&t.base.amount)
            .u256(&t.base.fee)
            .into_bytes(),
        Transaction::Create2Transfer(t) => AbiEncoder::new()
            .u32(TxType::Create2Transfer.as_u8().into())
            .u32(t.base.from_state_id)
            .h256(&t.to_public_key.hash())
            .u256(&t.base.nonce)
            .u256(&t.base.amount)
            .u256(&t.base.fee)
            .into_bytes(),
        Transaction::MassMigration(t) => {
            let mut out = Vec::with_capacity(MASS_MIGRATION_SIGNING_LEN);
            out.push(TxType::MassMigration.as_u8());
            out.extend_from_slice(&t.base.from_state_id.to_be_bytes());
            out.extend_from_slice(&u256_word(&t.base.amount));
            out.extend_from_slice(&u256_word(&t.base.fee));
            // Admission rejects nonces above u32::MAX.
            out.extend_from_slice(&(t.base.nonce.low_u32()).to_be_bytes());
            out.extend_from_slice(&t.spoke_id.to_be_bytes());
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Commitment calldata
// ---------------------------------------------------------------------------

/// Compact record for commitment calldata.
///
/// Create2Transfers must already carry their destination state and pubkey
/// IDs; they are only known once the builder has applied the transaction.
pub fn encode_for_commitment(tx: &Transaction) -> CommanderResult<Vec<u8>> {
    let base = tx.base();
    let amount = decimal(&base.amount, DecimalField::Amount)?;
    let fee = decimal(&base.fee, DecimalField::Fee)?;

    let mut out = Vec::with_capacity(CREATE2TRANSFER_CALLDATA_LEN);
    out.extend_from_slice(&base.from_state_id.to_be_bytes());
    match tx {
        Transaction::Transfer(t) => {
            out.extend_from_slice(&t.to_state_id.to_be_bytes());
        }
        Transaction::Create2Transfer(t) => {
            let (to_state_id, to_pub_key_id) = t
                .to_state_id
                .zip(t.to_pub_key_id)
                .ok_or_else(|| CommanderError::Internal(format!("{:?} not applied", base.hash)))?;
            out.extend_from_slice(&to_state_id.to_be_bytes());
            out.extend_from_slice(&to_pub_key_id.to_be_bytes());
        }
        Transaction::MassMigration(_) => {}
    }
    out.extend_from_slice(&amount.to_be_bytes());
    out.extend_from_slice(&fee.to_be_bytes());
    Ok(out)
}

/// Concatenated calldata for a commitment's transactions.
pub fn serialize_for_commitment(txs: &[Transaction]) -> CommanderResult<Vec<u8>> {
    let mut out = Vec::new();
    for tx in txs {
        out.extend(encode_for_commitment(tx)?);
    }
    Ok(out)
}

/// A calldata record decoded back into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub from_state_id: u32,
    pub to_state_id: Option<u32>,
    pub to_pub_key_id: Option<u32>,
    pub amount: U256,
    pub fee: U256,
}

/// Split commitment calldata of the given type into records.
pub fn decode_commitment_calldata(
    tx_type: TxType,
    data: &[u8],
) -> CommanderResult<Vec<DecodedRecord>> {
    let width = match tx_type {
        TxType::Transfer => TRANSFER_CALLDATA_LEN,
        TxType::Create2Transfer => CREATE2TRANSFER_CALLDATA_LEN,
        TxType::MassMigration => MASS_MIGRATION_CALLDATA_LEN,
    };
    if data.len() % width != 0 {
        return Err(CommanderError::Internal(format!(
            "calldata length {} is not a multiple of {width}",
            data.len()
        )));
    }

    let u32_at = |chunk: &[u8], at: usize| {
        u32::from_be_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
    };
    let u16_at = |chunk: &[u8], at: usize| u16::from_be_bytes([chunk[at], chunk[at + 1]]);

    Ok(data
        .chunks_exact(width)
        .map(|chunk| {
            let (to_state_id, to_pub_key_id) = match tx_type {
                TxType::Transfer => (Some(u32_at(chunk, 4)), None),
                TxType::Create2Transfer => (Some(u32_at(chunk, 4)), Some(u32_at(chunk, 8))),
                TxType::MassMigration => (None, None),
            };
            DecodedRecord {
                from_state_id: u32_at(chunk, 0),
                to_state_id,
                to_pub_key_id,
                amount: decode_decimal(u16_at(chunk, width - 4)),
                fee: decode_decimal(u16_at(chunk, width - 2)),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
