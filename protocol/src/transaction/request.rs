//! Incoming transaction payloads.
//!
//! Clients send a flat JSON object whose `type` selects the variant. Every
//! field is optional on the wire so that a missing one can be reported by
//! name instead of as a generic parse failure.

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use super::encoding::hash_transaction;
use super::types::{Create2Transfer, MassMigration, Transaction, Transfer, TxBase, TxType};
use crate::crypto::{PublicKey, Signature};
use crate::error::{CommanderError, CommanderResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    #[serde(rename = "fromStateID")]
    pub from_state_id: Option<u32>,
    #[serde(rename = "toStateID")]
    pub to_state_id: Option<u32>,
    pub to_public_key: Option<PublicKey>,
    #[serde(rename = "spokeID")]
    pub spoke_id: Option<u32>,
    pub amount: Option<U256>,
    pub fee: Option<U256>,
    pub nonce: Option<U256>,
    pub signature: Option<Signature>,
}

fn required<T>(field: Option<T>, name: &'static str) -> CommanderResult<T> {
    field.ok_or(CommanderError::MissingField(name))
}

impl TransactionRequest {
    /// Convert into a typed transaction with its hash computed. Fields are
    /// checked in wire order and the first missing one is reported.
    pub fn into_transaction(self, received_at: DateTime<Utc>) -> CommanderResult<Transaction> {
        let tx_type: TxType = required(self.tx_type, "type")?.parse()?;
        let from_state_id = required(self.from_state_id, "fromStateID")?;

        enum Target {
            State(u32),
            Key(PublicKey),
            Spoke(u32),
        }
        let target = match tx_type {
            TxType::Transfer => Target::State(required(self.to_state_id, "toStateID")?),
            TxType::Create2Transfer => Target::Key(required(self.to_public_key, "toPublicKey")?),
            TxType::MassMigration => Target::Spoke(required(self.spoke_id, "spokeID")?),
        };

        let base = TxBase {
            hash: Default::default(),
            from_state_id,
            amount: required(self.amount, "amount")?,
            fee: required(self.fee, "fee")?,
            nonce: required(self.nonce, "nonce")?,
            signature: required(self.signature, "signature")?,
            received_at,
        };

        let mut tx = match target {
            Target::State(to_state_id) => Transaction::Transfer(Transfer { base, to_state_id }),
            Target::Key(to_public_key) => Transaction::Create2Transfer(Create2Transfer {
                base,
                to_public_key,
                to_state_id: None,
                to_pub_key_id: None,
            }),
            Target::Spoke(spoke_id) => Transaction::MassMigration(MassMigration { base, spoke_id }),
        };
        tx.base_mut().hash = hash_transaction(&tx);
        Ok(tx)
    }
}

impl From<&Transaction> for TransactionRequest {
    fn from(tx: &Transaction) -> Self {
        let base = tx.base();
        let mut request = Self {
            tx_type: Some(tx.tx_type().to_string()),
            from_state_id: Some(base.from_state_id),
            amount: Some(base.amount),
            fee: Some(base.fee),
            nonce: Some(base.nonce),
            signature: Some(base.signature),
            ..Self::default()
        };
        match tx {
            Transaction::Transfer(t) => request.to_state_id = Some(t.to_state_id),
            Transaction::Create2Transfer(t) => request.to_public_key = Some(t.to_public_key),
            Transaction::MassMigration(t) => request.spoke_id = Some(t.spoke_id),
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionBuilder;

    fn transfer_json() -> serde_json::Value {
        serde_json::json!({
            "type": "TRANSFER",
            "fromStateID": 0,
            "toStateID": 1,
            "amount": "0x32",
            "fee": "0xa",
            "nonce": "0x0",
            "signature": format!("0x{}", "00".repeat(48)),
        })
    }

    #[test]
    fn parses_a_complete_transfer() {
        let request: TransactionRequest = serde_json::from_value(transfer_json()).unwrap();
        let at = Utc::now();
        let tx = request.into_transaction(at).unwrap();

        let expected = TransactionBuilder::transfer(0, 1)
            .amount(50)
            .fee(10)
            .nonce(0)
            .received_at(at)
            .build();
        assert_eq!(tx, expected);
    }

    #[test]
    fn reports_first_missing_field() {
        let mut json = transfer_json();
        json.as_object_mut().unwrap().remove("toStateID");
        json.as_object_mut().unwrap().remove("fee");
        let request: TransactionRequest = serde_json::from_value(json).unwrap();
        let err = request.into_transaction(Utc::now()).unwrap_err();
        assert!(matches!(err, CommanderError::MissingField("toStateID")));
    }

    #[test]
    fn rejects_unknown_type() {
        let request = TransactionRequest {
            tx_type: Some("DEPOSIT".into()),
            ..Default::default()
        };
        let err = request.into_transaction(Utc::now()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::UnsupportedType);
    }

    #[test]
    fn mass_migration_requires_spoke() {
        let request = TransactionRequest {
            tx_type: Some("MASS_MIGRATION".into()),
            from_state_id: Some(2),
            ..Default::default()
        };
        let err = request.into_transaction(Utc::now()).unwrap_err();
        assert!(matches!(err, CommanderError::MissingField("spokeID")));
    }

    #[test]
    fn request_round_trips_through_transaction() {
        let tx = TransactionBuilder::mass_migration(3, 1)
            .amount(90)
            .fee(10)
            .nonce(2)
            .build();
        let request = TransactionRequest::from(&tx);
        let rebuilt = request.into_transaction(tx.base().received_at).unwrap();
        assert_eq!(rebuilt, tx);
    }
}
