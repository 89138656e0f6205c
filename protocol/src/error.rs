//! # Error Taxonomy
//!
//! One error enum for the whole commander, [`CommanderError`], plus the
//! table that turns each variant into a stable numeric code for API
//! clients.
//!
//! The code table is an ordinary `match` over the taxonomy, so adding a
//! variant without deciding its public code is a compile error, and two
//! variants can share a code only if someone wrote that down on purpose.
//! Anything that is not a user-facing failure (storage, serialization,
//! broken invariants) collapses to [`ErrorCode::Unknown`]; its details only
//! reach the client when the API runs in debug mode.

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::CommitmentId;
use crate::crypto::SignatureError;
use crate::storage::db::StorageError;

/// Which field of a transaction failed decimal encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalField {
    Amount,
    Fee,
}

/// What could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// A leaf that was never set in the named tree.
    Leaf { tree: &'static str, index: u32 },
    Batch(u64),
    Commitment(CommitmentId),
    Transaction(H256),
    PendingTransaction { state_id: u32, nonce: U256 },
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf { tree, index } => write!(f, "{tree} leaf {index}"),
            Self::Batch(id) => write!(f, "batch {id}"),
            Self::Commitment(id) => write!(f, "commitment {id}"),
            Self::Transaction(hash) => write!(f, "transaction {hash:?}"),
            Self::PendingTransaction { state_id, nonce } => {
                write!(f, "pending transaction {state_id}/{nonce}")
            }
        }
    }
}

/// Every failure the commander can report.
#[derive(Debug, Error)]
pub enum CommanderError {
    // -- admission --------------------------------------------------------
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unsupported transaction type: {0}")]
    UnsupportedType(String),

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("fee {got} below minimum {min}")]
    FeeTooLow { min: U256, got: U256 },

    #[error("{0:?} is not decimal encodable")]
    NotDecimalEncodable(DecimalField),

    #[error("sender state {0} does not exist")]
    NonexistentSender(u32),

    #[error("receiver state {0} does not exist")]
    NonexistentReceiver(u32),

    #[error("transfer to the same state id")]
    TransferToSelf,

    #[error("nonce too low: expected {expected}, got {got}")]
    NonceTooLow { expected: U256, got: U256 },

    #[error("nonce too high: expected {expected}, got {got}")]
    NonceTooHigh { expected: U256, got: U256 },

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: U256, available: U256 },

    #[error("spoke {0} does not exist")]
    SpokeDoesNotExist(u32),

    #[error("destination key already owns state {state_id} for this token")]
    DestinationStateExists { state_id: u32 },

    #[error("invalid signature: {0}")]
    InvalidSignature(SignatureError),

    #[error("a different transaction is already pending for state {state_id} nonce {nonce}")]
    PendingTransaction { state_id: u32, nonce: U256 },

    #[error("sending transactions is disabled while in migration mode")]
    SendingDisabled,

    // -- trees ------------------------------------------------------------
    #[error("not found: {0}")]
    NotFound(NotFound),

    #[error("pubkey id {0} is outside the account tree's left subtree")]
    InvalidPubKeyId(u32),

    #[error("account {0} already exists")]
    AccountAlreadyExists(u32),

    #[error("no vacant subtree left in the account tree")]
    NoVacantSubtree,

    #[error("state tree cannot be reverted to root {0:?}")]
    NonexistentState(H256),

    // -- execution --------------------------------------------------------
    #[error("token mismatch between sender and receiver")]
    TokenMismatch,

    #[error("balance overflow")]
    BalanceOverflow,

    // -- proofs -----------------------------------------------------------
    #[error("batch {0} is not a mass migration batch")]
    NotMassMigrationBatch(u64),

    #[error("mass migration {0:?} not found in commitment")]
    MassMigrationNotInCommitment(H256),

    #[error("withdraw proof could not be calculated: {0}")]
    WithdrawProofUnavailable(String),

    // -- access -----------------------------------------------------------
    #[error("unauthorized")]
    Unauthorized,

    // -- infrastructure ---------------------------------------------------
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("crypto: {0}")]
    Crypto(#[from] SignatureError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type CommanderResult<T> = Result<T, CommanderError>;

impl CommanderError {
    pub fn leaf_not_found(tree: &'static str, index: u32) -> Self {
        Self::NotFound(NotFound::Leaf { tree, index })
    }

    /// Stable public code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingField(_) => ErrorCode::MissingField,
            Self::UnsupportedType(_) => ErrorCode::UnsupportedType,
            Self::InvalidAmount => ErrorCode::InvalidAmount,
            Self::FeeTooLow { .. } => ErrorCode::FeeTooLow,
            Self::NotDecimalEncodable(DecimalField::Amount) => ErrorCode::AmountNotDecimalEncodable,
            Self::NotDecimalEncodable(DecimalField::Fee) => ErrorCode::FeeNotDecimalEncodable,
            Self::NonexistentSender(_) => ErrorCode::NonexistentSender,
            Self::NonexistentReceiver(_) => ErrorCode::NonexistentReceiver,
            Self::TransferToSelf => ErrorCode::TransferToSelf,
            Self::NonceTooLow { .. } => ErrorCode::NonceTooLow,
            Self::NonceTooHigh { .. } => ErrorCode::NonceTooHigh,
            Self::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            Self::SpokeDoesNotExist(_) => ErrorCode::SpokeDoesNotExist,
            Self::DestinationStateExists { .. } => ErrorCode::DestinationStateExists,
            Self::InvalidSignature(_) => ErrorCode::InvalidSignature,
            Self::PendingTransaction { .. } => ErrorCode::PendingTransaction,
            Self::SendingDisabled => ErrorCode::SendingDisabled,
            Self::NotFound(what) => match what {
                NotFound::Leaf { tree: "state", .. } => ErrorCode::UserStateNotFound,
                NotFound::Batch(_) => ErrorCode::BatchNotFound,
                NotFound::Commitment(_) => ErrorCode::CommitmentNotFound,
                NotFound::Transaction(_) => ErrorCode::TransactionNotFound,
                _ => ErrorCode::NotFound,
            },
            Self::InvalidPubKeyId(_) => ErrorCode::InvalidPubKeyId,
            Self::AccountAlreadyExists(_) => ErrorCode::AccountAlreadyExists,
            Self::NoVacantSubtree => ErrorCode::NoVacantSubtree,
            Self::NotMassMigrationBatch(_) => ErrorCode::OnlyMassMigrationBatches,
            Self::MassMigrationNotInCommitment(_) => ErrorCode::MassMigrationNotInCommitment,
            Self::WithdrawProofUnavailable(_) => ErrorCode::WithdrawProofUnavailable,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::NonexistentState(_)
            | Self::TokenMismatch
            | Self::BalanceOverflow
            | Self::Storage(_)
            | Self::Crypto(_)
            | Self::Internal(_) => ErrorCode::Unknown,
        }
    }
}

impl From<NotFound> for CommanderError {
    fn from(what: NotFound) -> Self {
        Self::NotFound(what)
    }
}

// ---------------------------------------------------------------------------
// Public error codes
// ---------------------------------------------------------------------------

/// Numeric codes exposed to API clients. Values never change once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    MissingField = 10002,
    TransferToSelf = 10003,
    NonceTooLow = 10004,
    NonceTooHigh = 10005,
    InsufficientBalance = 10006,
    InvalidAmount = 10007,
    FeeTooLow = 10008,
    InvalidSignature = 10009,
    AmountNotDecimalEncodable = 10010,
    FeeNotDecimalEncodable = 10011,
    NonexistentSender = 10012,
    NonexistentReceiver = 10013,
    PendingTransaction = 10015,
    SpokeDoesNotExist = 10016,
    SendingDisabled = 10017,
    DestinationStateExists = 10018,
    UnsupportedType = 10019,
    CommitmentNotFound = 20000,
    BatchNotFound = 20001,
    TransactionNotFound = 20002,
    Unauthorized = 40001,
    WithdrawProofUnavailable = 50005,
    OnlyMassMigrationBatches = 50006,
    MassMigrationNotInCommitment = 50007,
    UserStateNotFound = 99003,
    NotFound = 99004,
    NoVacantSubtree = 99005,
    AccountAlreadyExists = 99006,
    InvalidPubKeyId = 99007,
    Unknown = 99999,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Client-facing message. Deliberately independent of the internal
    /// error text, which may carry state the client should not see.
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingField => "some field is missing, verify the transaction format",
            Self::TransferToSelf => "transfer to the same state id",
            Self::NonceTooLow => "nonce too low",
            Self::NonceTooHigh => "nonce too high",
            Self::InsufficientBalance => "not enough balance",
            Self::InvalidAmount => "amount must be positive",
            Self::FeeTooLow => "fee too low",
            Self::InvalidSignature => "invalid signature",
            Self::AmountNotDecimalEncodable => "amount is not encodable as multi-precision decimal",
            Self::FeeNotDecimalEncodable => "fee is not encodable as multi-precision decimal",
            Self::NonexistentSender => "sender state ID does not exist",
            Self::NonexistentReceiver => "receiver state ID does not exist",
            Self::PendingTransaction => "transaction already exists",
            Self::SpokeDoesNotExist => "spoke with given ID does not exist",
            Self::SendingDisabled => "rollup is migrating, sending transactions is disabled",
            Self::DestinationStateExists => "destination public key already has a state for this token",
            Self::UnsupportedType => "unsupported transaction type",
            Self::CommitmentNotFound => "commitment not found",
            Self::BatchNotFound => "batch not found",
            Self::TransactionNotFound => "transaction not found",
            Self::Unauthorized => "missing or invalid authentication key",
            Self::WithdrawProofUnavailable => "withdraw proof could not be calculated for a given batch",
            Self::OnlyMassMigrationBatches => {
                "invalid batch type, only mass migration batches are supported"
            }
            Self::MassMigrationNotInCommitment => {
                "mass migration with given transaction hash was not found in a given commitment"
            }
            Self::UserStateNotFound => "user state not found",
            Self::NotFound => "not found",
            Self::NoVacantSubtree => "no vacant subtree",
            Self::AccountAlreadyExists => "account already exists",
            Self::InvalidPubKeyId => "invalid pubkey id",
            Self::Unknown => "an error occurred",
        }
    }
}

/// Error payload sent to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ApiError {
    /// Sanitize an internal error for a client. The internal description is
    /// attached as `data` only for `Unknown` errors and only in debug mode.
    pub fn sanitize(err: &CommanderError, debug: bool) -> Self {
        let code = err.code();
        let data = (debug && code == ErrorCode::Unknown).then(|| err.to_string());
        Self {
            code: code.as_u32(),
            message: code.message().to_string(),
            data,
        }
    }
}

impl From<ErrorCode> for ApiError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code: code.as_u32(),
            message: code.message().to_string(),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
