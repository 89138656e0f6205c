//! # Transaction Module
//!
//! Construction, encoding and admission checks for rollup transactions.
//! Every transfer, create-and-transfer and mass migration is one variant of
//! [`Transaction`].
//!
//! ## Architecture
//!
//! ```text
//! types.rs        — the Transaction enum, its variants and TxType
//! builder.rs      — fluent TransactionBuilder plus signing helpers
//! encoding.rs     — hash payload, signing message, calldata, decimals
//! request.rs      — wire payload with optional fields
//! verification.rs — ordered admission checks against storage
//! ```
//!
//! ## Transaction Lifecycle
//!
//! 1. **Submit** — a [`TransactionRequest`] arrives and is converted,
//!    naming the first missing field.
//! 2. **Validate** — [`validate`] runs against canonical state plus the
//!    sender's queued transactions.
//! 3. **Queue** — the mempool keeps it until a commitment includes it.
//! 4. **Include** — the batch builder applies it and leaves a receipt.

pub mod builder;
pub mod encoding;
pub mod request;
pub mod types;
pub mod verification;

pub use builder::{sign_transaction, TransactionBuilder};
pub use encoding::{encode_decimal, hash_transaction, signing_message};
pub use request::TransactionRequest;
pub use types::{Create2Transfer, MassMigration, Transaction, Transfer, TxBase, TxType};
pub use verification::{validate, ValidationConfig};
