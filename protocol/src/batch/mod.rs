//! # Batch Module
//!
//! Everything between a queued transaction and a batch on the base chain.
//!
//! ```text
//! types.rs      — Commitment, Batch, receipts
//! apply.rs      — per-transaction state transitions
//! builder.rs    — commitment selection and batch assembly
//! proofs.rs     — commitment and withdraw inclusion proofs
//! revert.rs     — dispute rollback
//! build_loop.rs — background build/submit task
//! ```

pub mod apply;
pub mod build_loop;
pub mod builder;
pub mod proofs;
pub mod revert;
pub mod types;

pub use build_loop::{BatchSubmitter, BuildLoop};
pub use builder::{BatchBuilder, BuildOutcome};
pub use proofs::{CommitmentBody, CommitmentProof, WithdrawProof};
pub use revert::RevertOutcome;
pub use types::{Batch, BatchStatus, Commitment, CommitmentId, FailedTx, MassMigrationMeta, TxReceipt};
