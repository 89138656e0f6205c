// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Rollup Commander — Core Library
//!
//! The off-chain half of an optimistic rollup. Users send signed transfers
//! here; the commander validates them, queues them, packs them into
//! commitments and batches for the base chain, and rolls its own state back
//! when the chain says a batch was fraudulent.
//!
//! ## Architecture
//!
//! - **crypto** — keccak hashing and BLS signatures. Don't roll your own.
//! - **merkle** — sparse Merkle trees over storage, plus the small
//!   in-memory tree used for batch hashes and withdraw roots.
//! - **storage** — sled-backed state tree, account tree, batches.
//! - **transaction** — the transaction enum, encodings, admission checks.
//! - **mempool** — queued transactions and the pending-state projection.
//! - **batch** — commitment building, proofs, revert, the build loop.
//! - **commander** — the facade transports call.
//! - **config** — tunables and their defaults.
//! - **error** — the error taxonomy and its public codes.
//!
//! ## Ground rules
//!
//! 1. The trees are the only source of truth. Everything else is derived
//!    from them or describes how they got where they are.
//! 2. Every mutation happens inside one write transaction; it commits as a
//!    whole or not at all.
//! 3. Given the same queue, every node builds the same batch, bit for bit.

pub mod batch;
pub mod commander;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod storage;
pub mod transaction;

pub use commander::Commander;
pub use error::{CommanderError, CommanderResult};
