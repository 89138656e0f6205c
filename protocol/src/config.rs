//! # Commander Configuration & Constants
//!
//! Every tunable of the commander lives here, with its default. The node
//! binary loads a [`CommanderConfig`] from a JSON file (or takes the
//! defaults) and lets a handful of CLI flags override it.
//!
//! Batch sizing values are shared with the rollup contracts: a commitment
//! with more transactions than the contract accepts is simply reverted on
//! chain, so keep `max_txs_per_commitment` in sync with the deployment.

use std::fs;
use std::path::Path;
use std::time::Duration;

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{PublicKey, SigningDomain};
use crate::transaction::ValidationConfig;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Commitments below this size wait for more transactions, unless the
/// oldest queued transaction has waited `max_txn_delay`.
pub const DEFAULT_MIN_TXS_PER_COMMITMENT: usize = 1;

/// Hard cap per commitment. 32 matches the reference rollup contracts.
pub const DEFAULT_MAX_TXS_PER_COMMITMENT: usize = 32;

pub const DEFAULT_MIN_COMMITMENTS_PER_BATCH: usize = 1;

pub const DEFAULT_MAX_COMMITMENTS_PER_BATCH: usize = 32;

/// How long a queued transaction may wait before it forces a smaller
/// commitment.
pub const DEFAULT_MAX_TXN_DELAY: Duration = Duration::from_secs(30);

/// Sleep between build cycles.
pub const DEFAULT_BATCH_LOOP_INTERVAL: Duration = Duration::from_millis(500);

pub const DEFAULT_API_PORT: u16 = 8080;

pub const DEFAULT_METRICS_PORT: u16 = 9100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Rollup
// ---------------------------------------------------------------------------

/// Batch building and admission parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollupConfig {
    pub min_txs_per_commitment: usize,
    pub max_txs_per_commitment: usize,
    pub min_commitments_per_batch: usize,
    pub max_commitments_per_batch: usize,
    #[serde(rename = "maxTxnDelayMs")]
    pub max_txn_delay_ms: u64,
    #[serde(rename = "batchLoopIntervalMs")]
    pub batch_loop_interval_ms: u64,
    /// Owner of the state leaves that collect commitment fees.
    #[serde(rename = "feeReceiverPubKeyID")]
    pub fee_receiver_pub_key_id: u32,
    pub min_fee: U256,
    /// Skip signature checks. Never enable outside tests and bootstrap.
    pub disable_signatures: bool,
    pub signing_domain: SigningDomain,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            min_txs_per_commitment: DEFAULT_MIN_TXS_PER_COMMITMENT,
            max_txs_per_commitment: DEFAULT_MAX_TXS_PER_COMMITMENT,
            min_commitments_per_batch: DEFAULT_MIN_COMMITMENTS_PER_BATCH,
            max_commitments_per_batch: DEFAULT_MAX_COMMITMENTS_PER_BATCH,
            max_txn_delay_ms: DEFAULT_MAX_TXN_DELAY.as_millis() as u64,
            batch_loop_interval_ms: DEFAULT_BATCH_LOOP_INTERVAL.as_millis() as u64,
            fee_receiver_pub_key_id: 0,
            min_fee: U256::zero(),
            disable_signatures: false,
            signing_domain: SigningDomain(H256::zero()),
        }
    }
}

impl RollupConfig {
    pub fn max_txn_delay(&self) -> Duration {
        Duration::from_millis(self.max_txn_delay_ms)
    }

    pub fn batch_loop_interval(&self) -> Duration {
        Duration::from_millis(self.batch_loop_interval_ms)
    }

    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            min_fee: self.min_fee,
            disable_signatures: self.disable_signatures,
            signing_domain: self.signing_domain,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_txs_per_commitment == 0 || self.min_commitments_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "minimum commitment and batch sizes must be at least 1".into(),
            ));
        }
        if self.min_txs_per_commitment > self.max_txs_per_commitment {
            return Err(ConfigError::Invalid(format!(
                "minTxsPerCommitment {} exceeds maxTxsPerCommitment {}",
                self.min_txs_per_commitment, self.max_txs_per_commitment
            )));
        }
        if self.min_commitments_per_batch > self.max_commitments_per_batch {
            return Err(ConfigError::Invalid(format!(
                "minCommitmentsPerBatch {} exceeds maxCommitmentsPerBatch {}",
                self.min_commitments_per_batch, self.max_commitments_per_batch
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub port: u16,
    pub metrics_port: u16,
    /// Value of the `Auth-Key` header required by admin methods. Admin
    /// methods are refused outright when unset.
    pub auth_key: Option<String>,
    /// Attach internal error descriptions to `Unknown` errors.
    pub debug_errors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_API_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            auth_key: None,
            debug_errors: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// An account funded when the commander starts on an empty database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAccount {
    pub public_key: PublicKey,
    #[serde(default)]
    pub token_id: U256,
    pub balance: U256,
}

// ---------------------------------------------------------------------------
// CommanderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommanderConfig {
    pub rollup: RollupConfig,
    pub api: ApiConfig,
    pub genesis: Vec<GenesisAccount>,
    /// Start with batch creation paused and sending disabled.
    pub migration: bool,
}

impl CommanderConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.rollup.validate()?;
        Ok(config)
    }
}
