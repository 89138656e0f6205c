//! # Prometheus Metrics
//!
//! Commander metrics, scraped at `/metrics` on the metrics port. They live
//! in a dedicated [`prometheus::Registry`] with the `rollup` prefix.
//!
//! The commander keeps its own counters; a background task copies them in
//! with [`NodeMetrics::observe`] on a fixed interval.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use rollup_protocol::commander::CommanderStats;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub batches_created_total: IntCounter,
    pub commitments_created_total: IntCounter,
    pub transactions_included_total: IntCounter,
    pub transactions_failed_total: IntCounter,
    pub reverts_total: IntCounter,
    /// Transactions queued in the mempool.
    pub mempool_size: IntGauge,
    /// 1 while the commander is in migration mode.
    pub migration_mode: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Raise `counter` to `target`. Counters never go down.
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

impl NodeMetrics {
    /// Create and register every metric. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("rollup".into()), None)?;

        Ok(Self {
            batches_created_total: counter(
                &registry,
                "batches_created_total",
                "Total number of batches built",
            )?,
            commitments_created_total: counter(
                &registry,
                "commitments_created_total",
                "Total number of commitments built",
            )?,
            transactions_included_total: counter(
                &registry,
                "transactions_included_total",
                "Total number of transactions included in batches",
            )?,
            transactions_failed_total: counter(
                &registry,
                "transactions_failed_total",
                "Total number of queued transactions dropped while applying",
            )?,
            reverts_total: counter(&registry, "reverts_total", "Total number of batch reverts")?,
            mempool_size: gauge(&registry, "mempool_size", "Transactions waiting in the mempool")?,
            migration_mode: gauge(&registry, "migration_mode", "1 while migration mode is on")?,
            registry,
        })
    }

    /// Copy a snapshot of the commander's state into the metrics.
    pub fn observe(&self, stats: &CommanderStats, mempool_size: usize, migrating: bool) {
        advance(&self.batches_created_total, stats.batches_created);
        advance(&self.commitments_created_total, stats.commitments_created);
        advance(&self.transactions_included_total, stats.txs_included);
        advance(&self.transactions_failed_total, stats.txs_failed);
        advance(&self.reverts_total, stats.reverts);
        self.mempool_size.set(mempool_size as i64);
        self.migration_mode.set(i64::from(migrating));
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
