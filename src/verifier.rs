use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::VerificationConfig;
use crate::core::{DetectedPattern, GraphEdge, PatternVerificationResult};
use crate::oracle::rpc::RateLimiter;
use crate::oracle::{ChainBackend, ChainTransaction, OracleRegistry};

/// Why an edge did not verify.
#[derive(Debug, Clone, PartialEq)]
enum EdgeCheck {
    Verified,
    /// Chain contradicts the pattern.
    Mismatch(String),
    /// Not settled yet; neither confirms nor contradicts.
    Unconfirmed,
}

/// Checks patterns against the chain, bounded in time, concurrency and
/// request rate.
pub struct Verifier {
    oracles: OracleRegistry,
    permits: Arc<Semaphore>,
    limiter: RateLimiter,
    timeout: Duration,
    amount_tolerance: Decimal,
    timestamp_tolerance: i64,
}

impl Verifier {
    pub fn new(oracles: OracleRegistry, config: &VerificationConfig) -> Self {
        Self {
            oracles,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            limiter: RateLimiter::per_minute(config.requests_per_minute),
            timeout: Duration::from_secs(config.timeout_secs),
            amount_tolerance: Decimal::from_f64(config.amount_tolerance).unwrap_or(Decimal::ZERO),
            timestamp_tolerance: config.timestamp_tolerance_secs,
        }
    }

    /// Never fails: oracle trouble, unknown chains and timeouts all come
    /// back as an invalid or degraded result.
    pub async fn verify(&self, pattern_id: &str, pattern: &DetectedPattern) -> PatternVerificationResult {
        let total = pattern.transaction_graph.edges.len();
        let chain = pattern.chain_key();
        let Some(backend) = self.oracles.get(&chain) else {
            return PatternVerificationResult::failed(pattern_id, total, format!("no oracle backend for {chain}"));
        };

        // Budget and concurrency waits happen before the clock starts.
        self.limiter.acquire().await;
        let Ok(_permit) = self.permits.acquire().await else {
            return PatternVerificationResult::failed(pattern_id, total, "verifier shut down");
        };

        match tokio::time::timeout(self.timeout, self.check(pattern_id, pattern, backend.as_ref())).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pattern_id, backend = backend.name(), "Verification timed out");
                PatternVerificationResult::failed(
                    pattern_id,
                    total,
                    format!("verification timed out after {}s", self.timeout.as_secs_f64()),
                )
            }
        }
    }

    async fn check(&self, pattern_id: &str, pattern: &DetectedPattern, backend: &dyn ChainBackend) -> PatternVerificationResult {
        let graph = &pattern.transaction_graph;
        let mut errors = Vec::new();
        let mut suspicious_flags = Vec::new();
        let mut verified = 0;
        let mut contradicted = false;

        for edge in &graph.edges {
            match backend.transaction(&edge.transaction_hash).await {
                Ok(None) => {
                    errors.push(format!("transaction {} not found", edge.transaction_hash));
                    contradicted = true;
                }
                Ok(Some(tx)) => match self.compare(edge, &tx) {
                    EdgeCheck::Verified => verified += 1,
                    EdgeCheck::Mismatch(detail) => {
                        errors.push(format!("transaction {} details mismatch: {detail}", edge.transaction_hash));
                        contradicted = true;
                        if !tx.success {
                            suspicious_flags.push(format!("transaction {} failed on chain", edge.transaction_hash));
                        }
                    }
                    EdgeCheck::Unconfirmed => {
                        suspicious_flags.push(format!("transaction {} unconfirmed", edge.transaction_hash));
                    }
                },
                Err(e) => errors.push(format!("error verifying {}: {e}", edge.transaction_hash)),
            }
        }

        let addresses: BTreeSet<&str> = graph.addresses();
        let mut addresses_checked = 0;
        let mut addresses_failed = 0;
        let mut address_first_seen = BTreeMap::new();
        for address in addresses {
            match backend.address(address).await {
                Ok(Some(info)) => {
                    addresses_checked += 1;
                    if !info.exists {
                        addresses_failed += 1;
                        errors.push(format!("address {address} does not exist"));
                    }
                    if let Some(first_seen) = info.first_seen {
                        address_first_seen.insert(address.to_string(), first_seen);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    addresses_checked += 1;
                    addresses_failed += 1;
                    errors.push(format!("error verifying address {address}: {e}"));
                }
            }
        }

        let total = graph.edges.len();
        let mut confidence = if total == 0 { 0.0 } else { verified as f64 / total as f64 };
        if addresses_checked > 0 {
            confidence *= 1.0 - 0.5 * addresses_failed as f64 / addresses_checked as f64;
        }

        debug!(pattern_id, verified, total, addresses_failed, "Pattern verified");

        PatternVerificationResult {
            pattern_id: pattern_id.to_string(),
            is_valid: !contradicted && verified > 0,
            verification_timestamp: Utc::now(),
            transactions_verified: verified,
            total_transactions: total,
            addresses_checked,
            addresses_failed,
            confidence: confidence.clamp(0.0, 1.0),
            errors,
            suspicious_flags,
            address_first_seen,
        }
    }

    fn compare(&self, edge: &GraphEdge, tx: &ChainTransaction) -> EdgeCheck {
        if !tx.has_sender(&edge.from_address) {
            return EdgeCheck::Mismatch(format!("sender {} not among inputs", edge.from_address));
        }
        let amount_matches = tx
            .amounts_to(&edge.to_address)
            .any(|amount| (amount - edge.amount).abs() <= self.amount_tolerance);
        if !amount_matches {
            return EdgeCheck::Mismatch(format!("no transfer of {} to {}", edge.amount, edge.to_address));
        }
        let Some(timestamp) = tx.timestamp else {
            return EdgeCheck::Unconfirmed;
        };
        if (timestamp - edge.timestamp).abs() > self.timestamp_tolerance {
            return EdgeCheck::Mismatch(format!("timestamp off by {}s", (timestamp - edge.timestamp).abs()));
        }
        if !tx.success {
            return EdgeCheck::Mismatch("reverted".into());
        }
        EdgeCheck::Verified
    }
}
