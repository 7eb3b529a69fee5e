use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{AddressInfo, ChainBackend, ChainTransaction};
use crate::error::OracleError;

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    addresses: Vec<FixtureAddress>,
    #[serde(default)]
    transactions: Vec<FixtureTransaction>,
}

#[derive(Debug, Deserialize)]
struct FixtureAddress {
    address: String,
    #[serde(default = "default_true")]
    exists: bool,
    /// Unix seconds.
    #[serde(default)]
    first_seen: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FixtureTransaction {
    hash: String,
    from: String,
    to: String,
    amount: Decimal,
    timestamp: i64,
    #[serde(default = "default_true")]
    success: bool,
}

fn default_true() -> bool {
    true
}

/// In-memory chain for offline replay and tests. Lookups are
/// case-insensitive; unknown entries do not exist.
#[derive(Default)]
pub struct FixtureBackend {
    addresses: HashMap<String, AddressInfo>,
    transactions: HashMap<String, ChainTransaction>,
    latency: Option<Duration>,
    /// Transactions whose lookups never answer.
    stalled: HashSet<String>,
}

impl FixtureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OracleError::Fixture(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, OracleError> {
        let file: FixtureFile =
            serde_json::from_str(contents).map_err(|e| OracleError::Fixture(e.to_string()))?;
        let mut backend = Self::new();
        for a in file.addresses {
            let first_seen = a.first_seen.and_then(|t| DateTime::from_timestamp(t, 0));
            backend = backend.with_address(&a.address, a.exists, first_seen);
        }
        for t in file.transactions {
            backend = backend.with_transaction(ChainTransaction {
                hash: t.hash,
                senders: vec![t.from],
                transfers: vec![(t.to, t.amount)],
                timestamp: Some(t.timestamp),
                success: t.success,
            });
        }
        Ok(backend)
    }

    pub fn with_address(
        mut self,
        address: &str,
        exists: bool,
        first_seen: Option<DateTime<Utc>>,
    ) -> Self {
        self.addresses
            .insert(address.to_ascii_lowercase(), AddressInfo { exists, first_seen });
        self
    }

    pub fn with_transaction(mut self, tx: ChainTransaction) -> Self {
        self.transactions.insert(tx.hash.to_ascii_lowercase(), tx);
        self
    }

    /// A chain on which every edge and node of `pattern` exists as stated.
    #[cfg(test)]
    pub fn mirror(pattern: &crate::core::DetectedPattern, first_seen: Option<DateTime<Utc>>) -> Self {
        let mut backend = Self::new();
        for node in &pattern.transaction_graph.nodes {
            backend = backend.with_address(&node.address, true, first_seen);
        }
        for edge in &pattern.transaction_graph.edges {
            backend = backend.with_transaction(ChainTransaction {
                hash: edge.transaction_hash.clone(),
                senders: vec![edge.from_address.clone()],
                transfers: vec![(edge.to_address.clone(), edge.amount)],
                timestamp: Some(edge.timestamp),
                success: true,
            });
        }
        backend
    }

    /// Delays every answer, to model a slow or unresponsive provider.
    #[cfg(test)]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes lookups of one transaction hang, leaving the rest of the chain
    /// responsive.
    #[cfg(test)]
    pub fn with_stalled_transaction(mut self, hash: &str) -> Self {
        self.stalled.insert(hash.to_ascii_lowercase());
        self
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChainBackend for FixtureBackend {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn address(&self, address: &str) -> Result<Option<AddressInfo>, OracleError> {
        self.delay().await;
        Ok(Some(
            self.addresses
                .get(&address.to_ascii_lowercase())
                .cloned()
                .unwrap_or(AddressInfo {
                    exists: false,
                    first_seen: None,
                }),
        ))
    }

    async fn transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, OracleError> {
        self.delay().await;
        let hash = hash.to_ascii_lowercase();
        if self.stalled.contains(&hash) {
            std::future::pending::<()>().await;
        }
        Ok(self.transactions.get(&hash).cloned())
    }
}
