//! Verification oracle: read-only access to blockchain state, one backend
//! per chain.

pub mod bitcoin;
pub mod evm;
pub mod fixture;
pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{BackendKind, OracleConfig};
use crate::error::OracleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub exists: bool,
    /// First on-chain activity, if the backend can tell.
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
}

/// A confirmed or pending transaction as the chain reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    /// Spending addresses (several for UTXO chains).
    pub senders: Vec<String>,
    /// (recipient, amount) per output or transfer.
    pub transfers: Vec<(String, Decimal)>,
    /// Block time; `None` while unconfirmed.
    pub timestamp: Option<i64>,
    pub success: bool,
}

impl ChainTransaction {
    pub fn has_sender(&self, address: &str) -> bool {
        self.senders.iter().any(|s| s.eq_ignore_ascii_case(address))
    }

    /// Amounts sent to `address`.
    pub fn amounts_to<'a>(&'a self, address: &'a str) -> impl Iterator<Item = Decimal> + 'a {
        self.transfers
            .iter()
            .filter(move |(to, _)| to.eq_ignore_ascii_case(address))
            .map(|(_, amount)| *amount)
    }
}

/// Capability set every chain backend exposes.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the backend cannot answer for this address format.
    async fn address(&self, address: &str) -> Result<Option<AddressInfo>, OracleError>;

    /// `Ok(None)` when the transaction does not exist.
    async fn transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, OracleError>;
}

/// Backends keyed by lowercased blockchain id.
#[derive(Default, Clone)]
pub struct OracleRegistry {
    backends: HashMap<String, Arc<dyn ChainBackend>>,
}

impl OracleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let mut registry = Self::new();
        for chain in &config.chains {
            let backend: Arc<dyn ChainBackend> = match chain.kind {
                BackendKind::Bitcoin => Arc::new(bitcoin::BitcoinBackend::new(rpc_client(chain)?)),
                BackendKind::Evm => Arc::new(evm::EvmBackend::new(rpc_client(chain)?)),
                BackendKind::Fixture => {
                    let path = chain.fixture_path.as_deref().ok_or_else(|| {
                        OracleError::Fixture(format!("{}: fixture_path is required", chain.blockchain))
                    })?;
                    Arc::new(fixture::FixtureBackend::load(path)?)
                }
            };
            info!(blockchain = %chain.blockchain, backend = backend.name(), "Oracle backend registered");
            registry.register(&chain.blockchain, backend);
        }
        Ok(registry)
    }

    pub fn register(&mut self, blockchain: &str, backend: Arc<dyn ChainBackend>) {
        self.backends.insert(blockchain.trim().to_ascii_lowercase(), backend);
    }

    pub fn get(&self, blockchain: &str) -> Option<Arc<dyn ChainBackend>> {
        self.backends.get(&blockchain.trim().to_ascii_lowercase()).cloned()
    }

    pub fn chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.backends.keys().cloned().collect();
        chains.sort();
        chains
    }
}

fn rpc_client(chain: &crate::config::ChainConfig) -> Result<rpc::JsonRpcClient, OracleError> {
    let url = chain
        .rpc_url
        .as_deref()
        .ok_or_else(|| OracleError::Decode(format!("{}: rpc_url is required", chain.blockchain)))?;
    Ok(rpc::JsonRpcClient::new(
        url,
        chain.rpc_user.as_deref(),
        chain.rpc_password.as_deref(),
        chain.requests_per_second,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;

    #[test]
    fn registry_is_case_insensitive() {
        let mut registry = OracleRegistry::new();
        registry.register("Ethereum", Arc::new(fixture::FixtureBackend::default()));
        assert!(registry.get("ETHEREUM ").is_some());
        assert!(registry.get("bitcoin").is_none());
        assert_eq!(registry.chains(), vec!["ethereum".to_string()]);
    }

    #[test]
    fn config_requires_rpc_url() {
        let config = OracleConfig {
            chains: vec![ChainConfig {
                blockchain: "bitcoin".into(),
                kind: BackendKind::Bitcoin,
                rpc_url: None,
                rpc_user: None,
                rpc_password: None,
                fixture_path: None,
                requests_per_second: 5,
            }],
        };
        assert!(OracleRegistry::from_config(&config).is_err());
    }

    #[test]
    fn transaction_lookups_ignore_case() {
        let tx = ChainTransaction {
            hash: "0x1".into(),
            senders: vec!["0xABC".into()],
            transfers: vec![("0xDef".into(), Decimal::ONE), ("0xdef".into(), Decimal::TWO)],
            timestamp: Some(0),
            success: true,
        };
        assert!(tx.has_sender("0xabc"));
        assert_eq!(tx.amounts_to("0xDEF").count(), 2);
    }
}
