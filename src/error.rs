use thiserror::Error;

/// Input-shape errors. Patterns failing these never reach classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngressError {
    #[error("graph has {count} nodes (limit {limit})")]
    TooManyNodes { count: usize, limit: usize },

    #[error("graph has {count} edges (limit {limit})")]
    TooManyEdges { count: usize, limit: usize },

    #[error("pattern must have at least one node")]
    NoNodes,

    #[error("pattern must have at least one edge")]
    NoEdges,

    #[error("blockchain must be specified")]
    MissingBlockchain,

    #[error("asset symbol must be specified")]
    MissingAssetSymbol,

    #[error("duplicate node address {0}")]
    DuplicateNode(String),

    #[error("edge {transaction_hash} references unknown address {address}")]
    UnknownEndpoint {
        transaction_hash: String,
        address: String,
    },
}

impl IngressError {
    /// Size violations are rejected before any other inspection.
    pub fn is_oversized(&self) -> bool {
        matches!(self, IngressError::TooManyNodes { .. } | IngressError::TooManyEdges { .. })
    }
}

/// Failures talking to a blockchain backend. Recorded in verification
/// results, never propagated as pipeline faults.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(serde_json::Value),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("fixture error: {0}")]
    Fixture(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store writer closed")]
    Closed,
}

/// Internal invariant violations. Fatal to the affected pattern only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("dedup index matched {pattern_id} but discovery registry has no record for it")]
    MissingDiscoveryRecord { pattern_id: String },

    #[error("arrival sequence {sequence} was released before its turn")]
    TicketReleased { sequence: u64 },

    #[error("invariant violated: {0}")]
    Invariant(String),
}
