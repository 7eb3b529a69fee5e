pub mod graph;
pub mod pipeline;
pub mod protocol;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::IngressError;

/// Free-form metadata attached to nodes and edges by the miner.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Address category reported by the miner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[serde(rename = "eoa", alias = "externally_owned")]
    ExternallyOwned,
    Contract,
    Exchange,
    #[serde(other)]
    Unknown,
}

/// A blockchain address in a submitted pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub address: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A transaction between two addresses of the pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub transaction_hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl GraphEdge {
    pub fn is_self_loop(&self) -> bool {
        self.from_address == self.to_address
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl TransactionGraph {
    pub fn edges_from<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.from_address == address)
    }

    /// Sum of all edge amounts, saturating at `Decimal::MAX`.
    pub fn total_volume(&self) -> Decimal {
        self.edges
            .iter()
            .fold(Decimal::ZERO, |acc, e| acc.checked_add(e.amount).unwrap_or(Decimal::MAX))
    }

    pub fn addresses(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.address.as_str()).collect()
    }

    pub fn latest_timestamp(&self) -> Option<i64> {
        self.edges.iter().map(|e| e.timestamp).max()
    }
}

/// Resource bounds checked before any processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphLimits {
    pub max_nodes: usize,
    pub max_edges: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_nodes: 100,
            max_edges: 500,
        }
    }
}

/// A transaction graph submitted by a miner, with its chain context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub transaction_graph: TransactionGraph,
    pub blockchain: String,
    pub asset_symbol: String,
    /// Miner-reported, untrusted.
    pub detection_timestamp: i64,
}

impl DetectedPattern {
    /// Shape validation. Size bounds are checked first so oversized graphs
    /// are never walked.
    pub fn validate(&self, limits: GraphLimits) -> Result<(), IngressError> {
        let graph = &self.transaction_graph;
        if graph.nodes.len() > limits.max_nodes {
            return Err(IngressError::TooManyNodes {
                count: graph.nodes.len(),
                limit: limits.max_nodes,
            });
        }
        if graph.edges.len() > limits.max_edges {
            return Err(IngressError::TooManyEdges {
                count: graph.edges.len(),
                limit: limits.max_edges,
            });
        }
        if graph.nodes.is_empty() {
            return Err(IngressError::NoNodes);
        }
        if graph.edges.is_empty() {
            return Err(IngressError::NoEdges);
        }
        if self.blockchain.trim().is_empty() {
            return Err(IngressError::MissingBlockchain);
        }
        if self.asset_symbol.trim().is_empty() {
            return Err(IngressError::MissingAssetSymbol);
        }

        let mut seen = BTreeSet::new();
        for node in &graph.nodes {
            if !seen.insert(node.address.as_str()) {
                return Err(IngressError::DuplicateNode(node.address.clone()));
            }
        }
        for edge in &graph.edges {
            for address in [&edge.from_address, &edge.to_address] {
                if !seen.contains(address.as_str()) {
                    return Err(IngressError::UnknownEndpoint {
                        transaction_hash: edge.transaction_hash.clone(),
                        address: address.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Lowercased chain id used to select an oracle backend and index bucket.
    pub fn chain_key(&self) -> String {
        self.blockchain.trim().to_ascii_lowercase()
    }
}

/// Fraud pattern category.
///
/// New categories deserialize into `Custom` rather than failing, and every
/// match over this type in the crate keeps a catch-all arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Smurfing,
    Layering,
    CircularTransfer,
    WashTrading,
    MixerTumbler,
    SuspiciousVolume,
    RapidFire,
    #[serde(other)]
    Custom,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Smurfing => "smurfing",
            PatternType::Layering => "layering",
            PatternType::CircularTransfer => "circular_transfer",
            PatternType::WashTrading => "wash_trading",
            PatternType::MixerTumbler => "mixer_tumbler",
            PatternType::SuspiciousVolume => "suspicious_volume",
            PatternType::RapidFire => "rapid_fire",
            PatternType::Custom => "custom",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub pattern_type: PatternType,
    pub confidence: f64,
}

impl Classification {
    pub fn unclassified() -> Self {
        Self {
            pattern_type: PatternType::Custom,
            confidence: 0.0,
        }
    }
}

/// A pattern together with its validator-assigned category. Lives only
/// for the duration of adjudication.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedPattern {
    pub pattern: DetectedPattern,
    pub classification: Classification,
}

/// Outcome of checking a pattern against the chain. Produced once, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternVerificationResult {
    pub pattern_id: String,
    pub is_valid: bool,
    pub verification_timestamp: DateTime<Utc>,
    pub transactions_verified: usize,
    pub total_transactions: usize,
    pub addresses_checked: usize,
    pub addresses_failed: usize,
    pub confidence: f64,
    pub errors: Vec<String>,
    pub suspicious_flags: Vec<String>,
    /// First on-chain sighting per address, when the backend knows it.
    #[serde(default)]
    pub address_first_seen: BTreeMap<String, DateTime<Utc>>,
}

impl PatternVerificationResult {
    /// An invalid result with zero confidence and a single error entry.
    pub fn failed(pattern_id: &str, total_transactions: usize, error: impl Into<String>) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            is_valid: false,
            verification_timestamp: Utc::now(),
            transactions_verified: 0,
            total_transactions,
            addresses_checked: 0,
            addresses_failed: 0,
            confidence: 0.0,
            errors: vec![error.into()],
            suspicious_flags: Vec::new(),
            address_first_seen: BTreeMap::new(),
        }
    }
}

/// One weighted scoring component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub name: String,
    pub raw_value: f64,
    pub weight: f64,
    pub weighted_score: f64,
}

/// Full scoring trace for an accepted pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub components: Vec<ComponentScore>,
    pub base_score: f64,
    pub reputation_multiplier: f64,
    pub gaming_multiplier: f64,
    pub credit_multiplier: f64,
    pub final_score: f64,
}

impl ScoreBreakdown {
    pub fn component(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.raw_value)
    }
}

/// Terminal outcome of adjudication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// First discoverer, fully scored.
    Accepted,
    /// Equivalent pattern from another miner inside the grace window.
    SharedDiscovery,
    /// Resubmission or late submission of a known pattern.
    Duplicate,
    OversizedGraph,
    MalformedGraph,
    ResponseCapExceeded,
    RateLimited,
    VerificationFailed,
    GamingRejected,
    InternalError,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accepted => "accepted",
            Disposition::SharedDiscovery => "shared_discovery",
            Disposition::Duplicate => "duplicate",
            Disposition::OversizedGraph => "oversized_graph",
            Disposition::MalformedGraph => "malformed_graph",
            Disposition::ResponseCapExceeded => "response_cap_exceeded",
            Disposition::RateLimited => "rate_limited",
            Disposition::VerificationFailed => "verification_failed",
            Disposition::GamingRejected => "gaming_rejected",
            Disposition::InternalError => "internal_error",
        }
    }

    /// Whether the pattern received any score.
    pub fn is_scored(&self) -> bool {
        matches!(self, Disposition::Accepted | Disposition::SharedDiscovery)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pattern as it entered the validator: owner, validator-assigned arrival
/// sequence and arrival time. Ordering decisions use these, never the
/// miner's `detection_timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub miner_hotkey: String,
    pub pattern: DetectedPattern,
    pub sequence: u64,
    pub arrived_at: DateTime<Utc>,
}

/// The write-once record handed to storage for every submission,
/// including rejected ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPattern {
    pub pattern_id: String,
    pub pattern_hash: String,
    pub transaction_graph: TransactionGraph,
    pub blockchain: String,
    pub asset_symbol: String,
    pub detection_timestamp: i64,

    pub pattern_type: PatternType,
    pub classification_confidence: f64,
    pub verification: Option<PatternVerificationResult>,
    pub scores: Option<ScoreBreakdown>,
    pub pattern_score: f64,

    pub disposition: Disposition,
    pub reason: Option<String>,

    pub miner_hotkey: String,
    pub validator_hotkey: String,
    pub arrival_sequence: u64,
    pub arrived_at: DateTime<Utc>,
    pub adjudicated_at: DateTime<Utc>,

    pub is_duplicate: bool,
    pub similar_patterns: Vec<String>,
    pub credit_multiplier: f64,
    pub gaming_flags: Vec<String>,
    pub miner_reputation_delta: f64,
}

impl StoredPattern {
    /// A zero-score record for a submission that stopped at `disposition`.
    pub fn terminal(
        submission: &Submission,
        pattern_id: String,
        pattern_hash: String,
        validator_hotkey: &str,
        disposition: Disposition,
        reason: impl Into<String>,
    ) -> Self {
        let pattern = &submission.pattern;
        Self {
            pattern_id,
            pattern_hash,
            transaction_graph: pattern.transaction_graph.clone(),
            blockchain: pattern.blockchain.clone(),
            asset_symbol: pattern.asset_symbol.clone(),
            detection_timestamp: pattern.detection_timestamp,
            pattern_type: PatternType::Custom,
            classification_confidence: 0.0,
            verification: None,
            scores: None,
            pattern_score: 0.0,
            disposition,
            reason: Some(reason.into()),
            miner_hotkey: submission.miner_hotkey.clone(),
            validator_hotkey: validator_hotkey.to_string(),
            arrival_sequence: submission.sequence,
            arrived_at: submission.arrived_at,
            adjudicated_at: Utc::now(),
            is_duplicate: false,
            similar_patterns: Vec::new(),
            credit_multiplier: 0.0,
            gaming_flags: Vec::new(),
            miner_reputation_delta: 0.0,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::str::FromStr;

    pub fn node(address: &str) -> GraphNode {
        GraphNode {
            address: address.to_string(),
            node_type: NodeType::ExternallyOwned,
            metadata: Metadata::new(),
        }
    }

    pub fn edge(from: &str, to: &str, amount: &str, hash: &str, timestamp: i64) -> GraphEdge {
        GraphEdge {
            from_address: from.to_string(),
            to_address: to.to_string(),
            amount: Decimal::from_str(amount).unwrap(),
            transaction_hash: hash.to_string(),
            timestamp,
            metadata: Metadata::new(),
        }
    }

    /// Builds a pattern whose node set is every address the edges mention.
    pub fn pattern(edges: Vec<GraphEdge>) -> DetectedPattern {
        let mut addresses = BTreeSet::new();
        for e in &edges {
            addresses.insert(e.from_address.clone());
            addresses.insert(e.to_address.clone());
        }
        DetectedPattern {
            transaction_graph: TransactionGraph {
                nodes: addresses.iter().map(|a| node(a)).collect(),
                edges,
            },
            blockchain: "ethereum".to_string(),
            asset_symbol: "ETH".to_string(),
            detection_timestamp: 1_700_000_000,
        }
    }

    /// A -> B -> C -> A.
    pub fn triangle(prefix: &str) -> DetectedPattern {
        let a = format!("{prefix}a");
        let b = format!("{prefix}b");
        let c = format!("{prefix}c");
        pattern(vec![
            edge(&a, &b, "100.0", &format!("{prefix}tx1"), 1_700_000_000),
            edge(&b, &c, "95.0", &format!("{prefix}tx2"), 1_700_000_600),
            edge(&c, &a, "90.0", &format!("{prefix}tx3"), 1_700_001_800),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn valid_pattern_passes() {
        assert_eq!(triangle("0x").validate(GraphLimits::default()), Ok(()));
    }

    #[test]
    fn oversized_checked_before_shape() {
        let mut p = triangle("0x");
        p.transaction_graph.edges.push(edge("0xa", "0xmissing", "1", "t", 0));
        let limits = GraphLimits { max_nodes: 100, max_edges: 3 };
        let err = p.validate(limits).unwrap_err();
        assert!(err.is_oversized());
    }

    #[test]
    fn too_many_nodes_rejected() {
        let mut p = triangle("0x");
        for i in 0..101 {
            p.transaction_graph.nodes.push(node(&format!("extra{i}")));
        }
        assert!(matches!(
            p.validate(GraphLimits::default()),
            Err(IngressError::TooManyNodes { count: 104, limit: 100 })
        ));
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut p = triangle("0x");
        p.transaction_graph.edges.push(edge("0xa", "0xghost", "1", "tx9", 0));
        let err = p.validate(GraphLimits::default()).unwrap_err();
        assert!(matches!(err, IngressError::UnknownEndpoint { ref address, .. } if address == "0xghost"));
        assert!(!err.is_oversized());
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut p = triangle("0x");
        p.transaction_graph.nodes.push(node("0xa"));
        assert_eq!(
            p.validate(GraphLimits::default()),
            Err(IngressError::DuplicateNode("0xa".into()))
        );
    }

    #[test]
    fn empty_edges_and_chain_rejected() {
        let mut p = triangle("0x");
        p.blockchain = "  ".into();
        assert_eq!(p.validate(GraphLimits::default()), Err(IngressError::MissingBlockchain));
        p.transaction_graph.edges.clear();
        assert_eq!(p.validate(GraphLimits::default()), Err(IngressError::NoEdges));
    }

    #[test]
    fn total_volume_and_latest_timestamp() {
        let p = triangle("0x");
        assert_eq!(p.transaction_graph.total_volume(), Decimal::from(285));
        assert_eq!(p.transaction_graph.latest_timestamp(), Some(1_700_001_800));
    }

    #[test]
    fn unknown_categories_fall_back_to_custom() {
        let t: PatternType = serde_json::from_str("\"pump_and_dump\"").unwrap();
        assert_eq!(t, PatternType::Custom);
        let t: PatternType = serde_json::from_str("\"wash_trading\"").unwrap();
        assert_eq!(t, PatternType::WashTrading);
        let n: NodeType = serde_json::from_str("\"mixer\"").unwrap();
        assert_eq!(n, NodeType::Unknown);
        let n: NodeType = serde_json::from_str("\"eoa\"").unwrap();
        assert_eq!(n, NodeType::ExternallyOwned);
    }
}
