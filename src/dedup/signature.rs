//! Label-free fingerprints of a transaction graph.
//!
//! `pattern_hash` is the exact Level-1 key. `CoarseShape` is the cheap
//! Level-2 filter and `ShapeProfile` carries the multisets the Level-3
//! near-isomorphism score is computed over. None of them depend on address
//! labels except the hash, so a relabeled copy of a pattern keeps its
//! signature.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::graph::GraphView;
use crate::core::{DetectedPattern, TransactionGraph};

/// Human-readable parts of the bech32 address families we lowercase.
const BECH32_HRPS: [&str; 5] = ["bc", "tb", "bcrt", "ltc", "tltc"];

/// Case-folds an address only where its encoding is case-insensitive: 0x
/// hex and single-case bech32. Base58 and anything unrecognized keep their
/// case.
pub fn canonical_address(address: &str) -> String {
    let address = address.trim();
    let is_hex = address.len() > 2
        && (address.starts_with("0x") || address.starts_with("0X"))
        && address[2..].bytes().all(|b| b.is_ascii_hexdigit());
    let is_bech32 = address.rfind('1').is_some_and(|sep| {
        let hrp = &address[..sep];
        BECH32_HRPS.iter().any(|known| hrp.eq_ignore_ascii_case(known))
            && address.bytes().all(|b| b.is_ascii_alphanumeric())
            && (address == address.to_ascii_lowercase() || address == address.to_ascii_uppercase())
    });
    if is_hex || is_bech32 {
        address.to_ascii_lowercase()
    } else {
        address.to_string()
    }
}

/// Canonical SHA-256 over the normalized pattern: chain, asset, sorted
/// canonical addresses and sorted (from, to, amount, timestamp) tuples.
pub fn pattern_hash(pattern: &DetectedPattern) -> String {
    let graph = &pattern.transaction_graph;

    let mut addresses: Vec<String> = graph
        .nodes
        .iter()
        .map(|n| canonical_address(&n.address))
        .collect();
    addresses.sort();

    let mut edges: Vec<(String, String, String, i64)> = graph
        .edges
        .iter()
        .map(|e| {
            (
                canonical_address(&e.from_address),
                canonical_address(&e.to_address),
                e.amount.normalize().to_string(),
                e.timestamp,
            )
        })
        .collect();
    edges.sort();

    let mut hasher = Sha256::new();
    hasher.update(pattern.chain_key().as_bytes());
    hasher.update(b"|");
    hasher.update(pattern.asset_symbol.trim().to_ascii_uppercase().as_bytes());
    for address in &addresses {
        hasher.update(b"|n:");
        hasher.update(address.as_bytes());
    }
    for (from, to, amount, timestamp) in &edges {
        hasher.update(format!("|e:{from}>{to}:{amount}@{timestamp}").as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Relative difference in [0, 1]; two zeros are identical.
fn relative_diff(a: usize, b: usize) -> f64 {
    let max = a.max(b);
    if max == 0 {
        0.0
    } else {
        a.abs_diff(b) as f64 / max as f64
    }
}

/// Counts and shape features compared at Level 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseShape {
    pub node_count: usize,
    pub edge_count: usize,
    pub max_degree: usize,
    pub cycle_rank: usize,
    pub hop_count: usize,
}

impl CoarseShape {
    /// 1 minus the mean relative difference of every field.
    pub fn similarity(&self, other: &CoarseShape) -> f64 {
        let diffs = [
            relative_diff(self.node_count, other.node_count),
            relative_diff(self.edge_count, other.edge_count),
            relative_diff(self.max_degree, other.max_degree),
            relative_diff(self.cycle_rank, other.cycle_rank),
            relative_diff(self.hop_count, other.hop_count),
        ];
        1.0 - diffs.iter().sum::<f64>() / diffs.len() as f64
    }
}

/// Inter-edge gap classes: same second, a minute, ten minutes, an hour, a
/// day, longer.
const GAP_LIMITS: [i64; 5] = [0, 60, 600, 3_600, 86_400];

fn gap_bucket(gap: i64) -> u8 {
    GAP_LIMITS
        .iter()
        .position(|&limit| gap <= limit)
        .unwrap_or(GAP_LIMITS.len()) as u8
}

/// Quarter-decade magnitude bucket of an amount. Zero and negative
/// amounts share one bucket.
fn amount_bucket(amount: f64) -> i32 {
    if amount <= 0.0 || !amount.is_finite() {
        return i32::MIN;
    }
    (amount.log10() * 4.0).floor() as i32
}

/// Multisets compared at Level 3.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeProfile {
    /// (in-degree, out-degree) per node.
    pub node_shapes: BTreeMap<(usize, usize), usize>,
    /// (sender out-degree, recipient in-degree, amount bucket) per edge.
    pub edge_shapes: BTreeMap<(usize, usize, i32), usize>,
    pub amount_buckets: BTreeMap<i32, usize>,
    pub gap_buckets: BTreeMap<u8, usize>,
}

impl ShapeProfile {
    fn build(graph: &TransactionGraph, view: &GraphView) -> Self {
        let mut profile = ShapeProfile::default();
        for i in 0..view.node_count() {
            *profile
                .node_shapes
                .entry((view.in_degree(i), view.out_degree(i)))
                .or_default() += 1;
        }

        for edge in &graph.edges {
            let bucket = amount_bucket(edge.amount.to_f64().unwrap_or(0.0));
            *profile.amount_buckets.entry(bucket).or_default() += 1;
            let (Some(from), Some(to)) = (view.index_of(&edge.from_address), view.index_of(&edge.to_address))
            else {
                continue;
            };
            *profile
                .edge_shapes
                .entry((view.out_degree(from), view.in_degree(to), bucket))
                .or_default() += 1;
        }

        let mut timestamps: Vec<i64> = graph.edges.iter().map(|e| e.timestamp).collect();
        timestamps.sort_unstable();
        for w in timestamps.windows(2) {
            *profile.gap_buckets.entry(gap_bucket(w[1] - w[0])).or_default() += 1;
        }
        profile
    }
}

/// Weighted Jaccard over two multisets: sum of minima over sum of maxima.
/// Two empty multisets are identical.
pub fn weighted_jaccard<K: Ord>(a: &BTreeMap<K, usize>, b: &BTreeMap<K, usize>) -> f64 {
    let mut min_sum = 0usize;
    let mut max_sum = 0usize;
    for (key, &count) in a {
        let other = b.get(key).copied().unwrap_or(0);
        min_sum += count.min(other);
        max_sum += count.max(other);
    }
    for (key, &count) in b {
        if !a.contains_key(key) {
            max_sum += count;
        }
    }
    if max_sum == 0 {
        1.0
    } else {
        min_sum as f64 / max_sum as f64
    }
}

/// Structural signature kept in the dedup index.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSignature {
    pub shape: CoarseShape,
    pub profile: ShapeProfile,
}

impl StructuralSignature {
    pub fn of(graph: &TransactionGraph) -> Self {
        let view = GraphView::new(graph);
        let shape = CoarseShape {
            node_count: view.node_count(),
            edge_count: view.arc_count(),
            max_degree: view.max_degree(),
            cycle_rank: view.cycle_rank(),
            hop_count: view.hop_count(),
        };
        let profile = ShapeProfile::build(graph, &view);
        Self { shape, profile }
    }

    pub fn coarse_similarity(&self, other: &StructuralSignature) -> f64 {
        self.shape.similarity(&other.shape)
    }

    /// Near-isomorphism score in [0, 1].
    pub fn detailed_similarity(&self, other: &StructuralSignature) -> f64 {
        let a = &self.profile;
        let b = &other.profile;
        0.35 * weighted_jaccard(&a.node_shapes, &b.node_shapes)
            + 0.35 * weighted_jaccard(&a.edge_shapes, &b.edge_shapes)
            + 0.15 * weighted_jaccard(&a.amount_buckets, &b.amount_buckets)
            + 0.15 * weighted_jaccard(&a.gap_buckets, &b.gap_buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::*;

    #[test]
    fn hash_ignores_order_and_hex_case() {
        let p = pattern(vec![
            edge("0xaB01", "0xcd02", "100.0", "t1", 1_700_000_000),
            edge("0xcd02", "0xEf03", "95.0", "t2", 1_700_000_600),
            edge("0xEf03", "0xaB01", "90.0", "t3", 1_700_001_800),
        ]);
        let mut q = p.clone();
        q.transaction_graph.edges.reverse();
        q.transaction_graph.nodes.reverse();
        for e in &mut q.transaction_graph.edges {
            e.from_address = e.from_address.to_uppercase();
            e.to_address = e.to_address.to_uppercase();
        }
        assert_eq!(pattern_hash(&p), pattern_hash(&q));
    }

    #[test]
    fn base58_addresses_keep_their_case() {
        let p = pattern(vec![edge(
            "1BoatSLRHtKNngkdXEeobR76b53LETtpyT",
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            "1.0",
            "t1",
            0,
        )]);
        let mut q = p.clone();
        q.transaction_graph.edges[0].from_address = "1boatslrhtknngkdxeeobr76b53lettpyt".into();
        for n in &mut q.transaction_graph.nodes {
            n.address = n.address.to_ascii_lowercase();
        }
        assert_ne!(pattern_hash(&p), pattern_hash(&q));
    }

    #[test]
    fn canonical_address_by_encoding() {
        assert_eq!(canonical_address(" 0xAbC1 "), "0xabc1");
        assert_eq!(
            canonical_address("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4"),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
        // Mixed-case bech32 is invalid; leave it as given.
        assert_eq!(canonical_address("bc1QW508d6"), "bc1QW508d6");
        assert_eq!(
            canonical_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT"),
            "1BoatSLRHtKNngkdXEeobR76b53LETtpyT"
        );
        assert_eq!(canonical_address("TXyz9"), "TXyz9");
    }

    #[test]
    fn hash_normalizes_amount_scale() {
        let p = triangle("0x");
        let mut q = p.clone();
        q.transaction_graph.edges[0].amount = "100.000".parse().unwrap();
        assert_eq!(pattern_hash(&p), pattern_hash(&q));
        q.transaction_graph.edges[0].amount = "100.001".parse().unwrap();
        assert_ne!(pattern_hash(&p), pattern_hash(&q));
    }

    #[test]
    fn relabeled_copy_is_identical_structurally() {
        let a = StructuralSignature::of(&triangle("0x").transaction_graph);
        let b = StructuralSignature::of(&triangle("bc1").transaction_graph);
        assert_eq!(a.coarse_similarity(&b), 1.0);
        assert!((a.detailed_similarity(&b) - 1.0).abs() < 1e-9);
        assert_ne!(pattern_hash(&triangle("0x")), pattern_hash(&triangle("bc1")));
    }

    #[test]
    fn different_shapes_score_low() {
        let tri = StructuralSignature::of(&triangle("0x").transaction_graph);
        let fan = StructuralSignature::of(
            &pattern(vec![
                edge("s", "a", "1", "t1", 0),
                edge("s", "b", "1", "t2", 0),
                edge("s", "c", "1", "t3", 0),
                edge("s", "d", "1", "t4", 0),
            ])
            .transaction_graph,
        );
        assert!(tri.coarse_similarity(&fan) < 0.7);
        assert!(tri.detailed_similarity(&fan) < 0.5);
    }

    #[test]
    fn jaccard_basics() {
        let a: BTreeMap<u8, usize> = [(1, 2), (2, 1)].into_iter().collect();
        let b: BTreeMap<u8, usize> = [(1, 1), (3, 1)].into_iter().collect();
        // min: 1, max: 2 + 1 + 1
        assert!((weighted_jaccard(&a, &b) - 0.25).abs() < 1e-9);
        assert_eq!(weighted_jaccard::<u8>(&BTreeMap::new(), &BTreeMap::new()), 1.0);
    }

    #[test]
    fn gap_buckets() {
        assert_eq!(gap_bucket(0), 0);
        assert_eq!(gap_bucket(30), 1);
        assert_eq!(gap_bucket(3_600), 3);
        assert_eq!(gap_bucket(1_000_000), 5);
    }
}
