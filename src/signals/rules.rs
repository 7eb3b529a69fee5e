use crate::core::graph::GraphView;
use crate::core::ClassifiedPattern;

use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeSet;

/// Everything a scoring rule may look at, gathered once per pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInput {
    pub classification_confidence: f64,
    pub hop_count: usize,
    /// Distinct assets moved; edges without an `asset` tag count as the
    /// pattern's own asset.
    pub asset_count: usize,
    pub cycle_depth: usize,
    /// Whether this pattern's activity is older than the recency window.
    pub is_historical: bool,
    /// The miner's share of historical patterns before this one.
    pub miner_historical_ratio: f64,
    pub total_volume: f64,
    /// Volume at which the volume rule reaches 0.5.
    pub volume_reference: f64,
    /// Best similarity to any related indexed pattern, including the one
    /// it duplicates; 0 when none.
    pub max_similarity: f64,
}

impl ScoreInput {
    /// Structural inputs from the graph; history and similarity fields are
    /// left neutral for the caller to fill.
    pub fn from_pattern(classified: &ClassifiedPattern, volume_reference: f64) -> Self {
        let pattern = &classified.pattern;
        let graph = &pattern.transaction_graph;
        let view = GraphView::new(graph);

        let own_asset = pattern.asset_symbol.trim().to_ascii_uppercase();
        let assets: BTreeSet<String> = graph
            .edges
            .iter()
            .map(|e| {
                e.metadata
                    .get("asset")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_ascii_uppercase())
                    .unwrap_or_else(|| own_asset.clone())
            })
            .collect();

        Self {
            classification_confidence: classified.classification.confidence,
            hop_count: view.hop_count(),
            asset_count: assets.len(),
            cycle_depth: view.cycle_rank(),
            is_historical: false,
            miner_historical_ratio: 0.0,
            total_volume: graph.total_volume().to_f64().unwrap_or(f64::MAX),
            volume_reference,
            max_similarity: 0.0,
        }
    }
}

/// A scoring rule that evaluates a single aspect of a pattern.
/// Returns a normalized value 0.0-1.0.
pub trait Rule {
    fn name(&self) -> &str;
    fn default_weight(&self) -> f64;
    fn evaluate(&self, input: &ScoreInput) -> f64;
}

/// Return all scoring rules with their default weights.
pub fn default_rules() -> Vec<Box<dyn Rule + Send + Sync>> {
    vec![
        Box::new(ClassificationRule),
        Box::new(ComplexityRule),
        Box::new(RecencyBalanceRule),
        Box::new(VolumeRule),
        Box::new(UniquenessRule),
    ]
}

/// x / (x + k): 0 at 0, 0.5 at k, approaching 1.
fn saturate(x: f64, k: f64) -> f64 {
    if x <= 0.0 {
        0.0
    } else {
        x / (x + k)
    }
}

struct ClassificationRule;
impl Rule for ClassificationRule {
    fn name(&self) -> &str { "classification_confidence" }
    fn default_weight(&self) -> f64 { 0.25 }
    fn evaluate(&self, input: &ScoreInput) -> f64 {
        input.classification_confidence
    }
}

/// Monotone in hops, asset diversity and cycle depth.
struct ComplexityRule;
impl Rule for ComplexityRule {
    fn name(&self) -> &str { "complexity" }
    fn default_weight(&self) -> f64 { 0.30 }
    fn evaluate(&self, input: &ScoreInput) -> f64 {
        let hops = saturate(input.hop_count as f64, 4.0);
        let assets = saturate(input.asset_count.saturating_sub(1) as f64, 2.0);
        let cycles = saturate(input.cycle_depth as f64, 3.0);
        0.5 * hops + 0.2 * assets + 0.3 * cycles
    }
}

/// Rewards patterns that pull the miner's mix toward balance: historical
/// patterns are worth more to a recency-heavy miner and vice versa.
struct RecencyBalanceRule;
impl Rule for RecencyBalanceRule {
    fn name(&self) -> &str { "recency_balance" }
    fn default_weight(&self) -> f64 { 0.20 }
    fn evaluate(&self, input: &ScoreInput) -> f64 {
        let ratio = input.miner_historical_ratio.clamp(0.0, 1.0);
        if input.is_historical { 1.0 - ratio } else { ratio }
    }
}

struct VolumeRule;
impl Rule for VolumeRule {
    fn name(&self) -> &str { "volume_significance" }
    fn default_weight(&self) -> f64 { 0.15 }
    fn evaluate(&self, input: &ScoreInput) -> f64 {
        if input.volume_reference <= 0.0 {
            return 0.0;
        }
        // ~0.5 at the reference volume, ~0.9 at 9x
        1.0 - 1.0 / (1.0 + input.total_volume.max(0.0) / input.volume_reference)
    }
}

struct UniquenessRule;
impl Rule for UniquenessRule {
    fn name(&self) -> &str { "uniqueness" }
    fn default_weight(&self) -> f64 { 0.10 }
    fn evaluate(&self, input: &ScoreInput) -> f64 {
        1.0 - input.max_similarity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::*;
    use crate::core::{Classification, PatternType};

    fn input() -> ScoreInput {
        ScoreInput {
            classification_confidence: 0.8,
            hop_count: 4,
            asset_count: 1,
            cycle_depth: 0,
            is_historical: false,
            miner_historical_ratio: 0.5,
            total_volume: 100.0,
            volume_reference: 100.0,
            max_similarity: 0.0,
        }
    }

    fn rule(name: &str) -> Box<dyn Rule + Send + Sync> {
        default_rules().into_iter().find(|r| r.name() == name).unwrap()
    }

    #[test]
    fn default_weights_sum_to_one() {
        let total: f64 = default_rules().iter().map(|r| r.default_weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn complexity_is_monotone() {
        let complexity = rule("complexity");
        let base = complexity.evaluate(&input());
        let deeper = complexity.evaluate(&ScoreInput { cycle_depth: 2, ..input() });
        let longer = complexity.evaluate(&ScoreInput { hop_count: 8, ..input() });
        let wider = complexity.evaluate(&ScoreInput { asset_count: 3, ..input() });
        assert!((base - 0.25).abs() < 1e-9);
        assert!(deeper > base);
        assert!(longer > base);
        assert!(wider > base);
    }

    #[test]
    fn recency_balance_favours_the_minority_kind() {
        let balance = rule("recency_balance");
        let skewed_recent = ScoreInput { miner_historical_ratio: 0.1, ..input() };
        assert!((balance.evaluate(&ScoreInput { is_historical: true, ..skewed_recent.clone() }) - 0.9).abs() < 1e-9);
        assert!((balance.evaluate(&skewed_recent) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn volume_half_at_reference() {
        assert!((rule("volume_significance").evaluate(&input()) - 0.5).abs() < 1e-9);
        let no_ref = ScoreInput { volume_reference: 0.0, ..input() };
        assert_eq!(rule("volume_significance").evaluate(&no_ref), 0.0);
    }

    #[test]
    fn input_from_triangle() {
        let mut p = triangle("0x");
        p.transaction_graph.edges[0]
            .metadata
            .insert("asset".into(), serde_json::json!("usdt"));
        let classified = ClassifiedPattern {
            pattern: p,
            classification: Classification {
                pattern_type: PatternType::CircularTransfer,
                confidence: 1.0,
            },
        };
        let input = ScoreInput::from_pattern(&classified, 1000.0);
        assert_eq!(input.hop_count, 2);
        assert_eq!(input.cycle_depth, 1);
        assert_eq!(input.asset_count, 2);
        assert!((input.total_volume - 285.0).abs() < 1e-9);
    }
}
