pub mod classify;
pub mod rules;
pub mod score;

use std::collections::BTreeMap;

use crate::config::ScoringConfig;
use crate::core::{ComponentScore, ScoreBreakdown};
use rules::{Rule, ScoreInput};

/// The scoring engine applies all rules and folds in the multipliers.
pub struct ScoreEngine {
    rules: Vec<Box<dyn Rule + Send + Sync>>,
    weights: BTreeMap<String, f64>,
    volume_reference: BTreeMap<String, f64>,
    default_volume_reference: f64,
}

impl ScoreEngine {
    pub fn new(config: &ScoringConfig) -> Self {
        let rules = rules::default_rules();
        let weights = rules
            .iter()
            .map(|rule| {
                let weight = config
                    .weights
                    .get(rule.name())
                    .copied()
                    .unwrap_or_else(|| rule.default_weight())
                    .max(0.0);
                (rule.name().to_string(), weight)
            })
            .collect();
        let volume_reference = config
            .volume_reference
            .iter()
            .map(|(asset, v)| (asset.trim().to_ascii_uppercase(), *v))
            .collect();

        Self {
            rules,
            weights,
            volume_reference,
            default_volume_reference: config.default_volume_reference,
        }
    }

    /// Volume at which an asset's patterns count as significant.
    pub fn volume_reference(&self, asset_symbol: &str) -> f64 {
        self.volume_reference
            .get(&asset_symbol.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or(self.default_volume_reference)
    }

    pub fn score(&self, input: &ScoreInput, reputation: f64, gaming: f64, credit: f64) -> ScoreBreakdown {
        let components: Vec<ComponentScore> = self
            .rules
            .iter()
            .map(|rule| {
                let raw_value = rule.evaluate(input).clamp(0.0, 1.0);
                let weight = self.weights.get(rule.name()).copied().unwrap_or(0.0);
                ComponentScore {
                    name: rule.name().to_string(),
                    raw_value,
                    weight,
                    weighted_score: raw_value * weight,
                }
            })
            .collect();

        let base_score = score::compute_base(&components);
        let final_score = score::compute_final(base_score, reputation, gaming, credit);

        ScoreBreakdown {
            components,
            base_score,
            reputation_multiplier: reputation.clamp(score::MIN_REPUTATION, score::MAX_REPUTATION),
            gaming_multiplier: gaming.clamp(0.0, 1.0),
            credit_multiplier: credit.clamp(0.0, 1.0),
            final_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ScoreInput {
        ScoreInput {
            classification_confidence: 1.0,
            hop_count: 4,
            asset_count: 1,
            cycle_depth: 0,
            is_historical: false,
            miner_historical_ratio: 0.0,
            total_volume: 1000.0,
            volume_reference: 1000.0,
            max_similarity: 0.0,
        }
    }

    #[test]
    fn breakdown_matches_formula() {
        let engine = ScoreEngine::new(&ScoringConfig::default());
        let breakdown = engine.score(&input(), 1.0, 1.0, 1.0);
        // 0.25*1 + 0.30*0.25 + 0.20*0 + 0.15*0.5 + 0.10*1
        assert!((breakdown.base_score - 0.5).abs() < 1e-9);
        assert!((breakdown.final_score - 0.5).abs() < 1e-9);
        assert_eq!(breakdown.components.len(), 5);
        assert_eq!(breakdown.component("uniqueness"), Some(1.0));
    }

    #[test]
    fn gaming_penalty_halves_score() {
        let engine = ScoreEngine::new(&ScoringConfig::default());
        let clean = engine.score(&input(), 1.2, 1.0, 1.0).final_score;
        let penalized = engine.score(&input(), 1.2, 0.5, 1.0).final_score;
        assert!((penalized - clean * 0.5).abs() < 1e-9);
    }

    #[test]
    fn weight_overrides_apply() {
        let mut config = ScoringConfig::default();
        config.weights.insert("uniqueness".into(), 0.0);
        config.volume_reference.insert("btc".into(), 10.0);
        let engine = ScoreEngine::new(&config);
        let breakdown = engine.score(&input(), 1.0, 1.0, 1.0);
        assert!((breakdown.base_score - 0.4).abs() < 1e-9);
        assert_eq!(engine.volume_reference("BTC"), 10.0);
        assert_eq!(engine.volume_reference("ETH"), config.default_volume_reference);
    }
}
