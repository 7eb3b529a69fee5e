use rust_decimal::prelude::ToPrimitive;

use crate::core::graph::GraphView;
use crate::core::{Classification, PatternType, TransactionGraph};

/// Consecutive edges closer than this count as rapid-fire.
const RAPID_GAP_SECS: i64 = 60;

/// Structural features the classification rules read.
///
/// Everything is computed over sorted containers so identical graphs always
/// yield bit-identical features.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphFeatures {
    pub node_count: usize,
    pub edge_count: usize,
    pub max_fan_in: usize,
    pub max_fan_out: usize,
    /// Largest min(in, out) over nodes: a pass-through hub.
    pub hub_throughput: usize,
    /// Similarity of the hub's outgoing amounts (1 = all equal).
    pub hub_out_similarity: f64,
    pub largest_cycle: usize,
    pub cycle_edge_ratio: f64,
    pub hop_count: usize,
    pub reciprocal_edge_ratio: f64,
    /// 1 - coefficient of variation of amounts, floored at 0.
    pub amount_similarity: f64,
    /// Largest amount over the median amount.
    pub max_to_median: f64,
    /// Share of consecutive edge gaps at or under a minute.
    pub rapid_gap_ratio: f64,
}

impl GraphFeatures {
    pub fn extract(graph: &TransactionGraph) -> Self {
        let view = GraphView::new(graph);
        let edge_count = view.arc_count();
        let amounts: Vec<f64> = graph
            .edges
            .iter()
            .map(|e| e.amount.to_f64().unwrap_or(0.0))
            .collect();

        // Hub with the most pass-through; among tied hubs the most even
        // outputs count.
        let hub_throughput = (0..view.node_count())
            .map(|i| view.in_degree(i).min(view.out_degree(i)))
            .max()
            .unwrap_or(0);
        let hub_out_similarity = if hub_throughput == 0 {
            0.0
        } else {
            (0..view.node_count())
                .filter(|&i| view.in_degree(i).min(view.out_degree(i)) == hub_throughput)
                .map(|i| {
                    let outgoing: Vec<f64> = graph
                        .edges_from(view.address(i))
                        .map(|e| e.amount.to_f64().unwrap_or(0.0))
                        .collect();
                    similarity(&outgoing)
                })
                .fold(0.0, f64::max)
        };

        let ratio = |part: usize| {
            if edge_count == 0 {
                0.0
            } else {
                part as f64 / edge_count as f64
            }
        };

        Self {
            node_count: view.node_count(),
            edge_count,
            max_fan_in: view.max_fan_in(),
            max_fan_out: view.max_fan_out(),
            hub_throughput,
            hub_out_similarity,
            largest_cycle: view.largest_cycle(),
            cycle_edge_ratio: ratio(view.edges_on_cycles()),
            hop_count: view.hop_count(),
            reciprocal_edge_ratio: ratio(view.reciprocal_edges()),
            amount_similarity: similarity(&amounts),
            max_to_median: max_to_median(&amounts),
            rapid_gap_ratio: rapid_gap_ratio(graph),
        }
    }
}

/// Summed in sorted order so edge order never moves the result.
fn similarity(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 1.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / mean).max(0.0)
}

fn max_to_median(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = sorted[(sorted.len() - 1) / 2];
    let max = sorted[sorted.len() - 1];
    if median <= 0.0 {
        return if max > 0.0 { f64::MAX } else { 1.0 };
    }
    max / median
}

fn rapid_gap_ratio(graph: &TransactionGraph) -> f64 {
    let mut timestamps: Vec<i64> = graph.edges.iter().map(|e| e.timestamp).collect();
    if timestamps.len() < 2 {
        return 0.0;
    }
    timestamps.sort_unstable();
    let gaps = timestamps.len() - 1;
    let rapid = timestamps
        .windows(2)
        .filter(|w| w[1] - w[0] <= RAPID_GAP_SECS)
        .count();
    rapid as f64 / gaps as f64
}

/// A classification rule: returns a confidence in [0, 1], 0 when it does
/// not fire.
type RuleFn = fn(&GraphFeatures) -> f64;

/// Rules in tie-break order: on equal confidence the earlier rule wins.
const RULES: &[(PatternType, RuleFn)] = &[
    (PatternType::CircularTransfer, circular_transfer),
    (PatternType::WashTrading, wash_trading),
    (PatternType::MixerTumbler, mixer_tumbler),
    (PatternType::Smurfing, smurfing),
    (PatternType::Layering, layering),
    (PatternType::RapidFire, rapid_fire),
    (PatternType::SuspiciousVolume, suspicious_volume),
];

fn circular_transfer(f: &GraphFeatures) -> f64 {
    if f.largest_cycle < 3 {
        return 0.0;
    }
    0.5 + 0.5 * f.cycle_edge_ratio
}

fn wash_trading(f: &GraphFeatures) -> f64 {
    if f.reciprocal_edge_ratio < 0.5 {
        return 0.0;
    }
    0.4 + 0.6 * f.reciprocal_edge_ratio * f.amount_similarity
}

fn mixer_tumbler(f: &GraphFeatures) -> f64 {
    if f.hub_throughput < 3 {
        return 0.0;
    }
    0.5 + 0.5 * f.hub_out_similarity
}

fn smurfing(f: &GraphFeatures) -> f64 {
    let fan = f.max_fan_in.max(f.max_fan_out);
    if fan < 3 {
        return 0.0;
    }
    let breadth = 0.4 + 0.1 * (fan - 3).min(4) as f64;
    breadth * (0.5 + 0.5 * f.amount_similarity)
}

fn layering(f: &GraphFeatures) -> f64 {
    if f.hop_count < 3 || f.largest_cycle > 0 {
        return 0.0;
    }
    (0.3 + 0.15 * (f.hop_count - 2) as f64).min(0.9)
}

fn rapid_fire(f: &GraphFeatures) -> f64 {
    if f.edge_count < 5 || f.rapid_gap_ratio < 0.8 {
        return 0.0;
    }
    f.rapid_gap_ratio * (0.5 + 0.05 * (f.edge_count - 5).min(10) as f64)
}

fn suspicious_volume(f: &GraphFeatures) -> f64 {
    if f.edge_count < 2 || f.max_to_median < 10.0 {
        return 0.0;
    }
    (0.4 + 0.2 * (f.max_to_median / 10.0).log10()).min(0.8)
}

/// Assign a pattern category from graph structure alone.
///
/// Deterministic and total: graphs no rule recognizes come back as
/// `Custom` with confidence 0.
pub fn classify(graph: &TransactionGraph) -> Classification {
    let features = GraphFeatures::extract(graph);
    classify_features(&features)
}

pub fn classify_features(features: &GraphFeatures) -> Classification {
    let mut best = Classification::unclassified();
    for (pattern_type, rule) in RULES {
        let confidence = rule(features).clamp(0.0, 1.0);
        if confidence > best.confidence {
            best = Classification {
                pattern_type: *pattern_type,
                confidence,
            };
        }
    }
    best
}
