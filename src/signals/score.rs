use crate::core::ComponentScore;

pub const MIN_REPUTATION: f64 = 0.1;
pub const MAX_REPUTATION: f64 = 2.0;

/// Base score (0-1) from weighted components. Negative contributions are
/// floored at zero before summing.
pub fn compute_base(scores: &[ComponentScore]) -> f64 {
    let total: f64 = scores.iter().map(|s| s.weighted_score.max(0.0)).sum();
    total.clamp(0.0, 1.0)
}

/// Final score: base times reputation, gaming and discovery-credit
/// multipliers, each clamped to its legal range first.
pub fn compute_final(base: f64, reputation: f64, gaming: f64, credit: f64) -> f64 {
    let base = base.clamp(0.0, 1.0);
    let reputation = reputation.clamp(MIN_REPUTATION, MAX_REPUTATION);
    let gaming = gaming.clamp(0.0, 1.0);
    let credit = credit.clamp(0.0, 1.0);
    let score = base * reputation * gaming * credit;
    if score.is_nan() { 0.0 } else { score.max(0.0) }
}
