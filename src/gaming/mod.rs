pub mod detectors;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{DedupConfig, GamingConfig};
use crate::core::{ClassifiedPattern, PatternVerificationResult, Submission};
use crate::dedup::{DedupCheck, StructuralSignature};
use detectors::{
    AddressAgeDetector, ComplexityAuthenticityDetector, CoordinationDetector, FarmingDetector, WatchEntry,
};

/// What a detector concluded about one pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    Clear,
    /// Multiply the score by `factor`.
    Penalty { factor: f64, flag: String },
    /// Drop the pattern before scoring.
    Reject { flag: String, reason: String },
}

/// Everything known about a pattern by the time gaming checks run.
pub struct GamingContext<'a> {
    pub submission: &'a Submission,
    pub classified: &'a ClassifiedPattern,
    pub signature: &'a StructuralSignature,
    pub verification: &'a PatternVerificationResult,
    pub dedup: &'a DedupCheck,
}

/// An independent gaming heuristic. Detectors must not depend on each
/// other's results.
pub trait Detector {
    fn name(&self) -> &str;
    fn evaluate(&self, ctx: &GamingContext<'_>) -> Finding;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GamingReport {
    /// Product of every penalty factor, 1.0 when clean.
    pub multiplier: f64,
    pub flags: Vec<String>,
    /// Reasons from every rejecting detector.
    pub rejections: Vec<String>,
}

impl GamingReport {
    pub fn is_rejected(&self) -> bool {
        !self.rejections.is_empty()
    }

    pub fn rejection_reason(&self) -> Option<String> {
        if self.rejections.is_empty() {
            None
        } else {
            Some(self.rejections.join("; "))
        }
    }
}

/// All detectors, evaluated together. Stateful detectors are also kept
/// by type for admission checks and the watchlist.
pub struct GamingSuite {
    detectors: Vec<Arc<dyn Detector + Send + Sync>>,
    farming: Arc<FarmingDetector>,
    coordination: Arc<CoordinationDetector>,
}

impl GamingSuite {
    pub fn new(config: &GamingConfig, dedup: &DedupConfig) -> Self {
        let farming = Arc::new(FarmingDetector::new(config, dedup.candidate_threshold));
        let coordination = Arc::new(CoordinationDetector::new(config));
        let detectors: Vec<Arc<dyn Detector + Send + Sync>> = vec![
            Arc::new(AddressAgeDetector::new(config)),
            Arc::new(ComplexityAuthenticityDetector::new(config)),
            coordination.clone(),
            farming.clone(),
        ];
        Self {
            detectors,
            farming,
            coordination,
        }
    }

    pub fn evaluate(&self, ctx: &GamingContext<'_>) -> GamingReport {
        let mut report = GamingReport {
            multiplier: 1.0,
            flags: Vec::new(),
            rejections: Vec::new(),
        };
        for detector in &self.detectors {
            match detector.evaluate(ctx) {
                Finding::Clear => {}
                Finding::Penalty { factor, flag } => {
                    report.multiplier *= factor.clamp(0.0, 1.0);
                    report.flags.push(flag);
                }
                Finding::Reject { flag, reason } => {
                    report.flags.push(flag);
                    report.rejections.push(format!("{}: {reason}", detector.name()));
                }
            }
        }
        report
    }

    /// Miners rate-limited for pattern farming are turned away at admission.
    pub fn is_rate_limited(&self, miner: &str, now: DateTime<Utc>) -> bool {
        self.farming.is_limited(miner, now)
    }

    pub fn watch_entry(&self, miner: &str) -> Option<WatchEntry> {
        self.coordination.watch_entry(miner)
    }

    pub fn watchlist(&self) -> Vec<(String, WatchEntry)> {
        self.coordination.watchlist()
    }

    pub fn prune(&self, now: DateTime<Utc>) {
        self.farming.prune(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::*;
    use crate::core::{Classification, DetectedPattern, PatternType};
    use crate::dedup::NearMatch;
    use chrono::Duration;
    use std::collections::BTreeMap;

    struct Case {
        submission: Submission,
        classified: ClassifiedPattern,
        signature: StructuralSignature,
        verification: PatternVerificationResult,
        dedup: DedupCheck,
    }

    impl Case {
        fn new(miner: &str, pattern: DetectedPattern, arrived_at: DateTime<Utc>) -> Self {
            let signature = StructuralSignature::of(&pattern.transaction_graph);
            let mut verification = PatternVerificationResult::failed("p", pattern.transaction_graph.edges.len(), "x");
            verification.is_valid = true;
            verification.errors.clear();
            Self {
                submission: Submission {
                    miner_hotkey: miner.into(),
                    pattern: pattern.clone(),
                    sequence: 1,
                    arrived_at,
                },
                classified: ClassifiedPattern {
                    pattern,
                    classification: Classification {
                        pattern_type: PatternType::CircularTransfer,
                        confidence: 1.0,
                    },
                },
                signature,
                verification,
                dedup: DedupCheck {
                    duplicate_of: None,
                    near_matches: Vec::new(),
                    max_similarity: 0.0,
                    candidates_checked: 0,
                },
            }
        }

        fn ctx(&self) -> GamingContext<'_> {
            GamingContext {
                submission: &self.submission,
                classified: &self.classified,
                signature: &self.signature,
                verification: &self.verification,
                dedup: &self.dedup,
            }
        }
    }

    fn suite() -> GamingSuite {
        GamingSuite::new(&GamingConfig::default(), &DedupConfig::default())
    }

    fn ten_node_ring(prefix: &str) -> DetectedPattern {
        let edges = (0..10)
            .map(|i| {
                edge(
                    &format!("{prefix}{i}"),
                    &format!("{prefix}{}", (i + 1) % 10),
                    "10",
                    &format!("{prefix}tx{i}"),
                    1_700_000_000 + i * 600,
                )
            })
            .collect();
        pattern(edges)
    }

    fn ages(case: &mut Case, new: usize) {
        let now = case.submission.arrived_at;
        let mut first_seen = BTreeMap::new();
        for (i, node) in case.classified.pattern.transaction_graph.nodes.iter().enumerate() {
            let age = if i < new { Duration::days(2) } else { Duration::days(400) };
            first_seen.insert(node.address.clone(), now - age);
        }
        case.verification.address_first_seen = first_seen;
    }

    #[test]
    fn clean_pattern_passes() {
        let mut case = Case::new("m", ten_node_ring("a"), Utc::now());
        ages(&mut case, 0);
        let report = suite().evaluate(&case.ctx());
        assert_eq!(report.multiplier, 1.0);
        assert!(report.flags.is_empty());
        assert!(!report.is_rejected());
    }

    #[test]
    fn mostly_new_addresses_halve_the_multiplier() {
        let mut case = Case::new("m", ten_node_ring("a"), Utc::now());
        ages(&mut case, 9);
        let report = suite().evaluate(&case.ctx());
        assert!((report.multiplier - 0.5).abs() < 1e-9);
        assert_eq!(report.flags, vec!["suspicious_address_ages".to_string()]);

        // 70% exactly is not above the threshold.
        ages(&mut case, 7);
        assert_eq!(suite().evaluate(&case.ctx()).multiplier, 1.0);
    }

    #[test]
    fn undated_addresses_do_not_count() {
        let case = Case::new("m", ten_node_ring("a"), Utc::now());
        assert_eq!(suite().evaluate(&case.ctx()).multiplier, 1.0);
    }

    #[test]
    fn self_loop_padding_is_rejected() {
        let mut p = triangle("0x");
        for i in 0..3 {
            p.transaction_graph.edges.push(edge("0xa", "0xa", "1", &format!("loop{i}"), 1_700_000_000));
        }
        let case = Case::new("m", p, Utc::now());
        let report = suite().evaluate(&case.ctx());
        assert!(report.is_rejected());
        assert!(report.flags.contains(&"artificial_complexity".to_string()));
    }

    #[test]
    fn instant_round_trips_are_filler() {
        let p = pattern(vec![
            edge("a", "b", "5", "t1", 0),
            edge("b", "a", "5", "t2", 10),
            edge("b", "c", "7", "t3", 4000),
        ]);
        let case = Case::new("m", p, Utc::now());
        let ratio = ComplexityAuthenticityDetector::filler_ratio(&case.ctx());
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn coordination_penalizes_then_rejects() {
        let suite = suite();
        let now = Utc::now();
        let mut case = Case::new("m2", ten_node_ring("a"), now);
        case.dedup.near_matches.push(NearMatch {
            pattern_id: "other".into(),
            miner_hotkey: "m1".into(),
            arrived_at: now - Duration::minutes(5),
            similarity: 0.7,
        });

        for strike in 1..5 {
            let report = suite.evaluate(&case.ctx());
            assert!((report.multiplier - 0.8).abs() < 1e-9, "strike {strike}");
            assert!(!report.is_rejected());
        }
        let report = suite.evaluate(&case.ctx());
        assert!(report.is_rejected());
        let entry = suite.watch_entry("m2").unwrap();
        assert_eq!(entry.strikes, 5);
        assert_eq!(suite.watchlist().len(), 1);
    }

    #[test]
    fn own_near_matches_and_stale_ones_ignored() {
        let suite = suite();
        let now = Utc::now();
        let mut case = Case::new("m1", ten_node_ring("a"), now);
        case.dedup.near_matches.push(NearMatch {
            pattern_id: "mine".into(),
            miner_hotkey: "m1".into(),
            arrived_at: now,
            similarity: 0.8,
        });
        case.dedup.near_matches.push(NearMatch {
            pattern_id: "old".into(),
            miner_hotkey: "m9".into(),
            arrived_at: now - Duration::hours(3),
            similarity: 0.8,
        });
        assert_eq!(suite.evaluate(&case.ctx()).multiplier, 1.0);
        assert!(suite.watch_entry("m1").is_none());
    }

    #[test]
    fn farming_rate_limits_miner() {
        let suite = suite();
        let start = Utc::now();
        for i in 0..5 {
            let case = Case::new("farmer", ten_node_ring(&format!("f{i}")), start + Duration::minutes(i));
            assert!(!suite.evaluate(&case.ctx()).is_rejected(), "submission {i}");
        }
        let sixth = Case::new("farmer", ten_node_ring("f6"), start + Duration::minutes(6));
        let report = suite.evaluate(&sixth.ctx());
        assert!(report.flags.contains(&"pattern_farming".to_string()));
        assert!(report.is_rejected());
        assert!(suite.is_rate_limited("farmer", start + Duration::minutes(30)));
        assert!(!suite.is_rate_limited("farmer", start + Duration::minutes(67)));
        assert!(!suite.is_rate_limited("honest", start));
    }
}
