use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ReputationConfig;
use crate::core::{Disposition, TransactionGraph};
use crate::signals::score::{MAX_REPUTATION, MIN_REPUTATION};

/// Running-average weight of the newest score.
const SCORE_EMA_ALPHA: f64 = 0.1;
/// Added to the gaming accumulator per rejection / per penalty flag.
const GAMING_REJECTION_WEIGHT: f64 = 0.1;
const GAMING_FLAG_WEIGHT: f64 = 0.02;
const MAX_GAMING_PENALTY: f64 = 0.8;
/// Below this historical share the miner counts as recency-skewed.
const MIN_HISTORICAL_RATIO: f64 = 0.3;
const MAX_HISTORICAL_RATIO: f64 = 0.7;
/// Patterns needed before the balance bonus applies.
const BALANCE_MIN_SAMPLES: usize = 10;

/// Whether a pattern describes activity older than the recent window.
pub fn is_historical(graph: &TransactionGraph, arrived_at: DateTime<Utc>, recent_window: Duration) -> bool {
    graph
        .latest_timestamp()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .is_some_and(|latest| arrived_at - latest > recent_window)
}

/// One adjudicated pattern, as seen by the reputation tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationEvent {
    pub disposition: Disposition,
    pub final_score: f64,
    /// `None` when the pattern never got far enough to be dated.
    pub is_historical: Option<bool>,
    pub gaming_flags: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerReputation {
    pub miner_hotkey: String,

    pub total_patterns_submitted: u64,
    pub verified_patterns: u64,
    pub rejected_patterns: u64,

    pub average_pattern_score: f64,
    pub verification_success_rate: f64,

    pub historical_pattern_ratio: f64,
    #[serde(default)]
    recent_kinds: VecDeque<bool>,
    pub duplicate_submission_count: u64,
    pub gaming_penalty_score: f64,

    pub reputation_multiplier: f64,

    pub first_submission_at: DateTime<Utc>,
    pub last_submission_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MinerReputation {
    pub fn new(miner_hotkey: &str, now: DateTime<Utc>) -> Self {
        Self {
            miner_hotkey: miner_hotkey.to_string(),
            total_patterns_submitted: 0,
            verified_patterns: 0,
            rejected_patterns: 0,
            average_pattern_score: 0.0,
            verification_success_rate: 0.0,
            historical_pattern_ratio: 0.5,
            recent_kinds: VecDeque::new(),
            duplicate_submission_count: 0,
            gaming_penalty_score: 0.0,
            reputation_multiplier: 1.0,
            first_submission_at: now,
            last_submission_at: now,
            updated_at: now,
        }
    }

    /// Folds one adjudicated pattern in and returns the multiplier change.
    pub fn update(&mut self, event: &ReputationEvent, config: &ReputationConfig, now: DateTime<Utc>) -> f64 {
        self.total_patterns_submitted += 1;
        self.last_submission_at = now;

        match event.disposition {
            Disposition::Accepted | Disposition::SharedDiscovery => {
                self.verified_patterns += 1;
                self.average_pattern_score = SCORE_EMA_ALPHA * event.final_score.clamp(0.0, MAX_REPUTATION)
                    + (1.0 - SCORE_EMA_ALPHA) * self.average_pattern_score;
            }
            Disposition::Duplicate => self.duplicate_submission_count += 1,
            Disposition::GamingRejected => {
                self.rejected_patterns += 1;
                self.gaming_penalty_score += GAMING_REJECTION_WEIGHT;
            }
            _ => self.rejected_patterns += 1,
        }
        self.gaming_penalty_score =
            (self.gaming_penalty_score + GAMING_FLAG_WEIGHT * event.gaming_flags as f64).min(MAX_GAMING_PENALTY);
        self.verification_success_rate = self.verified_patterns as f64 / self.total_patterns_submitted as f64;

        if let Some(historical) = event.is_historical {
            self.recent_kinds.push_back(historical);
            while self.recent_kinds.len() > config.ratio_window.max(1) {
                self.recent_kinds.pop_front();
            }
            let historical_count = self.recent_kinds.iter().filter(|&&h| h).count();
            self.historical_pattern_ratio = historical_count as f64 / self.recent_kinds.len() as f64;
        }

        let before = self.reputation_multiplier;
        let target = self.target_multiplier();
        let smoothing = config.smoothing.clamp(0.0, 1.0);
        self.reputation_multiplier =
            (before + smoothing * (target - before)).clamp(MIN_REPUTATION, MAX_REPUTATION);
        self.updated_at = now;
        self.reputation_multiplier - before
    }

    /// Where the multiplier is heading given the current history.
    pub fn target_multiplier(&self) -> f64 {
        let mut multiplier = 1.0;

        if self.historical_pattern_ratio < MIN_HISTORICAL_RATIO {
            multiplier -= 0.5 * (MIN_HISTORICAL_RATIO - self.historical_pattern_ratio);
        }

        multiplier -= (self.duplicate_submission_count as f64 * 0.1 + self.gaming_penalty_score).min(MAX_GAMING_PENALTY);

        if self.verification_success_rate > 0.9
            && self.average_pattern_score > 0.7
            && self.total_patterns_submitted > 50
        {
            multiplier += 0.3;
        } else if self.verification_success_rate > 0.8 && self.average_pattern_score > 0.6 {
            multiplier += 0.1;
        }

        if self.recent_kinds.len() >= BALANCE_MIN_SAMPLES
            && (MIN_HISTORICAL_RATIO..=MAX_HISTORICAL_RATIO).contains(&self.historical_pattern_ratio)
        {
            multiplier += 0.1;
        }

        multiplier.clamp(MIN_REPUTATION, MAX_REPUTATION)
    }
}

/// Per-miner reputation, partitioned by miner so unrelated miners never
/// contend.
pub struct ReputationTracker {
    miners: DashMap<String, MinerReputation>,
    config: ReputationConfig,
}

impl ReputationTracker {
    pub fn new(config: &ReputationConfig) -> Self {
        Self {
            miners: DashMap::new(),
            config: config.clone(),
        }
    }

    pub fn recent_window(&self) -> Duration {
        Duration::days(self.config.recent_window_days)
    }

    pub fn multiplier_for(&self, miner: &str) -> f64 {
        self.miners.get(miner).map(|r| r.reputation_multiplier).unwrap_or(1.0)
    }

    pub fn historical_ratio_for(&self, miner: &str) -> f64 {
        self.miners.get(miner).map(|r| r.historical_pattern_ratio).unwrap_or(0.5)
    }

    /// Applies an event, creating the miner on first sight. Returns the
    /// updated state and the multiplier delta.
    pub fn record(&self, miner: &str, event: &ReputationEvent, now: DateTime<Utc>) -> (MinerReputation, f64) {
        let mut entry = self
            .miners
            .entry(miner.to_string())
            .or_insert_with(|| MinerReputation::new(miner, now));
        let delta = entry.update(event, &self.config, now);
        debug!(
            miner,
            multiplier = entry.reputation_multiplier,
            delta,
            "Reputation updated"
        );
        (entry.clone(), delta)
    }

    /// Loads persisted state, e.g. at startup.
    pub fn restore(&self, reputations: Vec<MinerReputation>) {
        for mut r in reputations {
            r.reputation_multiplier = r.reputation_multiplier.clamp(MIN_REPUTATION, MAX_REPUTATION);
            self.miners.insert(r.miner_hotkey.clone(), r);
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self, miner: &str) -> Option<MinerReputation> {
        self.miners.get(miner).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::triangle;
    use proptest::prelude::*;

    fn event(disposition: Disposition, score: f64, historical: Option<bool>) -> ReputationEvent {
        ReputationEvent {
            disposition,
            final_score: score,
            is_historical: historical,
            gaming_flags: 0,
        }
    }

    #[test]
    fn new_miner_starts_neutral() {
        let tracker = ReputationTracker::new(&ReputationConfig::default());
        assert_eq!(tracker.multiplier_for("m"), 1.0);
        assert_eq!(tracker.historical_ratio_for("m"), 0.5);
    }

    #[test]
    fn duplicates_drag_multiplier_down_gradually() {
        let tracker = ReputationTracker::new(&ReputationConfig::default());
        let now = Utc::now();
        let (_, first_delta) = tracker.record("m", &event(Disposition::Duplicate, 0.0, None), now);
        assert!(first_delta < 0.0);
        assert!(first_delta > -0.1);
        for _ in 0..50 {
            tracker.record("m", &event(Disposition::Duplicate, 0.0, None), now);
        }
        let r = tracker.snapshot("m").unwrap();
        assert_eq!(r.duplicate_submission_count, 51);
        assert!(r.reputation_multiplier >= MIN_REPUTATION);
        assert!(r.reputation_multiplier < 0.3);
    }

    #[test]
    fn consistent_quality_earns_bonus() {
        let tracker = ReputationTracker::new(&ReputationConfig::default());
        let now = Utc::now();
        for i in 0..200 {
            tracker.record("m", &event(Disposition::Accepted, 1.0, Some(i % 2 == 0)), now);
        }
        let r = tracker.snapshot("m").unwrap();
        assert!((r.historical_pattern_ratio - 0.5).abs() < 1e-9);
        assert!((r.target_multiplier() - 1.4).abs() < 1e-9);
        assert!(r.reputation_multiplier > 1.35);
    }

    #[test]
    fn recency_skew_is_penalized() {
        let tracker = ReputationTracker::new(&ReputationConfig::default());
        let now = Utc::now();
        for _ in 0..30 {
            tracker.record("m", &event(Disposition::Accepted, 0.5, Some(false)), now);
        }
        let r = tracker.snapshot("m").unwrap();
        assert_eq!(r.historical_pattern_ratio, 0.0);
        assert!((r.target_multiplier() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn ratio_window_is_bounded() {
        let config = ReputationConfig {
            ratio_window: 4,
            ..ReputationConfig::default()
        };
        let tracker = ReputationTracker::new(&config);
        let now = Utc::now();
        for _ in 0..10 {
            tracker.record("m", &event(Disposition::Accepted, 0.5, Some(true)), now);
        }
        for _ in 0..2 {
            tracker.record("m", &event(Disposition::Accepted, 0.5, Some(false)), now);
        }
        assert!((tracker.historical_ratio_for("m") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn historical_is_relative_to_arrival() {
        let graph = triangle("0x").transaction_graph;
        let latest = DateTime::from_timestamp(1_700_001_800, 0).unwrap();
        assert!(!is_historical(&graph, latest + Duration::days(6), Duration::days(7)));
        assert!(is_historical(&graph, latest + Duration::days(8), Duration::days(7)));
    }

    #[test]
    fn restore_roundtrips_through_json() {
        let tracker = ReputationTracker::new(&ReputationConfig::default());
        tracker.record("m", &event(Disposition::Accepted, 0.9, Some(true)), Utc::now());
        let saved = tracker.snapshot("m").unwrap();
        let json = serde_json::to_string(&saved).unwrap();

        let restored = ReputationTracker::new(&ReputationConfig::default());
        restored.restore(vec![serde_json::from_str(&json).unwrap()]);
        assert_eq!(restored.snapshot("m"), Some(saved));
    }

    fn any_disposition() -> impl Strategy<Value = Disposition> {
        prop_oneof![
            Just(Disposition::Accepted),
            Just(Disposition::SharedDiscovery),
            Just(Disposition::Duplicate),
            Just(Disposition::VerificationFailed),
            Just(Disposition::GamingRejected),
            Just(Disposition::RateLimited),
        ]
    }

    proptest! {
        #[test]
        fn multiplier_stays_bounded(
            events in prop::collection::vec(
                (any_disposition(), -1.0f64..3.0, prop::option::of(any::<bool>()), 0usize..4),
                1..300,
            )
        ) {
            let tracker = ReputationTracker::new(&ReputationConfig::default());
            let now = Utc::now();
            for (disposition, score, historical, flags) in events {
                let e = ReputationEvent { disposition, final_score: score, is_historical: historical, gaming_flags: flags };
                tracker.record("m", &e, now);
                let m = tracker.multiplier_for("m");
                prop_assert!((MIN_REPUTATION..=MAX_REPUTATION).contains(&m));
            }
        }
    }
}
