use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use super::{Detector, Finding, GamingContext};
use crate::config::GamingConfig;
use crate::core::graph::GraphView;
use crate::core::PatternType;
use crate::dedup::signature::CoarseShape;

/// Round trips closer than this with equal amounts carry no economic effect.
const INSTANT_ROUND_TRIP_SECS: i64 = 60;

/// Flags patterns made mostly of freshly created addresses.
pub struct AddressAgeDetector {
    window: Duration,
    ratio: f64,
    penalty: f64,
}

impl AddressAgeDetector {
    pub fn new(config: &GamingConfig) -> Self {
        Self {
            window: Duration::days(config.new_address_window_days),
            ratio: config.new_address_ratio,
            penalty: config.new_address_penalty,
        }
    }

    /// Share of addresses with a known first sighting inside the window.
    /// Addresses the oracle could not date are left out.
    pub fn new_address_ratio(&self, ctx: &GamingContext<'_>) -> Option<f64> {
        let first_seen = &ctx.verification.address_first_seen;
        let arrived_at = ctx.submission.arrived_at;
        let dated: Vec<&DateTime<Utc>> = ctx
            .classified
            .pattern
            .transaction_graph
            .nodes
            .iter()
            .filter_map(|n| first_seen.get(&n.address))
            .collect();
        if dated.is_empty() {
            return None;
        }
        let new = dated.iter().filter(|&&&t| arrived_at - t < self.window).count();
        Some(new as f64 / dated.len() as f64)
    }
}

impl Detector for AddressAgeDetector {
    fn name(&self) -> &str { "address_age" }

    fn evaluate(&self, ctx: &GamingContext<'_>) -> Finding {
        match self.new_address_ratio(ctx) {
            Some(ratio) if ratio > self.ratio => Finding::Penalty {
                factor: self.penalty,
                flag: "suspicious_address_ages".into(),
            },
            _ => Finding::Clear,
        }
    }
}

/// Rejects graphs padded with edges that add size but no information.
pub struct ComplexityAuthenticityDetector {
    filler_ratio: f64,
}

impl ComplexityAuthenticityDetector {
    pub fn new(config: &GamingConfig) -> Self {
        Self {
            filler_ratio: config.filler_ratio,
        }
    }

    /// Share of edges that are self-loops, zero-value, repeated
    /// transaction ids, or halves of an instant equal-amount round trip.
    pub fn filler_ratio(ctx: &GamingContext<'_>) -> f64 {
        let edges = &ctx.classified.pattern.transaction_graph.edges;
        if edges.is_empty() {
            return 0.0;
        }

        let mut filler = vec![false; edges.len()];
        let mut seen_hashes: HashMap<&str, usize> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            if edge.is_self_loop() || edge.amount.is_zero() || edge.amount.is_sign_negative() {
                filler[i] = true;
            }
            let hash = edge.transaction_hash.trim();
            if seen_hashes.insert(hash, i).is_some() {
                filler[i] = true;
            }
        }

        let mut by_pair: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
        for (i, edge) in edges.iter().enumerate() {
            by_pair
                .entry((edge.from_address.as_str(), edge.to_address.as_str()))
                .or_default()
                .push(i);
        }
        for (i, edge) in edges.iter().enumerate() {
            let Some(returns) = by_pair.get(&(edge.to_address.as_str(), edge.from_address.as_str())) else {
                continue;
            };
            for &j in returns {
                let back = &edges[j];
                if i != j
                    && back.amount == edge.amount
                    && (back.timestamp - edge.timestamp).abs() <= INSTANT_ROUND_TRIP_SECS
                {
                    filler[i] = true;
                    filler[j] = true;
                }
            }
        }

        filler.iter().filter(|&&f| f).count() as f64 / edges.len() as f64
    }
}

impl Detector for ComplexityAuthenticityDetector {
    fn name(&self) -> &str { "complexity_authenticity" }

    fn evaluate(&self, ctx: &GamingContext<'_>) -> Finding {
        let ratio = Self::filler_ratio(ctx);
        if ratio > self.filler_ratio {
            let self_loops = GraphView::new(&ctx.classified.pattern.transaction_graph).self_loop_nodes();
            Finding::Reject {
                flag: "artificial_complexity".into(),
                reason: format!("{:.0}% filler edges, {self_loops} self-looping addresses", ratio * 100.0),
            }
        } else {
            Finding::Clear
        }
    }
}

/// A miner on the coordination watchlist.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    pub strikes: u32,
    pub reasons: Vec<String>,
    pub last_flagged: DateTime<Utc>,
}

/// Penalizes near-duplicates of other miners' recent patterns and keeps a
/// watchlist. Rejection needs repeated strikes.
pub struct CoordinationDetector {
    window: Duration,
    penalty: f64,
    reject_strikes: u32,
    watchlist: DashMap<String, WatchEntry>,
}

impl CoordinationDetector {
    pub fn new(config: &GamingConfig) -> Self {
        Self {
            window: Duration::seconds(config.coordination_window_secs),
            penalty: config.coordination_penalty,
            reject_strikes: config.coordination_reject_strikes.max(1),
            watchlist: DashMap::new(),
        }
    }

    pub fn watch_entry(&self, miner: &str) -> Option<WatchEntry> {
        self.watchlist.get(miner).map(|e| e.clone())
    }

    pub fn watchlist(&self) -> Vec<(String, WatchEntry)> {
        let mut all: Vec<_> = self
            .watchlist
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Detector for CoordinationDetector {
    fn name(&self) -> &str { "coordination" }

    fn evaluate(&self, ctx: &GamingContext<'_>) -> Finding {
        let miner = &ctx.submission.miner_hotkey;
        let arrived_at = ctx.submission.arrived_at;
        let hit = ctx
            .dedup
            .near_matches
            .iter()
            .filter(|m| &m.miner_hotkey != miner && (arrived_at - m.arrived_at).abs() <= self.window)
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity));
        let Some(hit) = hit else {
            return Finding::Clear;
        };

        let reason = format!(
            "{:.2} similar to {} from {} within {}s",
            hit.similarity,
            hit.pattern_id,
            hit.miner_hotkey,
            (arrived_at - hit.arrived_at).num_seconds().abs()
        );
        let strikes = {
            let mut entry = self.watchlist.entry(miner.clone()).or_insert_with(|| WatchEntry {
                strikes: 0,
                reasons: Vec::new(),
                last_flagged: arrived_at,
            });
            entry.strikes += 1;
            entry.reasons.push(reason.clone());
            entry.last_flagged = arrived_at;
            entry.strikes
        };
        if strikes == 1 {
            info!(miner = %miner, %reason, "Miner added to coordination watchlist");
        }

        if strikes >= self.reject_strikes {
            warn!(miner = %miner, strikes, "Coordination strikes exhausted");
            Finding::Reject {
                flag: "coordination_detected".into(),
                reason: format!("{strikes} coordination strikes, latest: {reason}"),
            }
        } else {
            Finding::Penalty {
                factor: self.penalty,
                flag: "coordination_suspected".into(),
            }
        }
    }
}

#[derive(Debug, Default)]
struct FarmingHistory {
    recent: VecDeque<(DateTime<Utc>, PatternType, CoarseShape)>,
    limited_until: Option<DateTime<Utc>>,
}

/// Rate-limits miners submitting many structurally similar patterns.
pub struct FarmingDetector {
    threshold: usize,
    window: Duration,
    similarity: f64,
    history: DashMap<String, FarmingHistory>,
}

impl FarmingDetector {
    pub fn new(config: &GamingConfig, similarity: f64) -> Self {
        Self {
            threshold: config.farming_threshold,
            window: Duration::seconds(config.farming_window_secs),
            similarity,
            history: DashMap::new(),
        }
    }

    /// Whether `miner` is inside a rate-limit window at `now`.
    pub fn is_limited(&self, miner: &str, now: DateTime<Utc>) -> bool {
        self.history
            .get(miner)
            .and_then(|h| h.limited_until)
            .is_some_and(|until| now < until)
    }

    pub fn prune(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.history.retain(|_, h| {
            while h.recent.front().is_some_and(|(t, _, _)| now - *t > window) {
                h.recent.pop_front();
            }
            !h.recent.is_empty() || h.limited_until.is_some_and(|until| now < until)
        });
    }
}

impl Detector for FarmingDetector {
    fn name(&self) -> &str { "pattern_farming" }

    fn evaluate(&self, ctx: &GamingContext<'_>) -> Finding {
        let now = ctx.submission.arrived_at;
        let pattern_type = ctx.classified.classification.pattern_type;
        let shape = ctx.signature.shape;

        let mut history = self.history.entry(ctx.submission.miner_hotkey.clone()).or_default();
        while history.recent.front().is_some_and(|(t, _, _)| now - *t > self.window) {
            history.recent.pop_front();
        }
        let similar = history
            .recent
            .iter()
            .filter(|(_, t, s)| *t == pattern_type && s.similarity(&shape) >= self.similarity)
            .count();
        history.recent.push_back((now, pattern_type, shape));

        if similar + 1 > self.threshold {
            history.limited_until = Some(now + self.window);
            Finding::Reject {
                flag: "pattern_farming".into(),
                reason: format!("{} similar patterns within {}s", similar + 1, self.window.num_seconds()),
            }
        } else {
            Finding::Clear
        }
    }
}
