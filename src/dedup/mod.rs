pub mod signature;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config::DedupConfig;
pub use signature::{pattern_hash, StructuralSignature};

/// The label-free identity of a pattern: its Level-1 hash and its
/// structural signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub pattern_hash: String,
    pub signature: StructuralSignature,
}

/// What the index retains about an accepted-for-indexing pattern.
#[derive(Debug, Clone)]
pub struct IndexedPattern {
    pub pattern_id: String,
    pub fingerprint: Fingerprint,
    pub miner_hotkey: String,
    pub arrived_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Arrival order; pruned from the front.
    entries: VecDeque<IndexedPattern>,
    by_hash: HashMap<String, String>,
}

impl Bucket {
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|e| e.arrived_at < cutoff) {
            if let Some(e) = self.entries.pop_front() {
                if self.by_hash.get(&e.fingerprint.pattern_hash) == Some(&e.pattern_id) {
                    self.by_hash.remove(&e.fingerprint.pattern_hash);
                }
                removed += 1;
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    /// Level 1: identical canonical hash.
    Exact,
    /// Level 3: near-isomorphic after a Level-2 candidate hit.
    Similar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateOf {
    pub pattern_id: String,
    pub miner_hotkey: String,
    pub level: MatchLevel,
    pub similarity: f64,
}

/// An indexed pattern resembling the candidate without being a duplicate.
#[derive(Debug, Clone, PartialEq)]
pub struct NearMatch {
    pub pattern_id: String,
    pub miner_hotkey: String,
    pub arrived_at: DateTime<Utc>,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupCheck {
    /// `None` means unique; the candidate has been indexed.
    pub duplicate_of: Option<DuplicateOf>,
    pub near_matches: Vec<NearMatch>,
    /// Highest similarity to any related indexed pattern, the matched
    /// original included.
    pub max_similarity: f64,
    /// Level-2 candidates that went on to Level 3.
    pub candidates_checked: usize,
}

impl DedupCheck {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// Rolling index of recent patterns, partitioned by chain.
///
/// Classification plays no part in the partition, so a relabeled copy
/// always meets its original. Each chain's bucket is updated under its own
/// shard lock: a check and the following insert are atomic per chain while
/// other chains proceed in parallel.
pub struct DedupIndex {
    buckets: DashMap<String, Bucket>,
    similarity_threshold: f64,
    candidate_threshold: f64,
    near_threshold: f64,
    retention: Duration,
}

impl DedupIndex {
    pub fn new(config: &DedupConfig, near_threshold: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            similarity_threshold: config.similarity_threshold,
            candidate_threshold: config.candidate_threshold,
            near_threshold: near_threshold.min(config.similarity_threshold),
            retention: Duration::seconds(config.retention_secs),
        }
    }

    /// Level-3 similarity when `b` is a Level-2 candidate for `a` and
    /// scores at least the near-match threshold.
    fn related_similarity(&self, a: &StructuralSignature, b: &StructuralSignature) -> Option<f64> {
        if a.coarse_similarity(b) < self.candidate_threshold {
            return None;
        }
        let similarity = a.detailed_similarity(b);
        (similarity >= self.near_threshold).then_some(similarity)
    }

    /// Whether either pattern can change the other's check: the same
    /// hash, or a Level-3 score at or above the near-match threshold.
    /// Unrelated patterns never need to be ordered against each other.
    pub fn related(&self, a: &Fingerprint, b: &Fingerprint) -> bool {
        a.pattern_hash == b.pattern_hash || self.related_similarity(&a.signature, &b.signature).is_some()
    }

    /// Runs the three-level cascade and indexes the candidate if unique.
    /// Only related entries shape the result.
    pub fn check_and_register(&self, chain: &str, candidate: IndexedPattern) -> DedupCheck {
        let mut bucket = self.buckets.entry(chain.to_string()).or_default();
        bucket.prune(candidate.arrived_at - self.retention);

        if let Some(existing_id) = bucket.by_hash.get(&candidate.fingerprint.pattern_hash) {
            let existing = bucket.entries.iter().find(|e| &e.pattern_id == existing_id);
            let miner_hotkey = existing.map(|e| e.miner_hotkey.clone()).unwrap_or_default();
            return DedupCheck {
                duplicate_of: Some(DuplicateOf {
                    pattern_id: existing_id.clone(),
                    miner_hotkey,
                    level: MatchLevel::Exact,
                    similarity: 1.0,
                }),
                near_matches: Vec::new(),
                max_similarity: 1.0,
                candidates_checked: 0,
            };
        }

        let signature = &candidate.fingerprint.signature;
        let mut candidates_checked = 0;
        let mut best: Option<(f64, &IndexedPattern)> = None;
        let mut near_matches = Vec::new();
        for entry in &bucket.entries {
            if signature.coarse_similarity(&entry.fingerprint.signature) >= self.candidate_threshold {
                candidates_checked += 1;
            }
            let Some(similarity) = self.related_similarity(signature, &entry.fingerprint.signature) else {
                continue;
            };
            if similarity >= self.similarity_threshold {
                if best.is_none_or(|(s, _)| similarity > s) {
                    best = Some((similarity, entry));
                }
            } else {
                near_matches.push(NearMatch {
                    pattern_id: entry.pattern_id.clone(),
                    miner_hotkey: entry.miner_hotkey.clone(),
                    arrived_at: entry.arrived_at,
                    similarity,
                });
            }
        }

        let max_similarity = best
            .map(|(s, _)| s)
            .into_iter()
            .chain(near_matches.iter().map(|m| m.similarity))
            .fold(0.0, f64::max);
        let duplicate_of = best.map(|(similarity, e)| DuplicateOf {
            pattern_id: e.pattern_id.clone(),
            miner_hotkey: e.miner_hotkey.clone(),
            level: MatchLevel::Similar,
            similarity,
        });

        if duplicate_of.is_none() {
            bucket.by_hash.insert(
                candidate.fingerprint.pattern_hash.clone(),
                candidate.pattern_id.clone(),
            );
            bucket.entries.push_back(candidate);
        }

        DedupCheck {
            duplicate_of,
            near_matches,
            max_similarity,
            candidates_checked,
        }
    }

    /// Drops entries older than the retention window. Returns how many.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            removed += bucket.prune(cutoff);
            !bucket.entries.is_empty()
        });
        if removed > 0 {
            debug!(removed, "Pruned dedup index");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }
}
