use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::protocol::{PatternQueryAck, PatternResponse};
use crate::core::{ClassifiedPattern, DetectedPattern, Disposition, GraphLimits, StoredPattern, Submission};
use crate::db::StoreHandle;
use crate::dedup::{pattern_hash, DedupIndex, Fingerprint, IndexedPattern, StructuralSignature};
use crate::discovery::{Credit, DiscoveryRegistry, Sequencer, Ticket};
use crate::error::PipelineError;
use crate::gaming::{GamingContext, GamingSuite};
use crate::oracle::OracleRegistry;
use crate::reputation::{self, MinerReputation, ReputationEvent, ReputationTracker};
use crate::signals::classify::classify;
use crate::signals::rules::ScoreInput;
use crate::signals::ScoreEngine;
use crate::verifier::Verifier;

/// A submission that passed admission and holds its place in the arrival
/// order among related submissions on its chain.
pub struct Admitted {
    submission: Submission,
    pattern_id: String,
    pattern_hash: String,
    classified: ClassifiedPattern,
    signature: StructuralSignature,
    chain: String,
    ticket: Ticket<String, Fingerprint>,
}

impl Admitted {
    pub fn sequence(&self) -> u64 {
        self.submission.sequence
    }
}

/// Terminal result of one submission.
#[derive(Debug, Clone)]
pub struct Adjudicated {
    pub record: StoredPattern,
    /// Updated reputation to persist, when the outcome counted toward it.
    pub reputation: Option<MinerReputation>,
    pub ack: PatternQueryAck,
}

pub enum Admission {
    Admitted(Box<Admitted>),
    Rejected(Box<Adjudicated>),
}

/// Owns every piece of shared adjudication state. Patterns meet at the
/// dedup index, partitioned by chain, and the discovery registry; only
/// related ones are ordered against each other.
pub struct Adjudicator {
    validator_hotkey: String,
    max_patterns_per_response: usize,
    limits: GraphLimits,
    miner_quota: usize,
    verifier: Verifier,
    dedup: DedupIndex,
    registry: DiscoveryRegistry,
    sequencer: Sequencer<String, Fingerprint>,
    gaming: GamingSuite,
    reputation: ReputationTracker,
    scorer: ScoreEngine,
    /// Admission times per miner over the last hour.
    quota: DashMap<String, VecDeque<DateTime<Utc>>>,
    next_sequence: AtomicU64,
    retention: chrono::Duration,
}

impl Adjudicator {
    pub fn new(config: &Config, oracles: OracleRegistry) -> Self {
        Self {
            validator_hotkey: config.validator.hotkey.clone(),
            max_patterns_per_response: config.ingress.max_patterns_per_response,
            limits: config.ingress.limits(),
            miner_quota: config.ingress.miner_patterns_per_hour,
            verifier: Verifier::new(oracles, &config.verification),
            dedup: DedupIndex::new(&config.dedup, config.gaming.coordination_threshold),
            registry: DiscoveryRegistry::new(config.discovery.grace_period_secs),
            sequencer: Sequencer::new(),
            gaming: GamingSuite::new(&config.gaming, &config.dedup),
            reputation: ReputationTracker::new(&config.reputation),
            scorer: ScoreEngine::new(&config.scoring),
            quota: DashMap::new(),
            next_sequence: AtomicU64::new(1),
            retention: chrono::Duration::seconds(config.dedup.retention_secs),
        }
    }

    pub fn reputation(&self) -> &ReputationTracker {
        &self.reputation
    }

    pub fn gaming(&self) -> &GamingSuite {
        &self.gaming
    }

    /// Cheap, synchronous checks run in arrival order. Every pattern gets
    /// its arrival sequence here, before any suspension point.
    pub fn admit(&self, response: PatternResponse, arrived_at: DateTime<Utc>) -> Vec<Admission> {
        let miner = response.miner_hotkey.clone();
        debug!(miner = %miner, patterns = response.pattern_count(), "Response received");
        let (admitted, overflow) = response.split_at_cap(self.max_patterns_per_response);
        if !overflow.is_empty() {
            warn!(miner = %miner, overflow = overflow.len(), "Response exceeds pattern cap");
        }

        let mut admissions = Vec::with_capacity(admitted.len() + overflow.len());
        for pattern in admitted {
            admissions.push(self.admit_one(&miner, pattern, arrived_at));
        }
        for pattern in overflow {
            let submission = self.submission(&miner, pattern, arrived_at);
            let reason = format!("more than {} patterns in one response", self.max_patterns_per_response);
            admissions.push(Admission::Rejected(Box::new(self.reject(
                &submission,
                String::new(),
                Disposition::ResponseCapExceeded,
                reason,
            ))));
        }
        admissions
    }

    fn submission(&self, miner: &str, pattern: DetectedPattern, arrived_at: DateTime<Utc>) -> Submission {
        Submission {
            miner_hotkey: miner.to_string(),
            pattern,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            arrived_at,
        }
    }

    fn admit_one(&self, miner: &str, pattern: DetectedPattern, arrived_at: DateTime<Utc>) -> Admission {
        let submission = self.submission(miner, pattern, arrived_at);

        if let Err(e) = submission.pattern.validate(self.limits) {
            let disposition = if e.is_oversized() {
                Disposition::OversizedGraph
            } else {
                Disposition::MalformedGraph
            };
            debug!(miner, %disposition, "Pattern rejected at ingress: {e}");
            return Admission::Rejected(Box::new(self.reject(&submission, String::new(), disposition, e.to_string())));
        }

        let hash = pattern_hash(&submission.pattern);
        if self.gaming.is_rate_limited(miner, arrived_at) {
            return Admission::Rejected(Box::new(self.reject(
                &submission,
                hash,
                Disposition::RateLimited,
                "rate limited for pattern farming",
            )));
        }
        if !self.take_quota(miner, arrived_at) {
            return Admission::Rejected(Box::new(self.reject(
                &submission,
                hash,
                Disposition::RateLimited,
                format!("more than {} patterns per hour", self.miner_quota),
            )));
        }

        let classification = classify(&submission.pattern.transaction_graph);
        let signature = StructuralSignature::of(&submission.pattern.transaction_graph);
        let chain = submission.pattern.chain_key();
        let fingerprint = Fingerprint {
            pattern_hash: hash.clone(),
            signature: signature.clone(),
        };
        let ticket = self
            .sequencer
            .reserve(chain.clone(), submission.sequence, fingerprint, |a, b| self.dedup.related(a, b));
        let pattern_id = Uuid::new_v4().to_string();
        debug!(
            miner,
            pattern_id = %pattern_id,
            sequence = submission.sequence,
            pattern_type = %classification.pattern_type,
            waits_on = ?ticket.waits_on(),
            "Pattern admitted"
        );

        Admission::Admitted(Box::new(Admitted {
            classified: ClassifiedPattern {
                pattern: submission.pattern.clone(),
                classification,
            },
            submission,
            pattern_id,
            pattern_hash: hash,
            signature,
            chain,
            ticket,
        }))
    }

    /// Sliding one-hour window per miner.
    fn take_quota(&self, miner: &str, now: DateTime<Utc>) -> bool {
        let mut window = self.quota.entry(miner.to_string()).or_default();
        let cutoff = now - chrono::Duration::hours(1);
        while window.front().is_some_and(|&t| t <= cutoff) {
            window.pop_front();
        }
        if window.len() >= self.miner_quota {
            return false;
        }
        window.push_back(now);
        true
    }

    fn reject(
        &self,
        submission: &Submission,
        hash: String,
        disposition: Disposition,
        reason: impl Into<String>,
    ) -> Adjudicated {
        let record = StoredPattern::terminal(
            submission,
            Uuid::new_v4().to_string(),
            hash,
            &self.validator_hotkey,
            disposition,
            reason,
        );
        self.finish(record, None)
    }

    /// Verification, then ordered dedup and arbitration, gaming and scoring.
    pub async fn adjudicate(&self, admitted: Admitted) -> Adjudicated {
        let fallback = self.internal_record(&admitted, "adjudication failed");
        match self.try_adjudicate(admitted).await {
            Ok(done) => done,
            Err(e) => {
                error!(pattern_id = %fallback.pattern_id, "Internal error: {e}");
                let mut record = fallback;
                record.reason = Some(e.to_string());
                self.finish(record, None)
            }
        }
    }

    fn internal_record(&self, admitted: &Admitted, reason: &str) -> StoredPattern {
        StoredPattern::terminal(
            &admitted.submission,
            admitted.pattern_id.clone(),
            admitted.pattern_hash.clone(),
            &self.validator_hotkey,
            Disposition::InternalError,
            reason,
        )
    }

    async fn try_adjudicate(&self, admitted: Admitted) -> Result<Adjudicated, PipelineError> {
        let Admitted {
            submission,
            pattern_id,
            pattern_hash,
            classified,
            signature,
            chain,
            ticket,
        } = admitted;

        let mut record = StoredPattern::terminal(
            &submission,
            pattern_id.clone(),
            pattern_hash.clone(),
            &self.validator_hotkey,
            Disposition::Accepted,
            "",
        );
        record.reason = None;
        record.pattern_type = classified.classification.pattern_type;
        record.classification_confidence = classified.classification.confidence;

        let verification = self.verifier.verify(&pattern_id, &submission.pattern).await;
        record.verification = Some(verification.clone());
        if !verification.is_valid {
            drop(ticket);
            record.disposition = Disposition::VerificationFailed;
            record.reason = Some(
                verification
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "no transaction could be verified".into()),
            );
            return Ok(self.finish(record, None));
        }

        // Index and registry are touched in arrival order among related
        // patterns.
        ticket.wait_turn().await?;
        let check = self.dedup.check_and_register(
            &chain,
            IndexedPattern {
                pattern_id: pattern_id.clone(),
                fingerprint: Fingerprint {
                    pattern_hash,
                    signature: signature.clone(),
                },
                miner_hotkey: submission.miner_hotkey.clone(),
                arrived_at: submission.arrived_at,
            },
        );
        let credit = match &check.duplicate_of {
            None => self.registry.register_first(
                &pattern_id,
                &submission.miner_hotkey,
                submission.sequence,
                submission.arrived_at,
            ),
            Some(original) => self.registry.arbitrate(
                &original.pattern_id,
                &submission.miner_hotkey,
                submission.sequence,
                submission.arrived_at,
            )?,
        };
        drop(ticket);

        record.is_duplicate = check.is_duplicate();
        record.similar_patterns = check
            .duplicate_of
            .iter()
            .map(|d| d.pattern_id.clone())
            .chain(check.near_matches.iter().map(|m| m.pattern_id.clone()))
            .collect();
        record.credit_multiplier = credit.multiplier();

        let is_historical = reputation::is_historical(
            &submission.pattern.transaction_graph,
            submission.arrived_at,
            self.reputation.recent_window(),
        );

        if matches!(credit, Credit::Late | Credit::Resubmission) {
            record.disposition = Disposition::Duplicate;
            record.reason = check
                .duplicate_of
                .as_ref()
                .map(|d| format!("{:?} of {} ({credit:?})", d.level, d.pattern_id));
            return Ok(self.finish(record, Some(is_historical)));
        }

        let report = self.gaming.evaluate(&GamingContext {
            submission: &submission,
            classified: &classified,
            signature: &signature,
            verification: &verification,
            dedup: &check,
        });
        record.gaming_flags = report.flags.clone();
        if report.is_rejected() {
            record.disposition = Disposition::GamingRejected;
            record.reason = report.rejection_reason();
            return Ok(self.finish(record, Some(is_historical)));
        }

        let mut input = ScoreInput::from_pattern(
            &classified,
            self.scorer.volume_reference(&submission.pattern.asset_symbol),
        );
        input.is_historical = is_historical;
        input.miner_historical_ratio = self.reputation.historical_ratio_for(&submission.miner_hotkey);
        input.max_similarity = check.max_similarity;

        let breakdown = self.scorer.score(
            &input,
            self.reputation.multiplier_for(&submission.miner_hotkey),
            report.multiplier,
            credit.multiplier(),
        );
        record.pattern_score = breakdown.final_score;
        record.scores = Some(breakdown);
        record.disposition = match credit {
            Credit::Partial => Disposition::SharedDiscovery,
            _ => Disposition::Accepted,
        };
        Ok(self.finish(record, Some(is_historical)))
    }

    /// Folds the outcome into the miner's reputation and builds the ack.
    /// Cap overflow and rate limiting say nothing about pattern quality and
    /// leave reputation alone.
    fn finish(&self, mut record: StoredPattern, is_historical: Option<bool>) -> Adjudicated {
        if !record.disposition.is_scored() {
            record.pattern_score = 0.0;
            record.credit_multiplier = 0.0;
        }
        record.adjudicated_at = Utc::now();

        let reputation = match record.disposition {
            Disposition::ResponseCapExceeded | Disposition::RateLimited => None,
            disposition => {
                let event = ReputationEvent {
                    disposition,
                    final_score: record.pattern_score,
                    is_historical,
                    gaming_flags: record.gaming_flags.len(),
                };
                let (state, delta) = self.reputation.record(&record.miner_hotkey, &event, record.adjudicated_at);
                record.miner_reputation_delta = delta;
                Some(state)
            }
        };

        let ack = PatternQueryAck {
            pattern_id: record.pattern_id.clone(),
            disposition: record.disposition.as_str().to_string(),
        };
        debug!(
            pattern_id = %record.pattern_id,
            miner = %record.miner_hotkey,
            disposition = %record.disposition,
            score = record.pattern_score,
            "Pattern adjudicated"
        );
        Adjudicated {
            record,
            reputation,
            ack,
        }
    }

    /// Drops index, registry and detector state older than the retention.
    pub fn prune(&self, now: DateTime<Utc>) {
        let indexed = self.dedup.prune(now);
        let records = self.registry.prune(now, self.retention);
        self.gaming.prune(now);
        let cutoff = now - chrono::Duration::hours(1);
        self.quota.retain(|_, window| window.back().is_some_and(|&t| t > cutoff));
        if indexed > 0 || records > 0 {
            debug!(indexed, records, "Pruned adjudication state");
        }
    }
}

/// Running totals for the progress log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub responses: u64,
    pub adjudicated: u64,
    pub accepted: u64,
    pub shared: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub internal_errors: u64,
}

impl PipelineStats {
    fn count(&mut self, disposition: Disposition) {
        self.adjudicated += 1;
        match disposition {
            Disposition::Accepted => self.accepted += 1,
            Disposition::SharedDiscovery => self.shared += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::InternalError => self.internal_errors += 1,
            _ => self.rejected += 1,
        }
    }
}

/// Run the pipeline: receive miner responses, adjudicate their patterns
/// concurrently and hand every record to storage.
pub async fn run_pipeline(
    mut rx: mpsc::Receiver<PatternResponse>,
    adjudicator: Arc<Adjudicator>,
    store: StoreHandle,
    prune_interval: Duration,
) -> PipelineStats {
    let mut stats = PipelineStats::default();
    let mut in_flight: JoinSet<Adjudicated> = JoinSet::new();
    let mut prune = tokio::time::interval(prune_interval);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut open = true;

    info!("Pipeline started, waiting for pattern responses...");

    while open || !in_flight.is_empty() {
        tokio::select! {
            response = rx.recv(), if open => {
                let Some(response) = response else {
                    info!("Ingress closed, draining {} in-flight patterns", in_flight.len());
                    open = false;
                    continue;
                };
                stats.responses += 1;
                for admission in adjudicator.admit(response, Utc::now()) {
                    match admission {
                        Admission::Rejected(done) => deliver(*done, &store, &mut stats).await,
                        Admission::Admitted(admitted) => {
                            spawn_adjudication(&mut in_flight, Arc::clone(&adjudicator), *admitted);
                        }
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok(done) => deliver(done, &store, &mut stats).await,
                    Err(e) => error!("Adjudication task failed: {e}"),
                }
            }
            _ = prune.tick() => adjudicator.prune(Utc::now()),
        }
    }

    info!(
        "Pipeline shutting down after {} responses, {} patterns ({} accepted, {} shared, {} duplicates, {} rejected, {} internal errors)",
        stats.responses,
        stats.adjudicated,
        stats.accepted,
        stats.shared,
        stats.duplicates,
        stats.rejected,
        stats.internal_errors
    );
    stats
}

/// Each adjudication runs in its own task, so a panic is contained and
/// turned into an audit record for that pattern alone.
fn spawn_adjudication(in_flight: &mut JoinSet<Adjudicated>, adjudicator: Arc<Adjudicator>, admitted: Admitted) {
    in_flight.spawn(async move {
        let fallback = adjudicator.internal_record(&admitted, "adjudication task panicked");
        let worker = Arc::clone(&adjudicator);
        match tokio::spawn(async move { worker.adjudicate(admitted).await }).await {
            Ok(done) => done,
            Err(e) => {
                error!(pattern_id = %fallback.pattern_id, "Adjudication task failed: {e}");
                adjudicator.finish(fallback, None)
            }
        }
    });
}

async fn deliver(done: Adjudicated, store: &StoreHandle, stats: &mut PipelineStats) {
    stats.count(done.record.disposition);
    if stats.adjudicated % 100 == 0 {
        info!(
            "Pipeline adjudicated {} patterns ({} accepted, {} duplicates, store backlog {})",
            stats.adjudicated,
            stats.accepted,
            stats.duplicates,
            store.backlog()
        );
    }
    debug!(pattern_id = %done.ack.pattern_id, disposition = %done.ack.disposition, "Ack");

    if let Err(e) = store.store_pattern(done.record).await {
        error!("Failed to queue pattern record: {e}");
    }
    if let Some(reputation) = done.reputation {
        if let Err(e) = store.save_reputation(reputation).await {
            error!("Failed to queue reputation update: {e}");
        }
    }
}
