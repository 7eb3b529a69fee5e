pub mod schema;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::core::{Disposition, StoredPattern};
use crate::error::StoreError;
use crate::oracle::rpc::RateLimiter;
use crate::reputation::MinerReputation;

/// Aggregate view over stored patterns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub total: usize,
    pub by_disposition: BTreeMap<String, usize>,
    pub duplicates: usize,
    /// Mean score over scored patterns only.
    pub average_score: f64,
    pub distinct_miners: usize,
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    #[cfg(test)]
    pub fn store_pattern(&self, record: &StoredPattern) -> Result<(), StoreError> {
        self.lock()?.store_pattern(record)
    }

    /// Stores patterns and reputation snapshots in a single transaction.
    pub fn store_batch(&self, patterns: &[StoredPattern], reputations: &[MinerReputation]) -> Result<(), StoreError> {
        self.lock()?.store_batch(patterns, reputations)
    }

    pub fn get_pattern(&self, pattern_id: &str) -> Result<Option<StoredPattern>, StoreError> {
        self.lock()?.get_pattern(pattern_id)
    }

    pub fn get_patterns_by_hash(&self, pattern_hash: &str) -> Result<Vec<StoredPattern>, StoreError> {
        self.lock()?.get_patterns_by_hash(pattern_hash)
    }

    pub fn get_patterns_by_miner(&self, miner: &str, limit: usize) -> Result<Vec<StoredPattern>, StoreError> {
        self.lock()?.get_patterns_by_miner(miner, limit)
    }

    pub fn get_patterns_by_disposition(
        &self,
        disposition: Disposition,
        limit: usize,
    ) -> Result<Vec<StoredPattern>, StoreError> {
        self.lock()?.get_patterns_by_disposition(disposition, limit)
    }

    pub fn get_pattern_count(&self) -> Result<usize, StoreError> {
        self.lock()?.get_pattern_count()
    }

    pub fn get_statistics(&self) -> Result<PatternStatistics, StoreError> {
        self.lock()?.get_statistics()
    }

    pub fn save_reputation(&self, reputation: &MinerReputation) -> Result<(), StoreError> {
        self.lock()?.save_reputation(reputation)
    }

    pub fn load_reputations(&self) -> Result<Vec<MinerReputation>, StoreError> {
        self.lock()?.load_reputations()
    }
}

const INSERT_PATTERN: &str = "INSERT OR IGNORE INTO patterns (
        pattern_id, pattern_hash, miner_hotkey, validator_hotkey, blockchain, asset_symbol,
        pattern_type, disposition, reason, pattern_score, credit_multiplier, is_duplicate,
        arrival_sequence, arrived_at, adjudicated_at, record)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

const UPSERT_REPUTATION: &str = "INSERT OR REPLACE INTO miner_reputation
        (miner_hotkey, reputation_multiplier, state, updated_at)
     VALUES (?1, ?2, ?3, ?4)";

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Records are write-once: a second write of the same id is ignored.
    #[cfg(test)]
    pub fn store_pattern(&self, record: &StoredPattern) -> Result<(), StoreError> {
        self.store_batch(std::slice::from_ref(record), &[])
    }

    pub fn store_batch(&self, patterns: &[StoredPattern], reputations: &[MinerReputation]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_PATTERN)?;
            for p in patterns {
                let record = serde_json::to_string(p)?;
                stmt.execute(rusqlite::params![
                    p.pattern_id,
                    p.pattern_hash,
                    p.miner_hotkey,
                    p.validator_hotkey,
                    p.blockchain,
                    p.asset_symbol,
                    p.pattern_type.as_str(),
                    p.disposition.as_str(),
                    p.reason,
                    p.pattern_score,
                    p.credit_multiplier,
                    p.is_duplicate as i32,
                    p.arrival_sequence as i64,
                    p.arrived_at.to_rfc3339(),
                    p.adjudicated_at.to_rfc3339(),
                    record,
                ])?;
            }
            let mut stmt = tx.prepare_cached(UPSERT_REPUTATION)?;
            for r in reputations {
                let state = serde_json::to_string(r)?;
                stmt.execute(rusqlite::params![
                    r.miner_hotkey,
                    r.reputation_multiplier,
                    state,
                    r.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn decode_patterns(rows: Vec<String>) -> Result<Vec<StoredPattern>, StoreError> {
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    pub fn get_pattern(&self, pattern_id: &str) -> Result<Option<StoredPattern>, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM patterns WHERE pattern_id = ?1",
                rusqlite::params![pattern_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    pub fn get_patterns_by_hash(&self, pattern_hash: &str) -> Result<Vec<StoredPattern>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM patterns WHERE pattern_hash = ?1 ORDER BY arrival_sequence")?;
        let rows = stmt
            .query_map(rusqlite::params![pattern_hash], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Self::decode_patterns(rows)
    }

    /// Most recent first.
    pub fn get_patterns_by_miner(&self, miner: &str, limit: usize) -> Result<Vec<StoredPattern>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM patterns WHERE miner_hotkey = ?1 ORDER BY arrival_sequence DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![miner, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Self::decode_patterns(rows)
    }

    pub fn get_patterns_by_disposition(
        &self,
        disposition: Disposition,
        limit: usize,
    ) -> Result<Vec<StoredPattern>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM patterns WHERE disposition = ?1 ORDER BY arrival_sequence DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![disposition.as_str(), limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Self::decode_patterns(rows)
    }

    pub fn get_pattern_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get::<_, i64>(0))?;
        Ok(count as usize)
    }

    pub fn get_statistics(&self) -> Result<PatternStatistics, StoreError> {
        let mut stats = PatternStatistics::default();

        let mut stmt = self
            .conn
            .prepare("SELECT disposition, COUNT(*) FROM patterns GROUP BY disposition")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (disposition, count) = row?;
            stats.total += count as usize;
            stats.by_disposition.insert(disposition, count as usize);
        }

        let (duplicates, miners): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(is_duplicate), 0), COUNT(DISTINCT miner_hotkey) FROM patterns",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.duplicates = duplicates as usize;
        stats.distinct_miners = miners as usize;

        let average: Option<f64> = self.conn.query_row(
            "SELECT AVG(pattern_score) FROM patterns WHERE disposition IN (?1, ?2)",
            rusqlite::params![
                Disposition::Accepted.as_str(),
                Disposition::SharedDiscovery.as_str()
            ],
            |row| row.get(0),
        )?;
        stats.average_score = average.unwrap_or(0.0);
        Ok(stats)
    }

    pub fn save_reputation(&self, reputation: &MinerReputation) -> Result<(), StoreError> {
        self.store_batch(&[], std::slice::from_ref(reputation))
    }

    pub fn load_reputations(&self) -> Result<Vec<MinerReputation>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT state FROM miner_reputation")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

/// Work for the background writer.
#[derive(Debug)]
pub enum StoreCommand {
    Pattern(Box<StoredPattern>),
    Reputation(Box<MinerReputation>),
}

/// Sending side of the writer queue. Sends wait while the queue is full.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub async fn store_pattern(&self, record: StoredPattern) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Pattern(Box::new(record)))
            .await
            .map_err(|_| StoreError::Closed)
    }

    pub async fn save_reputation(&self, reputation: MinerReputation) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Reputation(Box::new(reputation)))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Writes still waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriterStats {
    pub patterns_written: u64,
    pub reputations_written: u64,
    pub failed_batches: u64,
}

/// Starts the background writer. It drains the queue in batches, paces
/// pattern writes to the configured rate and exits once every handle is
/// dropped and the queue is empty.
pub fn spawn_writer(db: SharedDatabase, config: &DatabaseConfig) -> (StoreHandle, JoinHandle<WriterStats>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let limiter = RateLimiter::per_minute(config.writes_per_minute);
    let batch_size = config.batch_size.max(1);
    let handle = tokio::spawn(run_writer(db, rx, limiter, batch_size));
    (StoreHandle { tx }, handle)
}

async fn run_writer(
    db: SharedDatabase,
    mut rx: mpsc::Receiver<StoreCommand>,
    limiter: RateLimiter,
    batch_size: usize,
) -> WriterStats {
    let mut stats = WriterStats::default();

    while let Some(first) = rx.recv().await {
        let mut commands = vec![first];
        while commands.len() < batch_size {
            match rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(_) => break,
            }
        }

        let mut patterns = Vec::new();
        let mut reputations = Vec::new();
        for command in commands {
            match command {
                StoreCommand::Pattern(p) => {
                    limiter.acquire().await;
                    patterns.push(*p);
                }
                StoreCommand::Reputation(r) => reputations.push(*r),
            }
        }

        let (pattern_count, reputation_count) = (patterns.len() as u64, reputations.len() as u64);
        let db = db.clone();
        let result = tokio::task::spawn_blocking(move || db.store_batch(&patterns, &reputations)).await;
        match result {
            Ok(Ok(())) => {
                stats.patterns_written += pattern_count;
                stats.reputations_written += reputation_count;
                debug!(patterns = pattern_count, reputations = reputation_count, "Batch stored");
            }
            Ok(Err(e)) => {
                stats.failed_batches += 1;
                error!("Failed to store batch of {pattern_count} patterns: {e}");
            }
            Err(e) => {
                stats.failed_batches += 1;
                error!("Store task failed: {e}");
            }
        }
    }

    info!(
        patterns = stats.patterns_written,
        reputations = stats.reputations_written,
        failed_batches = stats.failed_batches,
        "Store writer stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::triangle;
    use crate::core::{PatternType, Submission};
    use crate::reputation::ReputationEvent;
    use crate::config::ReputationConfig;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn open_test_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "pattern_validator_test_{}_{}.db",
            std::process::id(),
            id
        ));
        // Remove if leftover from previous run
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn record(id: &str, miner: &str, sequence: u64, disposition: Disposition, score: f64) -> StoredPattern {
        let submission = Submission {
            miner_hotkey: miner.into(),
            pattern: triangle("0x"),
            sequence,
            arrived_at: DateTime::from_timestamp(1_700_000_000 + sequence as i64, 0).unwrap(),
        };
        let mut r = StoredPattern::terminal(&submission, id.into(), format!("hash-{id}"), "v", disposition, "test");
        r.pattern_score = score;
        r.pattern_type = PatternType::CircularTransfer;
        r.is_duplicate = disposition == Disposition::Duplicate;
        r
    }

    #[test]
    fn store_and_fetch_pattern() {
        let db = open_test_db();
        let r = record("p1", "m1", 1, Disposition::Accepted, 0.7);
        db.store_pattern(&r).unwrap();
        let found = db.get_pattern("p1").unwrap().unwrap();
        assert_eq!(found, r);
        assert!(db.get_pattern("missing").unwrap().is_none());
        assert_eq!(db.get_patterns_by_hash("hash-p1").unwrap().len(), 1);
    }

    #[test]
    fn records_are_write_once() {
        let db = open_test_db();
        db.store_pattern(&record("p1", "m1", 1, Disposition::Accepted, 0.7)).unwrap();
        db.store_pattern(&record("p1", "m1", 1, Disposition::Duplicate, 0.0)).unwrap();
        assert_eq!(db.get_pattern_count().unwrap(), 1);
        assert_eq!(db.get_pattern("p1").unwrap().unwrap().disposition, Disposition::Accepted);
    }

    #[test]
    fn query_by_miner_and_disposition() {
        let db = open_test_db();
        let batch = vec![
            record("p1", "m1", 1, Disposition::Accepted, 0.8),
            record("p2", "m1", 2, Disposition::Duplicate, 0.0),
            record("p3", "m2", 3, Disposition::SharedDiscovery, 0.4),
        ];
        db.store_batch(&batch, &[]).unwrap();

        let m1 = db.get_patterns_by_miner("m1", 10).unwrap();
        assert_eq!(m1.len(), 2);
        assert_eq!(m1[0].pattern_id, "p2");

        let dups = db.get_patterns_by_disposition(Disposition::Duplicate, 10).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].pattern_id, "p2");
    }

    #[test]
    fn statistics() {
        let db = open_test_db();
        let batch = vec![
            record("p1", "m1", 1, Disposition::Accepted, 0.8),
            record("p2", "m1", 2, Disposition::Duplicate, 0.0),
            record("p3", "m2", 3, Disposition::SharedDiscovery, 0.4),
        ];
        db.store_batch(&batch, &[]).unwrap();
        let stats = db.get_statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_disposition.get("duplicate"), Some(&1));
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.distinct_miners, 2);
        assert!((stats.average_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn statistics_empty() {
        let db = open_test_db();
        assert_eq!(db.get_statistics().unwrap(), PatternStatistics::default());
    }

    #[test]
    fn reputation_roundtrip_overwrites() {
        let db = open_test_db();
        let now = Utc::now();
        let mut rep = MinerReputation::new("m1", now);
        db.save_reputation(&rep).unwrap();
        let event = ReputationEvent {
            disposition: Disposition::Accepted,
            final_score: 0.9,
            is_historical: Some(true),
            gaming_flags: 0,
        };
        rep.update(&event, &ReputationConfig::default(), now);
        db.save_reputation(&rep).unwrap();

        let loaded = db.load_reputations().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].total_patterns_submitted, 1);
        assert_eq!(loaded[0].reputation_multiplier, rep.reputation_multiplier);
    }

    #[tokio::test]
    async fn writer_drains_queue_before_exit() {
        let db = open_test_db();
        let config = DatabaseConfig {
            writes_per_minute: 60_000,
            batch_size: 2,
            ..DatabaseConfig::default()
        };
        let (handle, writer) = spawn_writer(db.clone(), &config);
        for i in 0..5 {
            handle
                .store_pattern(record(&format!("p{i}"), "m1", i, Disposition::Accepted, 0.5))
                .await
                .unwrap();
        }
        handle.save_reputation(MinerReputation::new("m1", Utc::now())).await.unwrap();
        drop(handle);

        let stats = writer.await.unwrap();
        assert_eq!(stats.patterns_written, 5);
        assert_eq!(stats.reputations_written, 1);
        assert_eq!(db.get_pattern_count().unwrap(), 5);
        assert_eq!(db.load_reputations().unwrap().len(), 1);
    }
}
