use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS patterns (
            pattern_id       TEXT PRIMARY KEY,
            pattern_hash     TEXT NOT NULL,
            miner_hotkey     TEXT NOT NULL,
            validator_hotkey TEXT NOT NULL,
            blockchain       TEXT NOT NULL,
            asset_symbol     TEXT NOT NULL,
            pattern_type     TEXT NOT NULL,
            disposition      TEXT NOT NULL,
            reason           TEXT,
            pattern_score    REAL NOT NULL,
            credit_multiplier REAL NOT NULL,
            is_duplicate     INTEGER NOT NULL,
            arrival_sequence INTEGER NOT NULL,
            arrived_at       TEXT NOT NULL,
            adjudicated_at   TEXT NOT NULL,
            record           TEXT NOT NULL -- JSON StoredPattern
        );

        CREATE TABLE IF NOT EXISTS miner_reputation (
            miner_hotkey          TEXT PRIMARY KEY,
            reputation_multiplier REAL NOT NULL,
            state                 TEXT NOT NULL, -- JSON MinerReputation
            updated_at            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_patterns_hash ON patterns(pattern_hash);
        CREATE INDEX IF NOT EXISTS idx_patterns_miner ON patterns(miner_hotkey, arrival_sequence DESC);
        CREATE INDEX IF NOT EXISTS idx_patterns_disposition ON patterns(disposition);
        ",
    )?;
    Ok(())
}
