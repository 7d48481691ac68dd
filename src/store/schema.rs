use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS signals (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_type   TEXT NOT NULL,
            source_height INTEGER NOT NULL,
            confidence    REAL NOT NULL,
            metadata      TEXT NOT NULL, -- JSON, canonical per processor
            day           TEXT NOT NULL, -- creation-day partition
            created_at    TEXT NOT NULL,
            claimed_at    TEXT,
            claim_token   INTEGER,
            attempts      INTEGER NOT NULL DEFAULT 0,
            superseded    INTEGER NOT NULL DEFAULT 0,
            processed     INTEGER NOT NULL DEFAULT 0,
            processed_at  TEXT,
            skip_reason   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_signals_claim
            ON signals(processed, superseded, confidence DESC);
        CREATE INDEX IF NOT EXISTS idx_signals_dedup
            ON signals(signal_type, source_height, created_at);
        CREATE INDEX IF NOT EXISTS idx_signals_day ON signals(day);

        CREATE TABLE IF NOT EXISTS insights (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_id  INTEGER NOT NULL UNIQUE REFERENCES signals(id),
            category   TEXT NOT NULL,
            headline   TEXT NOT NULL,
            summary    TEXT NOT NULL,
            evidence   TEXT NOT NULL, -- JSON array of block/tx references
            confidence REAL NOT NULL,
            day        TEXT NOT NULL,
            created_at TEXT NOT NULL,
            chart_url  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_insights_created ON insights(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_insights_category ON insights(category, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_insights_day ON insights(day);

        CREATE TABLE IF NOT EXISTS entities (
            address   TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            name      TEXT NOT NULL,
            kind      TEXT NOT NULL,
            metadata  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_entities_entity ON entities(entity_id);
        ",
    )?;
    Ok(())
}
