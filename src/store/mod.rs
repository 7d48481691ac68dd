pub mod schema;

use std::cell::Cell;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entities::{EntityKind, EntityRecord};
use crate::processors::{CandidateSignal, SignalType};

/// A citation substantiating an insight's claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum EvidenceRef {
    Block(u64),
    Tx(String),
}

/// A persisted signal as seen by Insight Generator workers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSignal {
    pub id: i64,
    pub signal_type: SignalType,
    pub source_height: u64,
    pub confidence: f64,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub attempts: u32,
    pub superseded: bool,
    pub processed: bool,
}

/// A persisted insight. Immutable after creation except for the chart
/// reference attached later by an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub id: i64,
    pub signal_id: i64,
    pub category: String,
    pub headline: String,
    pub summary: String,
    pub evidence: Vec<EvidenceRef>,
    pub confidence: f64,
    pub created_at: String,
    pub chart_url: Option<String>,
}

/// Result of the atomic insight-write step.
#[derive(Debug, PartialEq, Eq)]
pub enum InsightWriteOutcome {
    Written(i64),
    /// The source signal was superseded by a reorg while the insight was in
    /// flight; the output is discarded.
    Superseded,
    AlreadyProcessed,
    Missing,
}

pub struct Database {
    conn: Connection,
    duplicates: Cell<u64>,
}

/// Thread-safe handle to the signal/insight store. The narrow
/// append/claim/mark surface is the only shared mutable state across
/// pipeline components.
#[derive(Clone)]
pub struct SignalStore {
    inner: Arc<Mutex<Database>>,
}

impl SignalStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// Append one candidate signal. Returns None when the store rejected it
    /// as a duplicate inside the dedup window.
    pub fn append(
        &self,
        candidate: &CandidateSignal,
        dedup_window_secs: u64,
    ) -> Result<Option<i64>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.append(candidate, dedup_window_secs)
    }

    /// Append a poll cycle's signals in one transaction, skipping duplicates.
    pub fn append_batch(
        &self,
        candidates: &[CandidateSignal],
        dedup_window_secs: u64,
    ) -> Result<Vec<i64>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.append_batch(candidates, dedup_window_secs)
    }

    /// Claim up to `limit` unprocessed, unsuperseded signals at or above
    /// `min_confidence`. A live claim blocks other workers; claims older than
    /// `ttl_secs` are considered abandoned and reclaimed. `claim_token` must
    /// be unique per call.
    pub fn claim_unprocessed(
        &self,
        min_confidence: f64,
        limit: usize,
        claim_token: i64,
        ttl_secs: u64,
    ) -> Result<Vec<StoredSignal>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.claim_unprocessed(min_confidence, limit, claim_token, ttl_secs)
    }

    /// Give a failed claim back to the pool and count the attempt.
    pub fn release_claim(&self, signal_id: i64) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.release_claim(signal_id)
    }

    /// Terminal no-insight path: processed=true with a recorded reason.
    pub fn mark_skipped(&self, signal_id: i64, reason: &str) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.mark_skipped(signal_id, reason)
    }

    /// Write the insight and flip the source signal to processed in a single
    /// transaction; a reader never sees one without the other.
    pub fn insert_insight_and_mark(
        &self,
        signal_id: i64,
        category: &str,
        headline: &str,
        summary: &str,
        evidence: &[EvidenceRef],
        confidence: f64,
    ) -> Result<InsightWriteOutcome, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insert_insight_and_mark(signal_id, category, headline, summary, evidence, confidence)
    }

    /// Reorg watermark: flag every signal sourced at or above `from_height`
    /// as superseded. Returns the number of signals invalidated.
    pub fn mark_superseded(&self, from_height: u64) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.mark_superseded(from_height)
    }

    /// Attach a chart reference to an existing insight (the only mutation an
    /// insight admits after creation).
    pub fn attach_chart(&self, insight_id: i64, url: &str) -> Result<bool, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.attach_chart(insight_id, url)
    }

    pub fn insight_for_signal(
        &self,
        signal_id: i64,
    ) -> Result<Option<InsightRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insight_for_signal(signal_id)
    }

    pub fn recent_insights(&self, limit: usize) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.recent_insights(limit)
    }

    pub fn insights_by_category(
        &self,
        category: &str,
        limit: usize,
    ) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insights_by_category(category, limit)
    }

    /// Insights from one UTC day (`YYYY-MM-DD`), newest first, with an
    /// optional confidence floor.
    pub fn insights_for_day(
        &self,
        day: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insights_for_day(day, min_confidence, limit)
    }

    pub fn signal_count(&self) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.signal_count()
    }

    pub fn unprocessed_count(&self) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.unprocessed_count()
    }

    pub fn skip_reason(&self, signal_id: i64) -> Result<Option<String>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.skip_reason(signal_id)
    }

    pub fn duplicate_count(&self) -> u64 {
        let db = self.inner.lock().unwrap();
        db.duplicates.get()
    }

    /// Bulk-load the entity reference table from a CSV file
    /// (entity_id,name,kind,address per line, header skipped).
    pub fn load_entities_from_csv(&self, path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
        let db = self.inner.lock().unwrap();
        db.load_entities_from_csv(path)
    }

    pub fn all_entities(&self) -> Result<Vec<EntityRecord>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.all_entities()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            duplicates: Cell::new(0),
        })
    }

    fn is_duplicate(
        &self,
        candidate: &CandidateSignal,
        metadata: &str,
        dedup_window_secs: u64,
    ) -> Result<bool, rusqlite::Error> {
        let window = format!("-{dedup_window_secs} seconds");
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM signals
                 WHERE signal_type = ?1 AND source_height = ?2 AND metadata = ?3
                   AND created_at >= datetime('now', ?4)
                 LIMIT 1",
                params![
                    candidate.signal_type.as_str(),
                    candidate.source_height as i64,
                    metadata,
                    window
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing.is_some())
    }

    pub fn append(
        &self,
        candidate: &CandidateSignal,
        dedup_window_secs: u64,
    ) -> Result<Option<i64>, rusqlite::Error> {
        let metadata = candidate.metadata.to_string();
        if self.is_duplicate(candidate, &metadata, dedup_window_secs)? {
            self.duplicates.set(self.duplicates.get() + 1);
            debug!(
                signal_type = candidate.signal_type.as_str(),
                height = candidate.source_height,
                "duplicate signal rejected"
            );
            return Ok(None);
        }
        self.conn.execute(
            "INSERT INTO signals (signal_type, source_height, confidence, metadata, day, created_at)
             VALUES (?1, ?2, ?3, ?4, date('now'), datetime('now'))",
            params![
                candidate.signal_type.as_str(),
                candidate.source_height as i64,
                candidate.confidence,
                metadata
            ],
        )?;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn append_batch(
        &self,
        candidates: &[CandidateSignal],
        dedup_window_secs: u64,
    ) -> Result<Vec<i64>, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        let mut ids = Vec::new();
        for c in candidates {
            if let Some(id) = self.append(c, dedup_window_secs)? {
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<StoredSignal> {
        let type_str: String = row.get(1)?;
        let signal_type = SignalType::parse(&type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown signal type {type_str}").into(),
            )
        })?;
        let metadata_str: String = row.get(4)?;
        let metadata = serde_json::from_str(&metadata_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        let superseded: i64 = row.get(7)?;
        let processed: i64 = row.get(8)?;
        Ok(StoredSignal {
            id: row.get(0)?,
            signal_type,
            source_height: row.get::<_, i64>(2)? as u64,
            confidence: row.get(3)?,
            metadata,
            created_at: row.get(5)?,
            attempts: row.get::<_, i64>(6)? as u32,
            superseded: superseded != 0,
            processed: processed != 0,
        })
    }

    const SIGNAL_COLS: &'static str =
        "id, signal_type, source_height, confidence, metadata, created_at, attempts, superseded, processed";

    pub fn claim_unprocessed(
        &self,
        min_confidence: f64,
        limit: usize,
        claim_token: i64,
        ttl_secs: u64,
    ) -> Result<Vec<StoredSignal>, rusqlite::Error> {
        let cutoff = format!("-{ttl_secs} seconds");
        self.conn.execute(
            "UPDATE signals SET claimed_at = datetime('now'), claim_token = ?1
             WHERE id IN (
                 SELECT id FROM signals
                 WHERE processed = 0 AND superseded = 0 AND confidence >= ?2
                   AND (claimed_at IS NULL OR claimed_at <= datetime('now', ?3))
                 ORDER BY id
                 LIMIT ?4
             )",
            params![claim_token, min_confidence, cutoff, limit as i64],
        )?;

        let sql = format!(
            "SELECT {} FROM signals WHERE claim_token = ?1 AND processed = 0 ORDER BY id",
            Self::SIGNAL_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![claim_token], Self::row_to_signal)?;
        rows.collect()
    }

    pub fn release_claim(&self, signal_id: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE signals SET claimed_at = NULL, claim_token = NULL, attempts = attempts + 1
             WHERE id = ?1 AND processed = 0",
            params![signal_id],
        )?;
        Ok(())
    }

    pub fn mark_skipped(&self, signal_id: i64, reason: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE signals
             SET processed = 1, processed_at = datetime('now'), skip_reason = ?2,
                 claimed_at = NULL, claim_token = NULL
             WHERE id = ?1 AND processed = 0",
            params![signal_id, reason],
        )?;
        Ok(())
    }

    pub fn insert_insight_and_mark(
        &self,
        signal_id: i64,
        category: &str,
        headline: &str,
        summary: &str,
        evidence: &[EvidenceRef],
        confidence: f64,
    ) -> Result<InsightWriteOutcome, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;

        let state: Option<(i64, i64)> = tx
            .query_row(
                "SELECT superseded, processed FROM signals WHERE id = ?1",
                params![signal_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match state {
            None => return Ok(InsightWriteOutcome::Missing),
            Some((superseded, _)) if superseded != 0 => {
                return Ok(InsightWriteOutcome::Superseded);
            }
            Some((_, processed)) if processed != 0 => {
                return Ok(InsightWriteOutcome::AlreadyProcessed);
            }
            Some(_) => {}
        }

        let evidence_json =
            serde_json::to_string(evidence).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO insights (signal_id, category, headline, summary, evidence, confidence, day, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, date('now'), datetime('now'))",
            params![signal_id, category, headline, summary, evidence_json, confidence],
        )?;
        let insight_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE signals
             SET processed = 1, processed_at = datetime('now'),
                 claimed_at = NULL, claim_token = NULL
             WHERE id = ?1",
            params![signal_id],
        )?;
        tx.commit()?;
        Ok(InsightWriteOutcome::Written(insight_id))
    }

    pub fn mark_superseded(&self, from_height: u64) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "UPDATE signals SET superseded = 1 WHERE source_height >= ?1 AND superseded = 0",
            params![from_height as i64],
        )
    }

    pub fn attach_chart(&self, insight_id: i64, url: &str) -> Result<bool, rusqlite::Error> {
        let changed = self.conn.execute(
            "UPDATE insights SET chart_url = ?2 WHERE id = ?1",
            params![insight_id, url],
        )?;
        Ok(changed > 0)
    }

    fn row_to_insight(row: &rusqlite::Row) -> rusqlite::Result<InsightRecord> {
        let evidence_str: String = row.get(5)?;
        let evidence = serde_json::from_str(&evidence_str).unwrap_or_default();
        Ok(InsightRecord {
            id: row.get(0)?,
            signal_id: row.get(1)?,
            category: row.get(2)?,
            headline: row.get(3)?,
            summary: row.get(4)?,
            evidence,
            confidence: row.get(6)?,
            created_at: row.get(7)?,
            chart_url: row.get(8)?,
        })
    }

    const INSIGHT_COLS: &'static str =
        "id, signal_id, category, headline, summary, evidence, confidence, created_at, chart_url";

    pub fn insight_for_signal(
        &self,
        signal_id: i64,
    ) -> Result<Option<InsightRecord>, rusqlite::Error> {
        let sql = format!(
            "SELECT {} FROM insights WHERE signal_id = ?1",
            Self::INSIGHT_COLS
        );
        self.conn
            .query_row(&sql, params![signal_id], Self::row_to_insight)
            .optional()
    }

    pub fn recent_insights(&self, limit: usize) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let sql = format!(
            "SELECT {} FROM insights ORDER BY id DESC LIMIT ?1",
            Self::INSIGHT_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_insight)?;
        rows.collect()
    }

    pub fn insights_by_category(
        &self,
        category: &str,
        limit: usize,
    ) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let sql = format!(
            "SELECT {} FROM insights WHERE category = ?1 ORDER BY id DESC LIMIT ?2",
            Self::INSIGHT_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![category, limit as i64], Self::row_to_insight)?;
        rows.collect()
    }

    pub fn insights_for_day(
        &self,
        day: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<InsightRecord>, rusqlite::Error> {
        let sql = format!(
            "SELECT {} FROM insights
             WHERE day = ?1 AND confidence >= ?2
             ORDER BY id DESC LIMIT ?3",
            Self::INSIGHT_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![day, min_confidence, limit as i64], Self::row_to_insight)?;
        rows.collect()
    }

    pub fn signal_count(&self) -> Result<usize, rusqlite::Error> {
        self.conn
            .query_row("SELECT COUNT(*) FROM signals", [], |row| {
                row.get::<_, i64>(0).map(|c| c as usize)
            })
    }

    pub fn unprocessed_count(&self) -> Result<usize, rusqlite::Error> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE processed = 0 AND superseded = 0",
            [],
            |row| row.get::<_, i64>(0).map(|c| c as usize),
        )
    }

    pub fn skip_reason(&self, signal_id: i64) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT skip_reason FROM signals WHERE id = ?1",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()
            .map(|v: Option<Option<String>>| v.flatten())
    }

    pub fn load_entities_from_csv(&self, path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let mut count = 0;
        for line in content.lines().skip(1) {
            // skip header
            let parts: Vec<&str> = line.splitn(4, ',').collect();
            if parts.len() < 4 {
                continue;
            }
            self.conn.execute(
                "INSERT OR REPLACE INTO entities (address, entity_id, name, kind)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    parts[3].trim(),
                    parts[0].trim(),
                    parts[1].trim(),
                    parts[2].trim()
                ],
            )?;
            count += 1;
        }
        Ok(count)
    }

    pub fn all_entities(&self) -> Result<Vec<EntityRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, name, kind, address, metadata FROM entities ORDER BY entity_id, address",
        )?;
        let mut rows = stmt.query([])?;
        let mut records: Vec<EntityRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let entity_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let kind_str: String = row.get(2)?;
            let address: String = row.get(3)?;
            let metadata: Option<String> = row.get(4)?;
            let kind = match EntityKind::parse(&kind_str) {
                Some(k) => k,
                None => {
                    debug!(entity_id, kind = kind_str, "skipping entity with unknown kind");
                    continue;
                }
            };
            match records.last_mut() {
                Some(last) if last.id == entity_id => last.addresses.push(address),
                _ => records.push(EntityRecord {
                    id: entity_id,
                    name,
                    kind,
                    addresses: vec![address],
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                }),
            }
        }
        Ok(records)
    }
}
