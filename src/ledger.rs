//! Append-only, hash-chained ledger.
//!
//! Every event delivered to the ledger's wildcard subscription becomes one
//! write-once row. `block_hash(n) = sha256(payload_hash ‖ prev_hash ‖ n)`
//! and `prev_hash(n) = block_hash(n-1)`, genesis all-zero, so altering any
//! past row breaks every hash after it.
//!
//! The whole reserve-index → hash → insert critical section holds a single
//! writer lock. The sequence counter only advances after the insert commits:
//! a failed append burns nothing and the next append reuses the index.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::EventHandler;
use crate::events::{PlatformEvent, Severity};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// prev_hash of block 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DEFAULT_QUERY_LIMIT: u64 = 100;
const MAX_QUERY_LIMIT: u64 = 1000;

pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn block_hash(payload_hash: &str, prev_hash: &str, index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload_hash.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(index.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Single authority for block indices. Gapless: `advance` is only called
/// after the corresponding row is durably inserted.
#[derive(Debug)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn advance(&mut self) -> u64 {
        let current = self.next;
        self.next += 1;
        current
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub block_index: u64,
    /// Counter value; equal to `block_index` by construction, kept as its
    /// own column because external read tooling keys on it.
    pub sequence: u64,
    pub event_type: String,
    pub severity: Severity,
    pub subject_id: Option<String>,
    pub target_id: Option<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub payload_hash: String,
    pub block_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    /// Ascending block index, for chain verification.
    Asc,
    /// Descending, for recent-first displays.
    Desc,
}

#[derive(Debug, Clone)]
pub struct LedgerFilter {
    pub subject_id: Option<String>,
    pub target_id: Option<String>,
    pub event_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u64,
    pub offset: u64,
    pub order: QueryOrder,
}

impl Default for LedgerFilter {
    fn default() -> Self {
        Self {
            subject_id: None,
            target_id: None,
            event_type: None,
            from: None,
            to: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            order: QueryOrder::Asc,
        }
    }
}

/// Outcome of a full-chain recomputation.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub entries_checked: u64,
    pub valid: bool,
    pub first_invalid_index: Option<u64>,
    pub detail: Option<String>,
}

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open ledger db {}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS ledger_entries (
                entry_id TEXT PRIMARY KEY,
                block_index INTEGER NOT NULL UNIQUE,
                sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                subject_id TEXT,
                target_id TEXT,
                metadata TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                block_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_subject ON ledger_entries(subject_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_target ON ledger_entries(target_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_event_type ON ledger_entries(event_type);
            CREATE INDEX IF NOT EXISTS idx_ledger_timestamp ON ledger_entries(timestamp);
            COMMIT;",
        )?;
        Ok(())
    }

    fn insert(&self, entry: &LedgerEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ledger_entries (
                entry_id, block_index, sequence, event_type, severity,
                subject_id, target_id, metadata, timestamp,
                prev_hash, payload_hash, block_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.entry_id,
                entry.block_index as i64,
                entry.sequence as i64,
                entry.event_type,
                entry.severity.as_str(),
                entry.subject_id,
                entry.target_id,
                entry.metadata.to_string(),
                entry.timestamp.to_rfc3339(),
                entry.prev_hash,
                entry.payload_hash,
                entry.block_hash,
            ],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn entry_at(&self, block_index: u64) -> Result<Option<LedgerEntry>> {
        let mut entries = self.query(&LedgerFilter {
            limit: 1,
            offset: block_index,
            ..Default::default()
        })?;
        Ok(entries.pop().filter(|e| e.block_index == block_index))
    }

    fn last(&self) -> Result<Option<LedgerEntry>> {
        let mut entries = self.query(&LedgerFilter {
            limit: 1,
            order: QueryOrder::Desc,
            ..Default::default()
        })?;
        Ok(entries.pop())
    }

    pub fn query(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let mut sql = String::from(
            "SELECT entry_id, block_index, sequence, event_type, severity,
                    subject_id, target_id, metadata, timestamp,
                    prev_hash, payload_hash, block_hash
             FROM ledger_entries WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(subject) = &filter.subject_id {
            sql.push_str(" AND subject_id = ?");
            args.push(Box::new(subject.clone()));
        }
        if let Some(target) = &filter.target_id {
            sql.push_str(" AND target_id = ?");
            args.push(Box::new(target.clone()));
        }
        if let Some(event_type) = &filter.event_type {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(event_type.clone()));
        }
        if let Some(from) = &filter.from {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(from.to_rfc3339()));
        }
        if let Some(to) = &filter.to {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(to.to_rfc3339()));
        }
        sql.push_str(match filter.order {
            QueryOrder::Asc => " ORDER BY block_index ASC",
            QueryOrder::Desc => " ORDER BY block_index DESC",
        });
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(Box::new(filter.limit.min(MAX_QUERY_LIMIT) as i64));
        args.push(Box::new(filter.offset as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&arg_refs[..], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Recompute every block hash and linkage. Any mismatch is conclusive
    /// evidence that a stored row was altered after the fact.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let mut checked = 0u64;
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_index = 0u64;
        loop {
            let batch = self.query(&LedgerFilter {
                limit: MAX_QUERY_LIMIT,
                offset: checked,
                ..Default::default()
            })?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if entry.block_index != expected_index {
                    return Ok(ChainReport {
                        entries_checked: checked,
                        valid: false,
                        first_invalid_index: Some(entry.block_index),
                        detail: Some(format!(
                            "index gap: expected {}, found {}",
                            expected_index, entry.block_index
                        )),
                    });
                }
                if entry.prev_hash != expected_prev {
                    return Ok(ChainReport {
                        entries_checked: checked,
                        valid: false,
                        first_invalid_index: Some(entry.block_index),
                        detail: Some("prev_hash does not match previous block_hash".to_string()),
                    });
                }
                let recomputed_payload = payload_hash(&entry.metadata);
                if recomputed_payload != entry.payload_hash {
                    return Ok(ChainReport {
                        entries_checked: checked,
                        valid: false,
                        first_invalid_index: Some(entry.block_index),
                        detail: Some("payload_hash does not match stored metadata".to_string()),
                    });
                }
                let recomputed = block_hash(&entry.payload_hash, &entry.prev_hash, entry.block_index);
                if recomputed != entry.block_hash {
                    return Ok(ChainReport {
                        entries_checked: checked,
                        valid: false,
                        first_invalid_index: Some(entry.block_index),
                        detail: Some("block_hash recomputation mismatch".to_string()),
                    });
                }
                expected_prev = entry.block_hash.clone();
                expected_index += 1;
                checked += 1;
            }
        }
        Ok(ChainReport {
            entries_checked: checked,
            valid: true,
            first_invalid_index: None,
            detail: None,
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let severity: String = row.get(4)?;
    let metadata: String = row.get(7)?;
    let timestamp: String = row.get(8)?;
    Ok(LedgerEntry {
        entry_id: row.get(0)?,
        block_index: row.get::<_, i64>(1)? as u64,
        sequence: row.get::<_, i64>(2)? as u64,
        event_type: row.get(3)?,
        severity: match severity.as_str() {
            "critical" => Severity::Critical,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        },
        subject_id: row.get(5)?,
        target_id: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        prev_hash: row.get(9)?,
        payload_hash: row.get(10)?,
        block_hash: row.get(11)?,
    })
}

struct WriterInner {
    store: LedgerStore,
    counter: SequenceCounter,
    prev_hash: String,
}

/// Single-writer front of the ledger. Docks onto the bus via
/// `subscribe_all`; every mutation of (counter, prev_hash, store) happens
/// under one lock so concurrent deliveries serialize here even though the
/// bus dispatches them in parallel.
pub struct LedgerWriter {
    inner: Mutex<WriterInner>,
}

impl LedgerWriter {
    pub fn new(store: LedgerStore) -> Result<Self> {
        store.init()?;
        let (start, prev_hash) = match store.last()? {
            Some(last) => (last.block_index + 1, last.block_hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        Ok(Self {
            inner: Mutex::new(WriterInner {
                store,
                counter: SequenceCounter::new(start),
                prev_hash,
            }),
        })
    }

    pub async fn append(&self, event: &PlatformEvent) -> Result<LedgerEntry> {
        let mut inner = self.inner.lock().await;
        let index = inner.counter.peek();
        let metadata = event.payload_json();
        let p_hash = payload_hash(&metadata);
        let b_hash = block_hash(&p_hash, &inner.prev_hash, index);
        let entry = LedgerEntry {
            entry_id: format!("LED-{}", Uuid::new_v4()),
            block_index: index,
            sequence: index,
            event_type: event.event_type().to_string(),
            severity: event.severity(),
            subject_id: event.subject_id(),
            target_id: event.target_id(),
            metadata,
            timestamp: event.timestamp,
            prev_hash: inner.prev_hash.clone(),
            payload_hash: p_hash,
            block_hash: b_hash,
        };
        inner.store.insert(&entry)?;
        inner.counter.advance();
        inner.prev_hash = entry.block_hash.clone();
        Ok(entry)
    }

    pub async fn query(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        self.inner.lock().await.store.query(filter)
    }

    pub async fn len(&self) -> Result<u64> {
        self.inner.lock().await.store.len()
    }

    pub async fn verify_chain(&self) -> Result<ChainReport> {
        self.inner.lock().await.store.verify_chain()
    }
}

#[async_trait]
impl EventHandler for LedgerWriter {
    async fn handle(&self, event: PlatformEvent) -> Result<()> {
        match self.append(&event).await {
            Ok(entry) => {
                log(
                    Level::Trace,
                    Domain::Ledger,
                    "appended",
                    obj(&[
                        ("block_index", v_num(entry.block_index as f64)),
                        ("event_type", v_str(&entry.event_type)),
                    ]),
                );
                Ok(())
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Ledger,
                    "append_failed",
                    obj(&[
                        ("event_id", v_str(&event.event_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                Err(anyhow!("ledger append failed: {}", err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn sample_event(n: u32) -> PlatformEvent {
        PlatformEvent::new(
            "test",
            EventKind::EnergyConsumed {
                gpu_id: format!("gpu-{}", n),
                provider_id: "prov-1".to_string(),
                kwh: n as f64,
            },
        )
    }

    #[test]
    fn test_block_hash_deterministic() {
        let h1 = block_hash("abc", GENESIS_HASH, 0);
        let h2 = block_hash("abc", GENESIS_HASH, 0);
        assert_eq!(h1, h2);
        assert_ne!(h1, block_hash("abc", GENESIS_HASH, 1));
        assert_ne!(h1, block_hash("abd", GENESIS_HASH, 0));
    }

    #[test]
    fn test_sequence_counter_gapless() {
        let mut counter = SequenceCounter::new(0);
        assert_eq!(counter.peek(), 0);
        assert_eq!(counter.advance(), 0);
        assert_eq!(counter.advance(), 1);
        assert_eq!(counter.peek(), 2);
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let writer = LedgerWriter::new(LedgerStore::open_in_memory().unwrap()).unwrap();
        let mut prev = GENESIS_HASH.to_string();
        for n in 0..5 {
            let entry = writer.append(&sample_event(n)).await.unwrap();
            assert_eq!(entry.block_index, n as u64);
            assert_eq!(entry.prev_hash, prev);
            assert_eq!(
                entry.block_hash,
                block_hash(&entry.payload_hash, &entry.prev_hash, entry.block_index)
            );
            prev = entry.block_hash;
        }
        let report = writer.verify_chain().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 5);
    }

    #[tokio::test]
    async fn test_writer_resumes_from_existing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();

        let tail = {
            let writer = LedgerWriter::new(LedgerStore::open(path).unwrap()).unwrap();
            let mut tail = String::new();
            for n in 0..3 {
                tail = writer.append(&sample_event(n)).await.unwrap().block_hash;
            }
            tail
        };

        let writer = LedgerWriter::new(LedgerStore::open(path).unwrap()).unwrap();
        let entry = writer.append(&sample_event(3)).await.unwrap();
        assert_eq!(entry.block_index, 3);
        assert_eq!(entry.prev_hash, tail);
        assert!(writer.verify_chain().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_consume_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        let writer = LedgerWriter::new(LedgerStore::open(path).unwrap()).unwrap();
        writer.append(&sample_event(0)).await.unwrap();

        // Break the store out from under the writer, then restore it.
        let side = Connection::open(path).unwrap();
        side.execute("ALTER TABLE ledger_entries RENAME TO ledger_hidden", [])
            .unwrap();
        assert!(writer.append(&sample_event(1)).await.is_err());
        side.execute("ALTER TABLE ledger_hidden RENAME TO ledger_entries", [])
            .unwrap();
        drop(side);

        let entry = writer.append(&sample_event(2)).await.unwrap();
        assert_eq!(entry.block_index, 1);
        let report = writer.verify_chain().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        let writer = LedgerWriter::new(LedgerStore::open(path).unwrap()).unwrap();
        for n in 0..4 {
            writer.append(&sample_event(n)).await.unwrap();
        }

        let side = Connection::open(path).unwrap();
        side.execute(
            "UPDATE ledger_entries SET metadata = '{\"forged\":true}' WHERE block_index = 2",
            [],
        )
        .unwrap();
        drop(side);

        let report = writer.verify_chain().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_invalid_index, Some(2));
    }

    #[tokio::test]
    async fn test_query_filters_and_pagination() {
        let writer = LedgerWriter::new(LedgerStore::open_in_memory().unwrap()).unwrap();
        for n in 0..10 {
            writer.append(&sample_event(n)).await.unwrap();
        }
        writer
            .append(&PlatformEvent::new(
                "test",
                EventKind::SecurityAlert {
                    subject_id: "user-7".to_string(),
                    threat_score: 0.9,
                    detail: "probe".to_string(),
                },
            ))
            .await
            .unwrap();

        let alerts = writer
            .query(&LedgerFilter {
                event_type: Some("security.alert".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject_id.as_deref(), Some("user-7"));
        assert_eq!(alerts[0].severity, Severity::Critical);

        let page = writer
            .query(&LedgerFilter {
                limit: 3,
                offset: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].block_index, 4);

        let recent = writer
            .query(&LedgerFilter {
                limit: 2,
                order: QueryOrder::Desc,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent[0].block_index, 10);
        assert_eq!(recent[1].block_index, 9);
    }
}
