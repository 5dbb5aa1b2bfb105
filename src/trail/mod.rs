//! Trail ledger: append-only records associating agent actions with
//! locations, read back with exponential time decay.
//!
//! Raw strengths are written once and never rewritten; readers compute the
//! effective strength at query time. Writes batch on a short timer and each
//! batch commits before being acknowledged.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrailConfig;
use crate::error::{ApiaryError, Result};

const BATCH_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    File,
    Function,
    Class,
    Concept,
    Tag,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Function => "function",
            Self::Class => "class",
            Self::Concept => "concept",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "concept" => Some(Self::Concept),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scent {
    Discovery,
    Warning,
    Blocker,
    Hot,
    Cold,
}

impl Scent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Warning => "warning",
            Self::Blocker => "blocker",
            Self::Hot => "hot",
            Self::Cold => "cold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Self::Discovery),
            "warning" => Some(Self::Warning),
            "blocker" => Some(Self::Blocker),
            "hot" => Some(Self::Hot),
            "cold" => Some(Self::Cold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trail {
    pub run_id: Option<String>,
    pub location: String,
    pub location_kind: LocationKind,
    pub scent: Scent,
    /// Raw strength in [0, 1] as laid; decay is applied at read time only.
    pub strength: f64,
    pub agent_id: Option<String>,
    pub node_id: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Trail {
    pub fn new(location: impl Into<String>, location_kind: LocationKind, scent: Scent) -> Self {
        Self {
            run_id: None,
            location: location.into(),
            location_kind,
            scent,
            strength: 1.0,
            agent_id: None,
            node_id: None,
            message: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.expires_at = Some(self.created_at + Duration::hours(hours as i64));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrailQuery {
    /// Substring match on location.
    pub location: Option<String>,
    pub scent: Option<Scent>,
    pub run_id: Option<String>,
    pub min_effective: f64,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScoredTrail {
    pub trail: Trail,
    pub effective_strength: f64,
}

#[derive(Debug, Clone)]
pub struct HotSpot {
    pub location: String,
    pub trail_count: usize,
    pub total_strength: f64,
    pub scents: Vec<Scent>,
}

pub struct TrailLedger {
    conn: Arc<Mutex<Connection>>,
    pending: Mutex<Vec<Trail>>,
    last_flush: Mutex<Instant>,
    config: TrailConfig,
}

impl TrailLedger {
    pub fn open(db_path: impl AsRef<Path>, config: TrailConfig) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(db_path).map_err(|e| ApiaryError::storage("open trails", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            config,
        })
    }

    pub fn in_memory(config: TrailConfig) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ApiaryError::storage("open trails", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            config,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS trails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT,
                location TEXT NOT NULL,
                location_kind TEXT NOT NULL,
                scent TEXT NOT NULL,
                strength REAL NOT NULL,
                agent_id TEXT,
                node_id TEXT,
                message TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                expires_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trails_location
                ON trails(location);
            CREATE INDEX IF NOT EXISTS idx_trails_run
                ON trails(run_id);
            ",
        )
        .map_err(|e| ApiaryError::storage("init trail schema", e))?;
        Ok(())
    }

    /// Buffer a trail. The batch is committed when it grows past the batch
    /// cap or the flush timer elapses; [`flush`] forces it.
    pub fn lay(&self, trail: Trail) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock();
            pending.push(trail);
            pending.len() >= BATCH_MAX
                || self.last_flush.lock().elapsed().as_millis() as u64
                    >= self.config.flush_interval_ms
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<usize> {
        let batch: Vec<Trail> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ApiaryError::storage("trail batch", e))?;
        for trail in &batch {
            tx.execute(
                "INSERT INTO trails
                   (run_id, location, location_kind, scent, strength, agent_id, node_id,
                    message, tags, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    trail.run_id,
                    trail.location,
                    trail.location_kind.as_str(),
                    trail.scent.as_str(),
                    trail.strength,
                    trail.agent_id,
                    trail.node_id,
                    trail.message,
                    serde_json::to_string(&trail.tags)?,
                    trail.created_at.to_rfc3339(),
                    trail.expires_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| ApiaryError::storage("insert trail", e))?;
        }
        tx.commit()
            .map_err(|e| ApiaryError::storage("commit trail batch", e))?;
        *self.last_flush.lock() = Instant::now();
        debug!(count = count, "Trail batch committed");
        Ok(count)
    }

    /// Effective strength after exponential decay with the configured
    /// half-life.
    pub fn effective_strength(&self, trail: &Trail, now: DateTime<Utc>) -> f64 {
        let age_days = (now - trail.created_at).num_seconds() as f64 / 86_400.0;
        trail.strength * 0.5_f64.powf(age_days.max(0.0) / self.config.half_life_days)
    }

    /// Query trails; expired rows are filtered, decay applied, strongest
    /// first. Pending writes are flushed first so readers see their own
    /// trails.
    pub fn query(&self, query: &TrailQuery) -> Result<Vec<ScoredTrail>> {
        self.flush()?;
        let now = Utc::now();

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, location, location_kind, scent, strength, agent_id,
                            node_id, message, tags, created_at, expires_at
                     FROM trails ORDER BY created_at DESC LIMIT 1000",
                )
                .map_err(|e| ApiaryError::storage("query trails", e))?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                })
                .map_err(|e| ApiaryError::storage("query trails", e))?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(|e| ApiaryError::storage("query trails", e))?);
            }
            rows
        };

        let parse_ts = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };

        let mut scored = Vec::new();
        for (
            run_id,
            location,
            location_kind,
            scent,
            strength,
            agent_id,
            node_id,
            message,
            tags,
            created_at,
            expires_at,
        ) in rows
        {
            let trail = Trail {
                run_id,
                location,
                location_kind: LocationKind::parse(&location_kind).unwrap_or(LocationKind::Concept),
                scent: Scent::parse(&scent).unwrap_or(Scent::Discovery),
                strength,
                agent_id,
                node_id,
                message,
                tags: serde_json::from_str(&tags).unwrap_or_default(),
                created_at: parse_ts(&created_at),
                expires_at: expires_at.as_deref().map(parse_ts),
            };
            if let Some(expires_at) = trail.expires_at {
                if expires_at <= now {
                    continue;
                }
            }
            if let Some(run_id) = &query.run_id {
                if trail.run_id.as_deref() != Some(run_id.as_str()) {
                    continue;
                }
            }
            if let Some(scent) = query.scent {
                if trail.scent != scent {
                    continue;
                }
            }
            if let Some(location) = &query.location {
                if !trail.location.contains(location.as_str()) {
                    continue;
                }
            }
            if let Some(since) = query.since {
                if trail.created_at < since {
                    continue;
                }
            }
            let effective_strength = self.effective_strength(&trail, now);
            if effective_strength < query.min_effective {
                continue;
            }
            scored.push(ScoredTrail {
                trail,
                effective_strength,
            });
        }
        scored.sort_by(|a, b| {
            b.effective_strength
                .partial_cmp(&a.effective_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scored)
    }

    /// Locations with the most (decayed) trail activity.
    pub fn hot_spots(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<HotSpot>> {
        let scored = self.query(&TrailQuery {
            run_id: run_id.map(str::to_string),
            ..Default::default()
        })?;
        let mut grouped: BTreeMap<String, HotSpot> = BTreeMap::new();
        for entry in scored {
            let spot = grouped
                .entry(entry.trail.location.clone())
                .or_insert_with(|| HotSpot {
                    location: entry.trail.location.clone(),
                    trail_count: 0,
                    total_strength: 0.0,
                    scents: Vec::new(),
                });
            spot.trail_count += 1;
            spot.total_strength += entry.effective_strength;
            if !spot.scents.contains(&entry.trail.scent) {
                spot.scents.push(entry.trail.scent);
            }
        }
        let mut spots: Vec<HotSpot> = grouped.into_values().collect();
        spots.sort_by(|a, b| {
            b.total_strength
                .partial_cmp(&a.total_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        spots.truncate(limit);
        Ok(spots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> TrailLedger {
        TrailLedger::in_memory(TrailConfig::default()).unwrap()
    }

    #[test]
    fn test_lay_and_query_round_trip() {
        let ledger = ledger();
        ledger
            .lay(
                Trail::new("src/parser.rs", LocationKind::File, Scent::Hot)
                    .with_run("r-1")
                    .with_agent("scout-1")
                    .with_message("tight loop here"),
            )
            .unwrap();
        let results = ledger.query(&TrailQuery::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].trail.location, "src/parser.rs");
        assert!(results[0].effective_strength > 0.99);
    }

    #[test]
    fn test_decay_on_read_keeps_raw_strength() {
        let ledger = ledger();
        let mut old = Trail::new("src/old.rs", LocationKind::File, Scent::Discovery);
        old.created_at = Utc::now() - Duration::days(7);
        ledger.lay(old).unwrap();

        let results = ledger.query(&TrailQuery::default()).unwrap();
        // One half-life: effective halves, raw stays 1.0.
        assert!((results[0].effective_strength - 0.5).abs() < 0.01);
        assert!((results[0].trail.strength - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_trails_filtered() {
        let ledger = ledger();
        let mut expired = Trail::new("gone.rs", LocationKind::File, Scent::Cold);
        expired.created_at = Utc::now() - Duration::hours(48);
        expired.expires_at = Some(Utc::now() - Duration::hours(24));
        ledger.lay(expired).unwrap();
        ledger
            .lay(Trail::new("alive.rs", LocationKind::File, Scent::Hot).with_ttl_hours(24))
            .unwrap();

        let results = ledger.query(&TrailQuery::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].trail.location, "alive.rs");
    }

    #[test]
    fn test_query_filters() {
        let ledger = ledger();
        ledger
            .lay(Trail::new("a.rs", LocationKind::File, Scent::Warning).with_run("r-1"))
            .unwrap();
        ledger
            .lay(Trail::new("b.rs", LocationKind::File, Scent::Hot).with_run("r-2"))
            .unwrap();

        let warnings = ledger
            .query(&TrailQuery {
                scent: Some(Scent::Warning),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 1);

        let run_scoped = ledger
            .query(&TrailQuery {
                run_id: Some("r-2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(run_scoped.len(), 1);
        assert_eq!(run_scoped[0].trail.location, "b.rs");

        let by_location = ledger
            .query(&TrailQuery {
                location: Some("a.".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_location.len(), 1);
    }

    #[test]
    fn test_hot_spots_aggregate() {
        let ledger = ledger();
        for _ in 0..3 {
            ledger
                .lay(Trail::new("core.rs", LocationKind::File, Scent::Hot))
                .unwrap();
        }
        ledger
            .lay(Trail::new("side.rs", LocationKind::File, Scent::Discovery))
            .unwrap();

        let spots = ledger.hot_spots(None, 10).unwrap();
        assert_eq!(spots[0].location, "core.rs");
        assert_eq!(spots[0].trail_count, 3);
        assert!(spots[0].total_strength > spots[1].total_strength);
    }

    #[test]
    fn test_batching_flushes_on_cap() {
        let ledger = ledger();
        for i in 0..BATCH_MAX {
            ledger
                .lay(Trail::new(format!("f{}.rs", i), LocationKind::File, Scent::Hot))
                .unwrap();
        }
        // Cap reached: everything visible without an explicit flush.
        let conn = ledger.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trails", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, BATCH_MAX);
    }
}
