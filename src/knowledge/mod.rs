//! Knowledge query: context injected into agent prompts before they ship,
//! and outcome recording after nodes terminate.
//!
//! The core consumes the [`KnowledgeQuery`] trait; the bundled SQLite
//! implementation keeps golden rules, scored heuristics, and past failures
//! in the per-tenant state database.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conductor::{NodeExecution, NodeStatus};
use crate::config::KnowledgeConfig;
use crate::error::{ApiaryError, Result};

/// Closed domain set; unknown domains are rejected at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    General,
    Build,
    Testing,
    Security,
    Performance,
    Data,
    Infra,
    Workflow,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Build => "build",
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Data => "data",
            Self::Infra => "infra",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "general" => Ok(Self::General),
            "build" => Ok(Self::Build),
            "testing" => Ok(Self::Testing),
            "security" => Ok(Self::Security),
            "performance" => Ok(Self::Performance),
            "data" => Ok(Self::Data),
            "infra" => Ok(Self::Infra),
            "workflow" => Ok(Self::Workflow),
            other => Err(ApiaryError::InvalidPayload {
                job_type: "knowledge_query".into(),
                reason: format!("unknown domain '{}'", other),
            }),
        }
    }
}

pub trait KnowledgeQuery: Send + Sync {
    /// Build the context block stitched above node instructions. Empty
    /// string means "nothing relevant".
    fn build_context(
        &self,
        task_text: &str,
        domain: Option<Domain>,
        tags: &[String],
    ) -> Result<String>;

    fn record_outcome(&self, execution: &NodeExecution) -> Result<()>;
}

/// Words of four or more alphanumeric characters, lowercased.
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[derive(Debug, Clone)]
pub struct Heuristic {
    pub id: i64,
    pub content: String,
    pub domain: Domain,
    pub base_score: f64,
    pub validation_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PastFailure {
    pub title: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub similarity: f64,
}

pub struct SqliteKnowledge {
    conn: Arc<Mutex<Connection>>,
    config: KnowledgeConfig,
}

impl SqliteKnowledge {
    pub fn open(db_path: impl AsRef<Path>, config: KnowledgeConfig) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(db_path).map_err(|e| ApiaryError::storage("open knowledge", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn in_memory(config: KnowledgeConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ApiaryError::storage("open knowledge", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS golden_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'core',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS heuristics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                domain TEXT NOT NULL DEFAULT 'general',
                base_score REAL NOT NULL DEFAULT 0.5,
                validation_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS past_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                node_id TEXT,
                error_kind TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failures_created
                ON past_failures(created_at DESC);
            CREATE TABLE IF NOT EXISTS outcome_stats (
                status TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            );
            ",
        )
        .map_err(|e| ApiaryError::storage("init knowledge schema", e))?;
        Ok(())
    }

    pub fn add_golden_rule(&self, content: &str, category: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO golden_rules (content, category, created_at) VALUES (?1, ?2, ?3)",
            params![content, category, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ApiaryError::storage("add golden rule", e))?;
        Ok(())
    }

    pub fn add_heuristic(&self, content: &str, domain: Domain, base_score: f64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO heuristics (content, domain, base_score, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                content,
                domain.as_str(),
                base_score.clamp(0.0, 1.0),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| ApiaryError::storage("add heuristic", e))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn validate_heuristic(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE heuristics SET validation_count = validation_count + 1 WHERE id = ?1",
            params![id],
        )
        .map_err(|e| ApiaryError::storage("validate heuristic", e))?;
        Ok(())
    }

    pub fn add_failure(&self, title: &str, summary: &str, node_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO past_failures (title, summary, node_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![title, summary, node_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ApiaryError::storage("add failure", e))?;
        Ok(())
    }

    fn golden_rules(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT content FROM golden_rules ORDER BY id")
            .map_err(|e| ApiaryError::storage("golden rules", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ApiaryError::storage("golden rules", e))?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row.map_err(|e| ApiaryError::storage("golden rules", e))?);
        }
        Ok(rules)
    }

    /// Relevance = base * recency_decay(7d half-life, floored)
    /// * domain_match_boost * validation_boost, capped at 1.0.
    pub fn score_heuristic(&self, heuristic: &Heuristic, domain: Option<Domain>) -> f64 {
        let age_days = (Utc::now() - heuristic.created_at).num_seconds() as f64 / 86_400.0;
        let recency = 0.5_f64
            .powf(age_days / 7.0)
            .max(self.config.recency_floor);
        let domain_boost = match domain {
            Some(wanted) if wanted == heuristic.domain => self.config.domain_boost,
            _ => 1.0,
        };
        let validation_boost = if heuristic.validation_count >= 10 {
            1.4
        } else if heuristic.validation_count >= 5 {
            1.2
        } else {
            1.0
        };
        (heuristic.base_score * recency * domain_boost * validation_boost).min(1.0)
    }

    fn top_heuristics(&self, domain: Option<Domain>) -> Result<Vec<(Heuristic, f64)>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, content, domain, base_score, validation_count, created_at
                     FROM heuristics",
                )
                .map_err(|e| ApiaryError::storage("heuristics", e))?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| ApiaryError::storage("heuristics", e))?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(|e| ApiaryError::storage("heuristics", e))?);
            }
            rows
        };

        let mut scored: Vec<(Heuristic, f64)> = rows
            .into_iter()
            .map(|(id, content, domain_raw, base_score, validation_count, created_at)| {
                let heuristic = Heuristic {
                    id,
                    content,
                    domain: Domain::parse(&domain_raw).unwrap_or(Domain::General),
                    base_score,
                    validation_count,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                };
                let score = self.score_heuristic(&heuristic, domain);
                (heuristic, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.top_k);
        Ok(scored)
    }

    /// Jaccard similarity on >=4-char keywords over title+summary, within
    /// the configured window, above the configured threshold, top five.
    pub fn similar_failures(&self, task_text: &str) -> Result<Vec<PastFailure>> {
        let task_words = keywords(task_text);
        if task_words.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = Utc::now() - Duration::days(self.config.failure_window_days);

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT title, summary, created_at FROM past_failures
                     WHERE created_at >= ?1 ORDER BY created_at DESC LIMIT 200",
                )
                .map_err(|e| ApiaryError::storage("failures", e))?;
            let mapped = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| ApiaryError::storage("failures", e))?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(|e| ApiaryError::storage("failures", e))?);
            }
            rows
        };

        let mut similar: Vec<PastFailure> = rows
            .into_iter()
            .filter_map(|(title, summary, created_at)| {
                let failure_words = keywords(&format!("{} {}", title, summary));
                let similarity = jaccard(&task_words, &failure_words);
                if similarity >= self.config.similarity_threshold {
                    Some(PastFailure {
                        title,
                        summary,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        similarity,
                    })
                } else {
                    None
                }
            })
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        similar.truncate(5);
        Ok(similar)
    }
}

impl KnowledgeQuery for SqliteKnowledge {
    fn build_context(
        &self,
        task_text: &str,
        domain: Option<Domain>,
        _tags: &[String],
    ) -> Result<String> {
        let mut sections = Vec::new();

        let rules = self.golden_rules()?;
        if !rules.is_empty() {
            let mut block = String::from("## Golden rules\n");
            for rule in rules {
                block.push_str(&format!("- {}\n", rule));
            }
            sections.push(block);
        }

        let heuristics = self.top_heuristics(domain)?;
        if !heuristics.is_empty() {
            let mut block = String::from("## Heuristics\n");
            for (heuristic, score) in heuristics {
                block.push_str(&format!("- ({:.2}) {}\n", score, heuristic.content));
            }
            sections.push(block);
        }

        let failures = self.similar_failures(task_text)?;
        if !failures.is_empty() {
            let mut block = String::from("## Similar past failures\n");
            for failure in failures {
                block.push_str(&format!(
                    "- ({:.2}) {}: {}\n",
                    failure.similarity, failure.title, failure.summary
                ));
            }
            sections.push(block);
        }

        let mut context = sections.join("\n");
        // Rough 4-chars-per-token budget; truncation keeps whole lines.
        let budget_chars = self.config.max_context_tokens * 4;
        if context.len() > budget_chars {
            let mut cut = budget_chars;
            while cut > 0 && !context.is_char_boundary(cut) {
                cut -= 1;
            }
            context.truncate(cut);
            if let Some(newline) = context.rfind('\n') {
                context.truncate(newline);
            }
        }
        debug!(chars = context.len(), "Knowledge context built");
        Ok(context)
    }

    fn record_outcome(&self, execution: &NodeExecution) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO outcome_stats (status, count) VALUES (?1, 1)
                 ON CONFLICT(status) DO UPDATE SET count = count + 1",
                params![execution.status.as_str()],
            )
            .map_err(|e| ApiaryError::storage("record outcome", e))?;
        }
        if execution.status == NodeStatus::Failed {
            let title = format!("node {} failed", execution.node_id);
            let summary = format!(
                "{} ({})",
                execution.error_message.as_deref().unwrap_or("unknown error"),
                execution
                    .error_kind
                    .map(|k| k.as_str())
                    .unwrap_or("handler"),
            );
            self.add_failure(&title, &summary, Some(&execution.node_id))?;
        }
        Ok(())
    }
}
