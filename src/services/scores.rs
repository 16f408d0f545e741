// src/services/scores.rs
//! Fire-and-forget skill scoring: approve/reject/apply/rollback outcomes map
//! to scalar deltas folded into a per-skill running score. Publishing must
//! never block or fail the transition that triggered it; callers discard
//! the result.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreEvent {
    Approved,
    Rejected,
    Applied,
    RolledBack,
}

impl ScoreEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreEvent::Approved => "approved",
            ScoreEvent::Rejected => "rejected",
            ScoreEvent::Applied => "applied",
            ScoreEvent::RolledBack => "rolled_back",
        }
    }
}

/// Map an outcome to a scalar delta. An applied change is worth more than a
/// bare approval; a rollback claws back more than an apply granted.
pub fn score_for_event(event: ScoreEvent) -> f32 {
    match event {
        ScoreEvent::Approved => 0.2,
        ScoreEvent::Rejected => -0.1,
        ScoreEvent::Applied => 1.0,
        ScoreEvent::RolledBack => -1.2,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillScoreEvent {
    pub skill: String,
    pub proposal_id: String,
    pub event: &'static str,
    pub delta: f32,
    pub ts_ms: i64,
}

pub trait ScoreSink: Send + Sync {
    fn publish(&self, ev: &SkillScoreEvent) -> Result<()>;
}

pub struct SqliteScoreSink {
    db_path: PathBuf,
}

impl SqliteScoreSink {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let sink = Self {
            db_path: db_path.into(),
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn conn(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Connection::open(&self.db_path)
            .with_context(|| format!("open sqlite at {:?}", self.db_path))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS skill_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                skill TEXT NOT NULL,
                proposal_id TEXT NOT NULL,
                event TEXT NOT NULL,
                delta REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS skill_scores (
                skill TEXT PRIMARY KEY,
                score REAL NOT NULL,
                updated_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl ScoreSink for SqliteScoreSink {
    fn publish(&self, ev: &SkillScoreEvent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO skill_events (ts_ms, skill, proposal_id, event, delta) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ev.ts_ms, ev.skill, ev.proposal_id, ev.event, ev.delta],
        )?;
        conn.execute(
            r#"
            INSERT INTO skill_scores (skill, score, updated_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(skill) DO UPDATE SET
              score      = skill_scores.score + excluded.score,
              updated_ms = excluded.updated_ms
            "#,
            params![ev.skill, ev.delta, ev.ts_ms],
        )?;
        Ok(())
    }
}

/// Build and publish an event, swallowing any sink failure. This is the only
/// entry point the transitions use.
pub fn publish_best_effort(
    sink: Option<&dyn ScoreSink>,
    skill: &str,
    proposal_id: &str,
    event: ScoreEvent,
) {
    let Some(sink) = sink else { return };
    let ev = SkillScoreEvent {
        skill: skill.to_string(),
        proposal_id: proposal_id.to_string(),
        event: event.as_str(),
        delta: score_for_event(event),
        ts_ms: Utc::now().timestamp_millis(),
    };
    if let Err(e) = sink.publish(&ev) {
        tracing::warn!(skill, "score publish failed: {e}");
    }
}
