// src/services/history.rs
//! History & Backup Ledger: one record per applied change, plus a verbatim
//! pre-change snapshot stored independently of the reversible-diff path.
//!
//! The backup is written before the history record, and both before the
//! target file is touched; a backup failure therefore aborts the whole apply
//! with no partial state. Rollback has two strategies (inverse-diff replay,
//! literal backup restore), and the ordering rule only ever allows the
//! most recent not-yet-rolled-back entry per skill to be undone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::services::archive::{ArchiveStore, FAMILY_HISTORY};
use crate::services::audit::Audit;
use crate::services::proposals::Scope;
use crate::utils::fsio::{list_json_files, read_json, sanitize_id, write_atomic, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub proposal_id: String,
    pub skill_name: String,
    pub skill_path: String,
    pub scope: Scope,
    pub diff: String,
    /// Full pre-change snapshot; with `diff` this regenerates the post-change
    /// content (round-trip property).
    pub original_content: String,
    /// blake3 hex of `original_content`, for backup integrity checks.
    pub original_hash: String,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RollbackCheck {
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    backups: PathBuf,
    archive: ArchiveStore,
    audit: Audit,
}

impl HistoryStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        backups: impl Into<PathBuf>,
        archive: ArchiveStore,
        audit: Audit,
    ) -> Result<Self> {
        let dir = dir.into();
        let backups = backups.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&backups)?;
        Ok(Self {
            dir,
            backups,
            archive,
            audit,
        })
    }

    /// Record an about-to-happen apply: snapshot first, then the entry.
    /// Returns the new history id. Any failure here must abort the apply;
    /// the caller only mutates the target file after this returns.
    #[allow(clippy::too_many_arguments)]
    pub fn record_apply(
        &self,
        proposal_id: &str,
        skill_name: &str,
        skill_path: &str,
        scope: Scope,
        diff: &str,
        original_content: &str,
        applied_by: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let entry = HistoryEntry {
            id: id.clone(),
            proposal_id: proposal_id.to_string(),
            skill_name: skill_name.to_string(),
            skill_path: skill_path.to_string(),
            scope,
            diff: diff.to_string(),
            original_content: original_content.to_string(),
            original_hash: blake3::hash(original_content.as_bytes())
                .to_hex()
                .to_string(),
            applied_at: Utc::now(),
            applied_by: applied_by.to_string(),
            rolled_back_at: None,
        };

        // Backup is physically independent from the diff path; it must land
        // before the entry that references it.
        write_atomic(&self.backup_path(&id), original_content.as_bytes())
            .context("write backup snapshot")?;
        write_json(&self.entry_path(&id), &entry).context("write history entry")?;

        self.audit.record(
            "history",
            "apply_recorded",
            &json!({
                "history_id": id,
                "proposal_id": proposal_id,
                "skill": skill_name,
                "bytes": original_content.len(),
            }),
            "low",
        );
        Ok(id)
    }

    /// Fetch by id, searching live records then archive bundles.
    pub fn get(&self, id: &str) -> Result<Option<HistoryEntry>> {
        if let Some(entry) = read_json::<HistoryEntry>(&self.entry_path(id))? {
            return Ok(Some(entry));
        }
        match self.archive.find(FAMILY_HISTORY, "id", id)? {
            Some(v) => Ok(Some(serde_json::from_value(v).context("parse archived history entry")?)),
            None => Ok(None),
        }
    }

    /// Live entries, newest first.
    pub fn list(&self) -> Result<Vec<HistoryEntry>> {
        let mut out = Vec::new();
        for path in list_json_files(&self.dir)? {
            if let Some(entry) = read_json::<HistoryEntry>(&path)? {
                out.push(entry);
            }
        }
        out.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        Ok(out)
    }

    /// Every entry for a skill, live and archived, newest first.
    pub fn all_for_skill(&self, skill_name: &str) -> Result<Vec<HistoryEntry>> {
        let mut out: Vec<HistoryEntry> = self
            .list()?
            .into_iter()
            .filter(|e| e.skill_name == skill_name)
            .collect();
        for v in self.archive.list_entries(FAMILY_HISTORY)? {
            let entry: HistoryEntry = serde_json::from_value(v).context("parse archived history entry")?;
            if entry.skill_name == skill_name {
                out.push(entry);
            }
        }
        out.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        Ok(out)
    }

    /// Rollback ordering rule: an entry is only rollback-eligible if it
    /// exists, has not been rolled back, and is the most recent
    /// not-yet-rolled-back entry for its skill. Rolling back an older entry
    /// under newer changes would silently discard them.
    pub fn can_rollback(&self, id: &str) -> Result<RollbackCheck> {
        let Some(entry) = self.get(id)? else {
            return Ok(RollbackCheck {
                ok: false,
                reason: Some(format!("history entry {} not found", id)),
            });
        };
        if entry.rolled_back_at.is_some() {
            return Ok(RollbackCheck {
                ok: false,
                reason: Some("entry already rolled back".to_string()),
            });
        }
        let newest_active = self
            .all_for_skill(&entry.skill_name)?
            .into_iter()
            .find(|e| e.rolled_back_at.is_none());
        match newest_active {
            Some(newest) if newest.id != entry.id => Ok(RollbackCheck {
                ok: false,
                reason: Some(format!(
                    "a newer change ({}) for skill {:?} must be rolled back first",
                    newest.id, entry.skill_name
                )),
            }),
            _ => Ok(RollbackCheck { ok: true, reason: None }),
        }
    }

    /// Stamp `rolled_back_at`. Works on live records and on entries the
    /// compactor has already bundled (the bundle is rewritten in place).
    pub fn mark_rolled_back(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let live_path = self.entry_path(id);
        if let Some(mut entry) = read_json::<HistoryEntry>(&live_path)? {
            if entry.rolled_back_at.is_some() {
                return Err(WorkflowError::conflict("entry already rolled back"));
            }
            entry.rolled_back_at = Some(now);
            write_json(&live_path, &entry)?;
        } else {
            let updated = self.archive.update_entry(FAMILY_HISTORY, "id", id, |v| {
                v["rolled_back_at"] = json!(now.to_rfc3339());
            })?;
            if !updated {
                return Err(WorkflowError::not_found(format!("history entry {}", id)));
            }
        }
        self.audit.record(
            "history",
            "rolled_back",
            &json!({ "history_id": id }),
            "medium",
        );
        Ok(())
    }

    /// Read the literal backup snapshot for an entry, if it still exists.
    pub fn read_backup(&self, id: &str) -> Result<Option<String>> {
        let path = self.backup_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("read backup {:?}", path))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(id)))
    }

    pub fn backup_path(&self, id: &str) -> PathBuf {
        self.backups.join(sanitize_id(id))
    }

    pub fn backups_dir(&self) -> &PathBuf {
        &self.backups
    }

    pub fn live_records(&self) -> Result<Vec<(PathBuf, HistoryEntry)>> {
        let mut out = Vec::new();
        for path in list_json_files(&self.dir)? {
            if let Some(entry) = read_json::<HistoryEntry>(&path)? {
                out.push((path, entry));
            }
        }
        Ok(out)
    }

    pub fn live_count(&self) -> usize {
        list_json_files(&self.dir).map(|v| v.len()).unwrap_or(0)
    }
}
