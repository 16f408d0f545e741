// src/services/proposals.rs
//! Proposal Store: CRUD and status transitions over per-record JSON files,
//! reconciling the staging (pending fast path) and canonical tiers.
//!
//! The canonical tier is the single writable source of truth. The staging
//! tier only ever mirrors still-pending proposals; every transition out of
//! `pending` deletes the staging copy so stale pending data cannot resurface.
//! Reads prefer a non-pending copy when both tiers hold the id, and fall back
//! to archive bundles for records the compactor has already moved.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::services::archive::{ArchiveStore, FAMILY_PROPOSALS};
use crate::services::audit::Audit;
use crate::services::schema::{RecordKind, SchemaValidator, Validation};
use crate::utils::fsio::{list_json_files, read_json, sanitize_id, write_json};

/// Which base directory family the target skill file lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Project,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Project => "project",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Human,
    Agent,
    Crawler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Rejected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Approved => "approved",
            Status::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerMeta {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub skill_name: String,
    pub scope: Scope,
    pub reason: String,
    pub diff: String,
    pub trigger: Trigger,
    pub proposer: ProposerMeta,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub skill_name: String,
    pub scope: Scope,
    pub reason: String,
    pub diff: String,
    pub trigger: Trigger,
    pub source: String,
    pub proposer_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalUpdate {
    pub status: Option<Status>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<Status>,
    pub scope: Option<Scope>,
    pub skill_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProposalStore {
    canonical: PathBuf,
    staging: PathBuf,
    archive: ArchiveStore,
    audit: Audit,
}

impl ProposalStore {
    pub fn open(
        canonical: impl Into<PathBuf>,
        staging: impl Into<PathBuf>,
        archive: ArchiveStore,
        audit: Audit,
    ) -> Result<Self> {
        let canonical = canonical.into();
        let staging = staging.into();
        fs::create_dir_all(&canonical)?;
        fs::create_dir_all(&staging)?;
        Ok(Self {
            canonical,
            staging,
            archive,
            audit,
        })
    }

    /// Create a pending proposal. The schema validator runs before anything
    /// is persisted; a failure blocks the write.
    pub fn create(&self, input: NewProposal, validator: &dyn SchemaValidator) -> Result<Proposal> {
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            skill_name: input.skill_name,
            scope: input.scope,
            reason: input.reason,
            diff: input.diff,
            trigger: input.trigger,
            proposer: ProposerMeta {
                source: input.source,
                name: input.proposer_name,
                created_at: Utc::now(),
            },
            status: Status::Pending,
        };

        match validator.validate(RecordKind::Proposal, &serde_json::to_value(&proposal)?) {
            Validation { valid: true, .. } => {}
            Validation { error, .. } => {
                return Err(WorkflowError::validation(
                    error.unwrap_or_else(|| "proposal failed schema validation".to_string()),
                ));
            }
        }

        write_json(&self.canonical_path(&proposal.id), &proposal)?;
        // Pending fast path: mirror into staging.
        write_json(&self.staging_path(&proposal.id), &proposal)?;

        self.audit.record(
            "proposals",
            "proposal_created",
            &json!({
                "id": proposal.id,
                "skill": proposal.skill_name,
                "scope": proposal.scope.as_str(),
                "reason": self.audit.preview(&proposal.reason),
            }),
            "low",
        );
        Ok(proposal)
    }

    /// Fetch by id, reconciling tiers: a non-pending copy wins over a pending
    /// one (it reflects a decision already made); archive bundles are
    /// searched when no live tier holds the id.
    pub fn get(&self, id: &str) -> Result<Option<Proposal>> {
        if let Some(live) = self.get_live(id)? {
            return Ok(Some(live));
        }
        match self.archive.find(FAMILY_PROPOSALS, "id", id)? {
            Some(v) => Ok(Some(serde_json::from_value(v).context("parse archived proposal")?)),
            None => Ok(None),
        }
    }

    /// List live proposals (staging + canonical, deduplicated by id with the
    /// same non-pending preference as `get`), newest first.
    pub fn list(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        let mut out: Vec<Proposal> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for path in list_json_files(&self.canonical)? {
            if let Some(p) = read_json::<Proposal>(&path)? {
                seen.push(p.id.clone());
                out.push(p);
            }
        }
        for path in list_json_files(&self.staging)? {
            if let Some(p) = read_json::<Proposal>(&path)? {
                if !seen.contains(&p.id) {
                    out.push(p);
                }
            }
        }
        out.retain(|p| {
            filter.status.map(|s| p.status == s).unwrap_or(true)
                && filter.scope.map(|s| p.scope == s).unwrap_or(true)
                && filter
                    .skill_name
                    .as_deref()
                    .map(|s| p.skill_name == s)
                    .unwrap_or(true)
        });
        out.sort_by(|a, b| b.proposer.created_at.cmp(&a.proposer.created_at));
        Ok(out)
    }

    /// List pending proposals, excluding any id that already has a decision
    /// on file. This is a merge-by-event-order rule, not just a filter: it
    /// guards against a staging copy momentarily lagging the canonical
    /// status update.
    pub fn list_pending(&self, has_decision: impl Fn(&str) -> bool) -> Result<Vec<Proposal>> {
        let mut pending = self.list(&ProposalFilter {
            status: Some(Status::Pending),
            ..ProposalFilter::default()
        })?;
        pending.retain(|p| !has_decision(&p.id));
        Ok(pending)
    }

    /// Update status and/or diff. `diff` is mutable only while pending;
    /// status may only move `pending -> approved|rejected` (same-status
    /// writes are no-ops). Any transition out of pending deletes the staging
    /// copy.
    pub fn update(&self, id: &str, update: ProposalUpdate) -> Result<Proposal> {
        let mut proposal = self
            .get_live(id)?
            .ok_or_else(|| WorkflowError::not_found(format!("proposal {}", id)))?;

        if let Some(diff) = update.diff {
            if proposal.status != Status::Pending {
                return Err(WorkflowError::conflict(
                    "proposal diff may only be edited while pending",
                ));
            }
            proposal.diff = diff;
        }
        if let Some(status) = update.status {
            if status != proposal.status {
                if proposal.status.is_terminal() {
                    return Err(WorkflowError::conflict(format!(
                        "proposal {} is already {}",
                        id,
                        proposal.status.as_str()
                    )));
                }
                proposal.status = status;
            }
        }

        write_json(&self.canonical_path(id), &proposal)?;
        if proposal.status == Status::Pending {
            // Keep the fast-path mirror current for pending edits.
            write_json(&self.staging_path(id), &proposal)?;
        } else {
            self.remove_staging(id)?;
        }

        self.audit.record(
            "proposals",
            "proposal_updated",
            &json!({ "id": id, "status": proposal.status.as_str() }),
            "low",
        );
        Ok(proposal)
    }

    /// Force the status of a live record to match an existing decision
    /// (merge-by-event-order re-sync). Unlike `update`, this may overwrite a
    /// terminal status: the recorded decision is authoritative. Only the
    /// Decision Recorder calls this.
    pub fn sync_status(&self, id: &str, status: Status) -> Result<Proposal> {
        let mut proposal = self
            .get_live(id)?
            .ok_or_else(|| WorkflowError::not_found(format!("proposal {}", id)))?;
        if proposal.status != status {
            proposal.status = status;
            write_json(&self.canonical_path(id), &proposal)?;
        }
        if proposal.status != Status::Pending {
            self.remove_staging(id)?;
        }
        Ok(proposal)
    }

    /// Remove the record from every tier it could exist in. `Ok(false)` only
    /// when it was absent from all of them.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut removed = false;
        removed |= remove_if_present(&self.staging_path(id))?;
        removed |= remove_if_present(&self.canonical_path(id))?;
        removed |= self.archive.remove_entry(FAMILY_PROPOSALS, "id", id)?;
        if removed {
            self.audit.record(
                "proposals",
                "proposal_deleted",
                &json!({ "id": id }),
                "medium",
            );
        }
        Ok(removed)
    }

    /// Count of live pending proposals (scheduler-facing query).
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .list(&ProposalFilter {
                status: Some(Status::Pending),
                ..ProposalFilter::default()
            })?
            .len())
    }

    // ---- tier plumbing (used by the store and the compactor) --------------

    /// Like `get`, but never consults the archive. Updates only apply to
    /// live records; archived proposals are immutable.
    pub fn get_live(&self, id: &str) -> Result<Option<Proposal>> {
        let canonical: Option<Proposal> = read_json(&self.canonical_path(id))?;
        let staging: Option<Proposal> = read_json(&self.staging_path(id))?;
        Ok(match (canonical, staging) {
            (Some(c), Some(s)) => {
                if c.status != Status::Pending {
                    Some(c)
                } else if s.status != Status::Pending {
                    Some(s)
                } else {
                    Some(c)
                }
            }
            (Some(c), None) => Some(c),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        })
    }

    pub fn canonical_records(&self) -> Result<Vec<(PathBuf, Proposal)>> {
        let mut out = Vec::new();
        for path in list_json_files(&self.canonical)? {
            if let Some(p) = read_json::<Proposal>(&path)? {
                out.push((path, p));
            }
        }
        Ok(out)
    }

    pub fn canonical_path(&self, id: &str) -> PathBuf {
        self.canonical.join(format!("{}.json", sanitize_id(id)))
    }

    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.staging.join(format!("{}.json", sanitize_id(id)))
    }

    pub fn remove_staging(&self, id: &str) -> Result<bool> {
        remove_if_present(&self.staging_path(id))
    }

    pub fn live_counts(&self) -> (usize, usize) {
        let canonical = list_json_files(&self.canonical).map(|v| v.len()).unwrap_or(0);
        let staging = list_json_files(&self.staging).map(|v| v.len()).unwrap_or(0);
        (canonical, staging)
    }
}

fn remove_if_present(path: &PathBuf) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {:?}", path)),
    }
}
