// src/services/decisions.rs
//! Decision Recorder: the accept/reject outcome for a proposal, and the
//! apply path that turns an approval into a file mutation.
//!
//! Exactly one effective decision exists per proposal id. Re-submission is
//! not an error: the stored decision wins and the proposal status is
//! re-synced to it (merge by event order). Persistence uses an atomic
//! create-if-absent, so two racing writers cannot both record a decision;
//! the loser adopts the winner.
//!
//! Ordering: the proposal status is updated *before* the decision is
//! persisted; if that update fails the decision is never written, so status
//! and decision cannot disagree.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::errors::WorkflowError;
use crate::services::archive::{ArchiveStore, FAMILY_DECISIONS};
use crate::services::audit::Audit;
use crate::services::diff;
use crate::services::history::HistoryStore;
use crate::services::locks::{LockGuard, LockManager};
use crate::services::proposals::{ProposalStore, ProposalUpdate, Scope, Status};
use crate::services::schema::{RecordKind, SchemaValidator, Validation};
use crate::utils::fsio::{list_json_files, read_json, sanitize_id, write_atomic, write_json};
use crate::utils::path::resolve_skill_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Reject,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Reject => "reject",
        }
    }

    pub fn implied_status(&self) -> Status {
        match self {
            DecisionKind::Approve => Status::Approved,
            DecisionKind::Reject => Status::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub proposal_id: String,
    pub decision: DecisionKind,
    pub reason: String,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub proposal_id: String,
    pub decision: DecisionKind,
    pub reason: String,
    pub decided_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    pub decision: Option<DecisionKind>,
}

/// Structured outcome of an apply attempt. Failures are data with stable
/// messages callers can branch on, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_path: Option<String>,
}

impl ApplyResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            history_id: None,
            skill_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionStore {
    dir: PathBuf,
    archive: ArchiveStore,
    audit: Audit,
}

impl DecisionStore {
    pub fn open(dir: impl Into<PathBuf>, archive: ArchiveStore, audit: Audit) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, archive, audit })
    }

    /// Record a decision for a proposal.
    ///
    /// Idempotent re-submission: when a decision already exists it is
    /// returned unchanged (whatever outcome the caller sent) and the proposal
    /// status re-synced to it. Otherwise the proposal status is updated
    /// first; only if that succeeds is the decision persisted, atomically.
    pub fn create(
        &self,
        input: NewDecision,
        proposals: &ProposalStore,
        validator: &dyn SchemaValidator,
    ) -> Result<Decision> {
        if proposals.get(&input.proposal_id)?.is_none() {
            return Err(WorkflowError::not_found(format!(
                "proposal {}",
                input.proposal_id
            )));
        }

        if let Some(existing) = self.get_by_proposal_id(&input.proposal_id)? {
            // Merge by event order: the stored decision wins.
            if proposals.get_live(&input.proposal_id)?.is_some() {
                proposals.sync_status(&input.proposal_id, existing.decision.implied_status())?;
            }
            self.audit.record(
                "decisions",
                "decision_resubmitted",
                &json!({
                    "proposal_id": input.proposal_id,
                    "kept": existing.decision.as_str(),
                    "ignored": input.decision.as_str(),
                }),
                "low",
            );
            return Ok(existing);
        }

        let decision = Decision {
            proposal_id: input.proposal_id.clone(),
            decision: input.decision,
            reason: input.reason,
            decided_by: input.decided_by,
            decided_at: Utc::now(),
            applied_at: None,
        };

        match validator.validate(RecordKind::Decision, &serde_json::to_value(&decision)?) {
            Validation { valid: true, .. } => {}
            Validation { error, .. } => {
                return Err(WorkflowError::validation(
                    error.unwrap_or_else(|| "decision failed schema validation".to_string()),
                ));
            }
        }

        // Status first; a failure here blocks decision persistence so the two
        // records can never disagree.
        proposals.update(
            &decision.proposal_id,
            ProposalUpdate {
                status: Some(decision.decision.implied_status()),
                diff: None,
            },
        )?;

        match self.persist_new(&decision)? {
            None => {
                self.audit.record(
                    "decisions",
                    "decision_recorded",
                    &json!({
                        "proposal_id": decision.proposal_id,
                        "decision": decision.decision.as_str(),
                        "decided_by": decision.decided_by,
                    }),
                    "low",
                );
                Ok(decision)
            }
            // Lost a create race; the winner governs.
            Some(winner) => {
                proposals.sync_status(&winner.proposal_id, winner.decision.implied_status())?;
                Ok(winner)
            }
        }
    }

    pub fn get_by_proposal_id(&self, proposal_id: &str) -> Result<Option<Decision>> {
        if let Some(d) = read_json::<Decision>(&self.record_path(proposal_id))? {
            return Ok(Some(d));
        }
        match self.archive.find(FAMILY_DECISIONS, "proposal_id", proposal_id)? {
            Some(v) => Ok(Some(serde_json::from_value(v).context("parse archived decision")?)),
            None => Ok(None),
        }
    }

    /// Live decisions, newest first.
    pub fn list(&self, filter: &DecisionFilter) -> Result<Vec<Decision>> {
        let mut out = Vec::new();
        for path in list_json_files(&self.dir)? {
            if let Some(d) = read_json::<Decision>(&path)? {
                out.push(d);
            }
        }
        out.retain(|d| filter.decision.map(|k| d.decision == k).unwrap_or(true));
        out.sort_by(|a, b| b.decided_at.cmp(&a.decided_at));
        Ok(out)
    }

    /// Stamp `applied_at` exactly once. Falls back to rewriting the archive
    /// bundle when the record was already compacted.
    pub fn set_applied(&self, proposal_id: &str) -> Result<Decision> {
        let now = Utc::now();
        let path = self.record_path(proposal_id);
        if let Some(mut decision) = read_json::<Decision>(&path)? {
            if decision.applied_at.is_some() {
                return Err(WorkflowError::conflict("proposal already applied"));
            }
            decision.applied_at = Some(now);
            write_json(&path, &decision)?;
            return Ok(decision);
        }
        let updated = self
            .archive
            .update_entry(FAMILY_DECISIONS, "proposal_id", proposal_id, |v| {
                v["applied_at"] = serde_json::json!(now.to_rfc3339());
            })?;
        if !updated {
            return Err(WorkflowError::not_found(format!(
                "decision for proposal {}",
                proposal_id
            )));
        }
        self.get_by_proposal_id(proposal_id)?
            .ok_or_else(|| anyhow::anyhow!("decision vanished after archive update"))
    }

    pub fn record_path(&self, proposal_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(proposal_id)))
    }

    pub fn live_records(&self) -> Result<Vec<(PathBuf, Decision)>> {
        let mut out = Vec::new();
        for path in list_json_files(&self.dir)? {
            if let Some(d) = read_json::<Decision>(&path)? {
                out.push((path, d));
            }
        }
        Ok(out)
    }

    pub fn live_count(&self) -> usize {
        list_json_files(&self.dir).map(|v| v.len()).unwrap_or(0)
    }

    /// Atomic create-if-absent. `Ok(None)` when this call created the record;
    /// `Ok(Some(winner))` when a concurrent writer got there first.
    fn persist_new(&self, decision: &Decision) -> Result<Option<Decision>> {
        let path = self.record_path(&decision.proposal_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let bytes = serde_json::to_vec_pretty(decision)?;
                f.write_all(&bytes)?;
                f.sync_all()?;
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let winner = read_json::<Decision>(&path)?
                    .ok_or_else(|| anyhow::anyhow!("decision record vanished during create race"))?;
                Ok(Some(winner))
            }
            Err(e) => Err(e).with_context(|| format!("create decision {:?}", path)),
        }
    }
}

/// Settings the applier needs from config.
#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub user_skills: PathBuf,
    pub project_skills: PathBuf,
    pub fuzz_factor: usize,
    pub allowed_diff_targets: Vec<String>,
    pub lock_ttl_secs: u64,
}

impl ApplySettings {
    fn base_for(&self, scope: Scope) -> &Path {
        match scope {
            Scope::User => &self.user_skills,
            Scope::Project => &self.project_skills,
        }
    }
}

/// Borrowing orchestrator for the approve → mutate-file transition.
/// Owns no state; the caller provides the stores it coordinates.
pub struct Applier<'a> {
    pub decisions: &'a DecisionStore,
    pub proposals: &'a ProposalStore,
    pub history: &'a HistoryStore,
    pub locks: &'a LockManager,
    pub audit: &'a Audit,
    pub settings: ApplySettings,
}

impl<'a> Applier<'a> {
    /// Apply an approved proposal's diff to its target file.
    ///
    /// Refuses (as data, with stable messages) when: no decision exists, the
    /// decision is a reject, the proposal was already applied, the diff fails
    /// a safety or target-path screen, the apply lock is contended, or the
    /// diff no longer matches the current content. On success the backup and
    /// history entry land before the file is mutated, then `applied_at` is
    /// stamped.
    pub fn apply(&self, proposal_id: &str, applied_by: &str) -> Result<ApplyResult> {
        let Some(decision) = self.decisions.get_by_proposal_id(proposal_id)? else {
            return Ok(ApplyResult::failed("Decision not found"));
        };
        if decision.decision == DecisionKind::Reject {
            return Ok(ApplyResult::failed("Cannot apply rejected decision"));
        }
        if decision.applied_at.is_some() {
            return Ok(ApplyResult::failed("Proposal already applied"));
        }
        let Some(proposal) = self.proposals.get(proposal_id)? else {
            return Ok(ApplyResult::failed("Proposal not found"));
        };

        // Independent screening layer, re-run before the privileged write
        // even if a caller already screened at decision time.
        let safety = diff::check_safety(&proposal.diff);
        if !safety.safe {
            return Ok(ApplyResult::failed(format!(
                "Diff failed safety check: {}",
                safety.reason.unwrap_or_default()
            )));
        }
        let targets = diff::check_target_paths(&proposal.diff, &self.settings.allowed_diff_targets);
        if !targets.safe {
            return Ok(ApplyResult::failed(format!(
                "Diff failed target path check: {}",
                targets.reason.unwrap_or_default()
            )));
        }

        let Some(_guard) =
            LockGuard::try_acquire(self.locks, "apply", self.settings.lock_ttl_secs)?
        else {
            return Ok(ApplyResult::failed("Apply operation already in progress"));
        };

        let base = self.settings.base_for(proposal.scope);
        let path = resolve_skill_path(base, &proposal.skill_name)?;
        let current = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("read target {:?}", path)),
        };

        let new_content = match diff::apply(&current, &proposal.diff, self.settings.fuzz_factor) {
            diff::ApplyOutcome::Applied(content) => content,
            diff::ApplyOutcome::NoMatch { detail, .. } => {
                return Ok(ApplyResult::failed(format!(
                    "Diff does not apply to current content: {}",
                    detail
                )));
            }
        };

        // Backup + ledger entry land before the target file changes; a
        // failure here aborts with no partial state.
        let history_id = self.history.record_apply(
            proposal_id,
            &proposal.skill_name,
            &path.to_string_lossy(),
            proposal.scope,
            &proposal.diff,
            &current,
            applied_by,
        )?;

        write_atomic(&path, new_content.as_bytes())?;
        self.decisions.set_applied(proposal_id)?;

        self.audit.record(
            "decisions",
            "proposal_applied",
            &json!({
                "proposal_id": proposal_id,
                "history_id": history_id,
                "skill": proposal.skill_name,
                "path": path.to_string_lossy(),
            }),
            "medium",
        );

        Ok(ApplyResult {
            success: true,
            message: format!("Applied proposal {} to {}", proposal_id, proposal.skill_name),
            history_id: Some(history_id),
            skill_path: Some(path.to_string_lossy().into_owned()),
        })
    }
}
