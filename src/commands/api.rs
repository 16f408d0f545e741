// src/commands/api.rs
//! The Commands façade: one handle owning the configured stores, exposed as
//! the abstract surface a CLI or HTTP layer would call. There is no global
//! state: `Commands::open` returns the context object and everything is
//! threaded from it.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::CoreConfig;
use crate::errors::WorkflowError;
use crate::services::archive::ArchiveStore;
use crate::services::audit::Audit;
use crate::services::compactor::{Compactor, CompactorStatus, MergeResult};
use crate::services::decisions::{
    Applier, ApplyResult, ApplySettings, Decision, DecisionFilter, DecisionKind, DecisionStore,
    NewDecision,
};
use crate::services::diff::{self, SafetyCheck};
use crate::services::history::{HistoryEntry, HistoryStore, RollbackCheck};
use crate::services::locks::{LockGuard, LockManager};
use crate::services::proposals::{
    NewProposal, Proposal, ProposalFilter, ProposalStore, ProposalUpdate, Scope,
};
use crate::services::schema::{FieldPresenceValidator, SchemaValidator};
use crate::services::scores::{ScoreEvent, ScoreSink, SqliteScoreSink, publish_best_effort};
use crate::utils::fsio::write_atomic;
use crate::utils::path::resolve_skill_path;

use crate::commands::init::ensure_initialized;

pub struct Commands {
    config: CoreConfig,
    audit: Audit,
    locks: LockManager,
    proposals: ProposalStore,
    decisions: DecisionStore,
    history: HistoryStore,
    archive: ArchiveStore,
    validator: Box<dyn SchemaValidator>,
    scores: Option<Box<dyn ScoreSink>>,
}

/// Which restore path a rollback should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackStrategy {
    /// Inverse diff first, literal backup as fallback.
    #[default]
    Auto,
    InverseDiff,
    Backup,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<&'static str>,
}

impl RollbackResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            restored_from: None,
        }
    }
}

/// Dry-run application of a proposal's diff against the current target.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

/// Structural report on a proposal's diff text.
#[derive(Debug, Clone, Serialize)]
pub struct DiffValidation {
    pub parses: bool,
    pub hunk_count: usize,
    pub safety: SafetyCheck,
    pub target_paths: SafetyCheck,
}

impl Commands {
    /// Bootstrap the workspace under `root` (idempotent) and open every
    /// store. The returned value is the explicit context handle for all
    /// subsequent operations.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let report = ensure_initialized(&root)?;
        let config = CoreConfig::load(&report.root)?;

        let audit = Audit::new(
            &config.storage.logbook,
            config.services.audit_enabled,
            config.policies.log_preview_len,
        );
        let archive = ArchiveStore::open(&config.storage.archive, &config.storage.archive_old)?;
        let locks = LockManager::open(&config.storage.locks)?;
        let proposals = ProposalStore::open(
            &config.storage.proposals,
            &config.storage.active_proposals,
            archive.clone(),
            audit.clone(),
        )?;
        let decisions = DecisionStore::open(&config.storage.decisions, archive.clone(), audit.clone())?;
        let history = HistoryStore::open(
            &config.storage.history,
            &config.storage.backups,
            archive.clone(),
            audit.clone(),
        )?;
        let scores: Option<Box<dyn ScoreSink>> = if config.services.scores_enabled {
            match SqliteScoreSink::open(&config.storage.scores_db) {
                Ok(sink) => Some(Box::new(sink)),
                Err(e) => {
                    // Scoring is bookkeeping; a broken sink must not block open.
                    tracing::warn!("score sink unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            audit,
            locks,
            proposals,
            decisions,
            history,
            archive,
            validator: Box::new(FieldPresenceValidator),
            scores,
        })
    }

    /// Substitute the external schema validator.
    pub fn with_validator(mut self, validator: Box<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ---- proposals ---------------------------------------------------------

    pub fn create_proposal(&self, input: NewProposal) -> Result<Proposal> {
        let Some(_guard) = self.metadata_lock("proposal_write")? else {
            return Err(WorkflowError::contention("proposal_write"));
        };
        self.proposals.create(input, self.validator.as_ref())
    }

    pub fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        self.proposals.get(id)
    }

    pub fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        self.proposals.list(filter)
    }

    /// Pending proposals, excluding ids that already carry a decision.
    pub fn list_pending_proposals(&self) -> Result<Vec<Proposal>> {
        self.proposals.list_pending(|id| {
            self.decisions
                .get_by_proposal_id(id)
                .map(|d| d.is_some())
                .unwrap_or(false)
        })
    }

    pub fn update_proposal(&self, id: &str, update: ProposalUpdate) -> Result<Proposal> {
        let Some(_guard) = self.metadata_lock("proposal_write")? else {
            return Err(WorkflowError::contention("proposal_write"));
        };
        // Status must agree with a decision once one exists; the recorder is
        // the component that moves status, not ad-hoc updates.
        if let Some(status) = update.status {
            if let Some(decision) = self.decisions.get_by_proposal_id(id)? {
                if decision.decision.implied_status() != status {
                    return Err(WorkflowError::conflict(format!(
                        "proposal status must match recorded decision ({})",
                        decision.decision.as_str()
                    )));
                }
            }
        }
        self.proposals.update(id, update)
    }

    pub fn delete_proposal(&self, id: &str) -> Result<()> {
        let Some(_guard) = self.metadata_lock("proposal_write")? else {
            return Err(WorkflowError::contention("proposal_write"));
        };
        if self.proposals.delete(id)? {
            Ok(())
        } else {
            Err(WorkflowError::not_found(format!("proposal {}", id)))
        }
    }

    /// Scheduler-facing count of live pending proposals.
    pub fn pending_count(&self) -> Result<usize> {
        self.proposals.pending_count()
    }

    // ---- decisions ---------------------------------------------------------

    /// Record a decision. An approval screens the proposal's diff first;
    /// the safety layer runs before the privileged transition, not only
    /// before apply.
    pub fn decide(&self, input: NewDecision) -> Result<Decision> {
        let Some(_guard) = self.metadata_lock("decision_write")? else {
            return Err(WorkflowError::contention("decision_write"));
        };

        let existing = self.decisions.get_by_proposal_id(&input.proposal_id)?;
        if existing.is_none() && input.decision == DecisionKind::Approve {
            let proposal = self
                .proposals
                .get(&input.proposal_id)?
                .ok_or_else(|| WorkflowError::not_found(format!("proposal {}", input.proposal_id)))?;
            let safety = diff::check_safety(&proposal.diff);
            if !safety.safe {
                return Err(WorkflowError::validation(format!(
                    "diff failed safety check: {}",
                    safety.reason.unwrap_or_default()
                )));
            }
            let targets =
                diff::check_target_paths(&proposal.diff, &self.config.policies.allowed_diff_targets);
            if !targets.safe {
                return Err(WorkflowError::validation(format!(
                    "diff failed target path check: {}",
                    targets.reason.unwrap_or_default()
                )));
            }
        }

        let was_new = existing.is_none();
        let decision = self
            .decisions
            .create(input.clone(), &self.proposals, self.validator.as_ref())?;

        if was_new && decision.decided_by == input.decided_by && decision.decision == input.decision
        {
            if let Ok(Some(proposal)) = self.proposals.get(&decision.proposal_id) {
                let event = match decision.decision {
                    DecisionKind::Approve => ScoreEvent::Approved,
                    DecisionKind::Reject => ScoreEvent::Rejected,
                };
                publish_best_effort(
                    self.scores.as_deref(),
                    &proposal.skill_name,
                    &decision.proposal_id,
                    event,
                );
            }
        }
        Ok(decision)
    }

    pub fn get_decision(&self, proposal_id: &str) -> Result<Option<Decision>> {
        self.decisions.get_by_proposal_id(proposal_id)
    }

    pub fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<Decision>> {
        self.decisions.list(filter)
    }

    /// Apply an approved proposal's diff to its target file.
    pub fn apply(&self, proposal_id: &str, applied_by: &str) -> Result<ApplyResult> {
        let applier = Applier {
            decisions: &self.decisions,
            proposals: &self.proposals,
            history: &self.history,
            locks: &self.locks,
            audit: &self.audit,
            settings: self.apply_settings(),
        };
        let result = applier.apply(proposal_id, applied_by)?;
        if result.success {
            if let Ok(Some(proposal)) = self.proposals.get(proposal_id) {
                publish_best_effort(
                    self.scores.as_deref(),
                    &proposal.skill_name,
                    proposal_id,
                    ScoreEvent::Applied,
                );
            }
        }
        Ok(result)
    }

    /// Dry-run a proposal's diff against the current target content.
    pub fn preview(&self, proposal_id: &str) -> Result<PreviewResult> {
        let proposal = self
            .proposals
            .get(proposal_id)?
            .ok_or_else(|| WorkflowError::not_found(format!("proposal {}", proposal_id)))?;
        let path = resolve_skill_path(self.skill_base(proposal.scope), &proposal.skill_name)?;
        let current = read_or_empty(&path)?;
        Ok(
            match diff::apply(&current, &proposal.diff, self.config.policies.fuzz_factor) {
                diff::ApplyOutcome::Applied(content) => PreviewResult {
                    success: true,
                    message: format!("Diff applies cleanly to {}", proposal.skill_name),
                    new_content: Some(content),
                },
                diff::ApplyOutcome::NoMatch { detail, .. } => PreviewResult {
                    success: false,
                    message: format!("Diff does not apply to current content: {}", detail),
                    new_content: None,
                },
            },
        )
    }

    /// Structural + safety report for a proposal's diff.
    pub fn validate_proposal_diff(&self, proposal_id: &str) -> Result<DiffValidation> {
        let proposal = self
            .proposals
            .get(proposal_id)?
            .ok_or_else(|| WorkflowError::not_found(format!("proposal {}", proposal_id)))?;
        let files = diff::parse(&proposal.diff);
        Ok(DiffValidation {
            parses: !files.is_empty(),
            hunk_count: files.iter().map(|f| f.hunks.len()).sum(),
            safety: diff::check_safety(&proposal.diff),
            target_paths: diff::check_target_paths(
                &proposal.diff,
                &self.config.policies.allowed_diff_targets,
            ),
        })
    }

    // ---- history -----------------------------------------------------------

    pub fn get_history(&self, id: &str) -> Result<Option<HistoryEntry>> {
        self.history.get(id)
    }

    pub fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        self.history.list()
    }

    pub fn can_rollback(&self, history_id: &str) -> Result<RollbackCheck> {
        self.history.can_rollback(history_id)
    }

    /// Undo the most recent applied change for a skill, via the inverse diff
    /// or the literal backup. Failures are reported as data with stable
    /// messages; the ordering rule refuses rollbacks under newer changes.
    pub fn rollback(&self, history_id: &str, strategy: RollbackStrategy) -> Result<RollbackResult> {
        let check = self.history.can_rollback(history_id)?;
        if !check.ok {
            return Ok(RollbackResult::failed(
                check.reason.unwrap_or_else(|| "rollback refused".to_string()),
            ));
        }
        let entry = self
            .history
            .get(history_id)?
            .ok_or_else(|| WorkflowError::not_found(format!("history entry {}", history_id)))?;

        let Some(_guard) = LockGuard::try_acquire(
            &self.locks,
            "rollback",
            self.config.locks.default_ttl_secs,
        )?
        else {
            return Ok(RollbackResult::failed("Rollback operation already in progress"));
        };

        let path = resolve_skill_path(self.skill_base(entry.scope), &entry.skill_name)?;
        let current = read_or_empty(&path)?;

        let (restored, restored_from) = match self.restore_content(&entry, &current, strategy) {
            Ok(pair) => pair,
            Err(message) => return Ok(RollbackResult::failed(message)),
        };

        write_atomic(&path, restored.as_bytes())?;
        self.history.mark_rolled_back(history_id)?;

        self.audit.record(
            "history",
            "rollback_applied",
            &json!({
                "history_id": history_id,
                "skill": entry.skill_name,
                "restored_from": restored_from,
            }),
            "medium",
        );
        publish_best_effort(
            self.scores.as_deref(),
            &entry.skill_name,
            &entry.proposal_id,
            ScoreEvent::RolledBack,
        );

        Ok(RollbackResult {
            success: true,
            message: format!("Rolled back {} for {}", history_id, entry.skill_name),
            restored_from: Some(restored_from),
        })
    }

    // ---- compactor ---------------------------------------------------------

    pub fn compact(&self) -> Result<MergeResult> {
        self.compactor().compact()
    }

    pub fn compactor_status(&self) -> CompactorStatus {
        self.compactor().status()
    }

    pub fn compactor_history(&self, n: usize) -> Result<Vec<Value>> {
        self.compactor().run_history(n)
    }

    // ---- internals ---------------------------------------------------------

    fn compactor(&self) -> Compactor<'_> {
        Compactor {
            proposals: &self.proposals,
            decisions: &self.decisions,
            history: &self.history,
            archive: &self.archive,
            locks: &self.locks,
            audit: &self.audit,
            policy: &self.config.compaction,
            logbook_dir: &self.config.storage.logbook,
        }
    }

    fn apply_settings(&self) -> ApplySettings {
        ApplySettings {
            user_skills: self.config.storage.user_skills.clone(),
            project_skills: self.config.storage.project_skills.clone(),
            fuzz_factor: self.config.policies.fuzz_factor,
            allowed_diff_targets: self.config.policies.allowed_diff_targets.clone(),
            lock_ttl_secs: self.config.locks.default_ttl_secs,
        }
    }

    fn skill_base(&self, scope: Scope) -> &Path {
        match scope {
            Scope::User => &self.config.storage.user_skills,
            Scope::Project => &self.config.storage.project_skills,
        }
    }

    fn metadata_lock(&self, operation: &str) -> Result<Option<LockGuard<'_>>> {
        LockGuard::try_acquire(&self.locks, operation, self.config.locks.default_ttl_secs)
    }

    /// Pick the restore content for a rollback, honoring the strategy.
    /// Returns the stable failure message on the error side.
    fn restore_content(
        &self,
        entry: &HistoryEntry,
        current: &str,
        strategy: RollbackStrategy,
    ) -> std::result::Result<(String, &'static str), String> {
        let try_inverse = |current: &str| -> Option<String> {
            let inverse = diff::reverse(&entry.diff);
            diff::apply(current, &inverse, self.config.policies.fuzz_factor).applied()
        };
        let try_backup = || -> std::result::Result<String, String> {
            match self.history.read_backup(&entry.id) {
                Ok(Some(snapshot)) => {
                    let hash = blake3::hash(snapshot.as_bytes()).to_hex().to_string();
                    if hash != entry.original_hash {
                        return Err("Backup integrity check failed".to_string());
                    }
                    Ok(snapshot)
                }
                Ok(None) => Err("Backup file missing".to_string()),
                Err(e) => Err(format!("Backup unreadable: {e}")),
            }
        };

        match strategy {
            RollbackStrategy::InverseDiff => try_inverse(current)
                .map(|c| (c, "inverse_diff"))
                .ok_or_else(|| "Inverse diff does not apply to current content".to_string()),
            RollbackStrategy::Backup => try_backup().map(|c| (c, "backup")),
            RollbackStrategy::Auto => match try_inverse(current) {
                Some(c) => Ok((c, "inverse_diff")),
                None => try_backup()
                    .map(|c| (c, "backup"))
                    .map_err(|e| format!("Inverse diff does not apply and {}", lowercase_first(&e))),
            },
        }
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("read target {:?}", path)),
    }
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
