// src/services/compactor.rs
//! Archival Compactor: bounds the live-file count by consolidating settled
//! records into dated bundles, compressing aged bundles, and pruning old
//! backups and run logs.
//!
//! The compactor takes no locks of its own; it defers to the same liveness
//! check the writers use and skips the whole pass when any write-class
//! operation is in flight. Each record family compacts independently; a
//! failure in one is collected into the result, never raised.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{CompactionPolicy, GroupBy};
use crate::services::archive::{
    ArchiveStore, FAMILY_DECISIONS, FAMILY_HISTORY, FAMILY_PROPOSALS,
};
use crate::services::audit::Audit;
use crate::services::decisions::DecisionStore;
use crate::services::history::HistoryStore;
use crate::services::locks::LockManager;
use crate::services::proposals::{ProposalStore, Status};
use crate::utils::fsio::{append_jsonl, write_atomic};

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub ran_at: DateTime<Utc>,
    pub skipped: bool,
    pub staged_pending: usize,
    pub archived_proposals: usize,
    pub archived_decisions: usize,
    pub archived_history: usize,
    pub compressed_bundles: usize,
    pub pruned_backups: usize,
    pub pruned_log_lines: usize,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
}

impl Default for MergeResult {
    fn default() -> Self {
        Self {
            ran_at: Utc::now(),
            skipped: false,
            staged_pending: 0,
            archived_proposals: 0,
            archived_decisions: 0,
            archived_history: 0,
            compressed_bundles: 0,
            pruned_backups: 0,
            pruned_log_lines: 0,
            errors: vec![],
            notes: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactorStatus {
    pub proposals_canonical: usize,
    pub proposals_staging: usize,
    pub decisions_live: usize,
    pub history_live: usize,
    pub live_bundles: usize,
    pub backups: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<Value>,
}

pub struct Compactor<'a> {
    pub proposals: &'a ProposalStore,
    pub decisions: &'a DecisionStore,
    pub history: &'a HistoryStore,
    pub archive: &'a ArchiveStore,
    pub locks: &'a LockManager,
    pub audit: &'a Audit,
    pub policy: &'a CompactionPolicy,
    pub logbook_dir: &'a Path,
}

impl<'a> Compactor<'a> {
    /// Run one compaction pass. Never fails for a single family's sake;
    /// errors accumulate in the result.
    pub fn compact(&self) -> Result<MergeResult> {
        let mut result = MergeResult::default();

        if self.locks.any_write_in_progress() {
            result.skipped = true;
            result.notes.push("write operation in flight -> skipped".into());
            self.log_run(&result);
            return Ok(result);
        }

        self.stage_pending(&mut result);

        // Families compact independently; one failure must not starve the rest.
        if let Err(e) = self.archive_proposals(&mut result) {
            result.errors.push(format!("proposals: {e}"));
        }
        if let Err(e) = self.archive_decisions(&mut result) {
            result.errors.push(format!("decisions: {e}"));
        }
        if let Err(e) = self.archive_history(&mut result) {
            result.errors.push(format!("history: {e}"));
        }
        if let Err(e) = self.compress_old_bundles(&mut result) {
            result.errors.push(format!("compress: {e}"));
        }
        if let Err(e) = self.prune_backups(&mut result) {
            result.errors.push(format!("backups: {e}"));
        }
        if let Err(e) = self.prune_run_log(&mut result) {
            result.errors.push(format!("run log: {e}"));
        }

        self.log_run(&result);
        self.audit.record(
            "compactor",
            "compaction_run",
            &json!({
                "archived": result.archived_proposals + result.archived_decisions + result.archived_history,
                "compressed": result.compressed_bundles,
                "errors": result.errors.len(),
            }),
            "low",
        );
        Ok(result)
    }

    /// Live-file counts and the most recent run record.
    pub fn status(&self) -> CompactorStatus {
        let (canonical, staging) = self.proposals.live_counts();
        CompactorStatus {
            proposals_canonical: canonical,
            proposals_staging: staging,
            decisions_live: self.decisions.live_count(),
            history_live: self.history.live_count(),
            live_bundles: self.archive.live_bundle_count(),
            backups: count_files(self.history.backups_dir()),
            last_run: self.run_history(1).ok().and_then(|mut v| v.pop()),
        }
    }

    /// The most recent `n` compaction-run records, oldest first.
    pub fn run_history(&self, n: usize) -> Result<Vec<Value>> {
        let path = self.run_log_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let text = fs::read_to_string(&path)?;
        let mut runs: Vec<Value> = text
            .lines()
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter(|v| v.get("event").and_then(|e| e.as_str()) == Some("compaction_run"))
            .collect();
        if runs.len() > n {
            runs.drain(..runs.len() - n);
        }
        Ok(runs)
    }

    // ---- phases ------------------------------------------------------------

    /// (a) Move still-pending canonical proposals into the staging tier.
    fn stage_pending(&self, result: &mut MergeResult) {
        let records = match self.proposals.canonical_records() {
            Ok(r) => r,
            Err(e) => {
                result.errors.push(format!("stage pending: {e}"));
                return;
            }
        };
        for (path, proposal) in records {
            if proposal.status != Status::Pending {
                continue;
            }
            let staged = crate::utils::fsio::write_json(
                &self.proposals.staging_path(&proposal.id),
                &proposal,
            )
            .and_then(|()| fs::remove_file(&path).map_err(Into::into));
            match staged {
                Ok(()) => result.staged_pending += 1,
                Err(e) => result.errors.push(format!("stage {}: {e}", proposal.id)),
            }
        }
    }

    /// (b) Bundle terminal proposals past the age threshold.
    fn archive_proposals(&self, result: &mut MergeResult) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(self.policy.archive_after_days as i64);
        let eligible: Vec<_> = self
            .proposals
            .canonical_records()?
            .into_iter()
            .filter(|(_, p)| p.status.is_terminal() && p.proposer.created_at < cutoff)
            .collect();
        if eligible.len() < self.policy.min_records {
            result.notes.push(format!(
                "proposals below threshold ({} < {})",
                eligible.len(),
                self.policy.min_records
            ));
            return Ok(());
        }
        for (group, members) in group_records(&eligible, |p| self.group_key(p.status.as_str(), p.proposer.created_at)) {
            let entries: Result<Vec<Value>> = members
                .iter()
                .map(|(_, p)| serde_json::to_value(p).map_err(Into::into))
                .collect();
            self.archive.append(FAMILY_PROPOSALS, &group, entries?)?;
            for (path, p) in members {
                fs::remove_file(path)?;
                // Terminal records must not linger in the fast path.
                let _ = self.proposals.remove_staging(&p.id);
                result.archived_proposals += 1;
            }
        }
        Ok(())
    }

    fn archive_decisions(&self, result: &mut MergeResult) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(self.policy.archive_after_days as i64);
        let eligible: Vec<_> = self
            .decisions
            .live_records()?
            .into_iter()
            .filter(|(_, d)| d.decided_at < cutoff)
            .collect();
        if eligible.len() < self.policy.min_records {
            result.notes.push(format!(
                "decisions below threshold ({} < {})",
                eligible.len(),
                self.policy.min_records
            ));
            return Ok(());
        }
        for (group, members) in group_records(&eligible, |d| self.group_key(d.decision.as_str(), d.decided_at)) {
            let entries: Result<Vec<Value>> = members
                .iter()
                .map(|(_, d)| serde_json::to_value(d).map_err(Into::into))
                .collect();
            self.archive.append(FAMILY_DECISIONS, &group, entries?)?;
            for (path, _) in members {
                fs::remove_file(path)?;
                result.archived_decisions += 1;
            }
        }
        Ok(())
    }

    fn archive_history(&self, result: &mut MergeResult) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(self.policy.archive_after_days as i64);
        let eligible: Vec<_> = self
            .history
            .live_records()?
            .into_iter()
            .filter(|(_, h)| h.applied_at < cutoff)
            .collect();
        if eligible.len() < self.policy.min_records {
            result.notes.push(format!(
                "history below threshold ({} < {})",
                eligible.len(),
                self.policy.min_records
            ));
            return Ok(());
        }
        for (group, members) in group_records(&eligible, |h| self.group_key("applied", h.applied_at)) {
            let entries: Result<Vec<Value>> = members
                .iter()
                .map(|(_, h)| serde_json::to_value(h).map_err(Into::into))
                .collect();
            self.archive.append(FAMILY_HISTORY, &group, entries?)?;
            for (path, _) in members {
                fs::remove_file(path)?;
                result.archived_history += 1;
            }
        }
        Ok(())
    }

    /// (c) Merge aged live bundles into compressed monthly bundles.
    fn compress_old_bundles(&self, result: &mut MergeResult) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(self.policy.compress_after_days as i64);
        for family in [FAMILY_PROPOSALS, FAMILY_DECISIONS, FAMILY_HISTORY] {
            let aged: Vec<(PathBuf, String)> = self
                .archive
                .live_bundles(family)?
                .into_iter()
                .filter(|(_, b)| b.archived_at < cutoff)
                .map(|(p, b)| (p, b.archived_at.format("%Y-%m").to_string()))
                .collect();
            let mut months: Vec<String> = aged.iter().map(|(_, m)| m.clone()).collect();
            months.sort();
            months.dedup();
            for month in months {
                let sources: Vec<PathBuf> = aged
                    .iter()
                    .filter(|(_, m)| *m == month)
                    .map(|(p, _)| p.clone())
                    .collect();
                self.archive.compress_into_month(family, &month, &sources)?;
                result.compressed_bundles += sources.len();
            }
        }
        Ok(())
    }

    /// (d) Prune backups older than the retention window, by file age.
    fn prune_backups(&self, result: &mut MergeResult) -> Result<()> {
        let max_age = std::time::Duration::from_secs(
            u64::from(self.policy.retention_days) * 24 * 60 * 60,
        );
        let dir = self.history.backups_dir();
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let old = fs::metadata(&path)?
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if old {
                fs::remove_file(&path)?;
                result.pruned_backups += 1;
            }
        }
        Ok(())
    }

    /// Drop run-log lines older than the retention window.
    fn prune_run_log(&self, result: &mut MergeResult) -> Result<()> {
        let path = self.run_log_path();
        if !path.exists() {
            return Ok(());
        }
        let cutoff = Utc::now() - Duration::days(self.policy.retention_days as i64);
        let text = fs::read_to_string(&path)?;
        let mut kept = String::new();
        for line in text.lines() {
            let fresh = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| {
                    v.get("ts")
                        .and_then(|t| t.as_str())
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                })
                .map(|t| t.with_timezone(&Utc) >= cutoff)
                // Unparseable lines are kept; pruning is not a repair pass.
                .unwrap_or(true);
            if fresh {
                kept.push_str(line);
                kept.push('\n');
            } else {
                result.pruned_log_lines += 1;
            }
        }
        if result.pruned_log_lines > 0 {
            write_atomic(&path, kept.as_bytes())?;
        }
        Ok(())
    }

    // ---- internals ---------------------------------------------------------

    fn group_key(&self, status_label: &str, at: DateTime<Utc>) -> String {
        match self.policy.group_by {
            GroupBy::Status => status_label.to_string(),
            GroupBy::Day => at.format("%Y-%m-%d").to_string(),
            GroupBy::Month => at.format("%Y-%m").to_string(),
        }
    }

    fn run_log_path(&self) -> PathBuf {
        self.logbook_dir.join("compactions.jsonl")
    }

    fn log_run(&self, result: &MergeResult) {
        let line = json!({
            "ts": result.ran_at.to_rfc3339(),
            "event": "compaction_run",
            "result": result,
        });
        if let Err(e) = append_jsonl(&self.run_log_path(), &line) {
            tracing::warn!("compaction run log append failed: {e}");
        }
    }
}

/// Group `(path, record)` pairs by a derived key, preserving insertion order.
fn group_records<T: Clone>(
    records: &[(PathBuf, T)],
    key: impl Fn(&T) -> String,
) -> Vec<(String, Vec<(PathBuf, T)>)> {
    let mut out: Vec<(String, Vec<(PathBuf, T)>)> = Vec::new();
    for (path, rec) in records {
        let k = key(rec);
        match out.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, bucket)) => bucket.push((path.clone(), rec.clone())),
            None => out.push((k, vec![(path.clone(), rec.clone())])),
        }
    }
    out
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}
