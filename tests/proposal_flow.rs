// tests/proposal_flow.rs
// End-to-end lifecycle through the Commands façade: propose → decide →
// apply → rollback, plus the conflict and reconciliation rules.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tempfile::TempDir;

use skillpatch::{
    Commands, DecisionKind, NewDecision, NewProposal, ProposalFilter, RollbackStrategy, Scope,
    Status, Trigger, WorkflowError,
};
use skillpatch::services::proposals::ProposalUpdate;

fn workspace() -> (TempDir, Commands) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cmds = Commands::open(dir.path().join(".skillpatch")).expect("open workspace");
    (dir, cmds)
}

fn skill_file(cmds: &Commands, skill: &str) -> PathBuf {
    cmds.config()
        .storage
        .project_skills
        .join(skill)
        .join("SKILL.md")
}

fn seed_skill(cmds: &Commands, skill: &str, content: &str) {
    let path = skill_file(cmds, skill);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
}

fn add_line_diff(skill: &str, context: &[&str], added: &str) -> String {
    let mut d = format!(
        "--- a/skills/{skill}/SKILL.md\n+++ b/skills/{skill}/SKILL.md\n@@ -1,{} +1,{} @@\n",
        context.len(),
        context.len() + 1
    );
    for line in context {
        d.push(' ');
        d.push_str(line);
        d.push('\n');
    }
    d.push('+');
    d.push_str(added);
    d.push('\n');
    d
}

fn propose(cmds: &Commands, skill: &str, diff: String) -> skillpatch::Proposal {
    cmds.create_proposal(NewProposal {
        skill_name: skill.to_string(),
        scope: Scope::Project,
        reason: "improve the skill".to_string(),
        diff,
        trigger: Trigger::Human,
        source: "tests".to_string(),
        proposer_name: Some("reviewer".to_string()),
    })
    .expect("create proposal")
}

fn approve(cmds: &Commands, proposal_id: &str) {
    cmds.decide(NewDecision {
        proposal_id: proposal_id.to_string(),
        decision: DecisionKind::Approve,
        reason: "looks good".to_string(),
        decided_by: "reviewer".to_string(),
    })
    .expect("approve");
}

#[test]
fn full_lifecycle_apply_then_rollback() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");

    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "Added line"),
    );
    assert_eq!(proposal.status, Status::Pending);

    approve(&cmds, &proposal.id);
    let stored = cmds.get_proposal(&proposal.id)?.unwrap();
    assert_eq!(stored.status, Status::Approved);

    let applied = cmds.apply(&proposal.id, "reviewer")?;
    assert!(applied.success, "{}", applied.message);
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "demo"))?,
        "# Title\nContent\nAdded line\n"
    );

    let history_id = applied.history_id.expect("history id");
    let entry = cmds.get_history(&history_id)?.expect("history entry");
    assert_eq!(entry.original_content, "# Title\nContent\n");
    assert_eq!(entry.proposal_id, proposal.id);
    assert!(entry.rolled_back_at.is_none());

    let decision = cmds.get_decision(&proposal.id)?.unwrap();
    assert!(decision.applied_at.is_some());

    let rolled = cmds.rollback(&history_id, RollbackStrategy::Auto)?;
    assert!(rolled.success, "{}", rolled.message);
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "demo"))?,
        "# Title\nContent\n"
    );
    assert!(cmds.get_history(&history_id)?.unwrap().rolled_back_at.is_some());
    Ok(())
}

#[test]
fn apply_without_decision_reports_decision_not_found() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "x"),
    );
    let result = cmds.apply(&proposal.id, "reviewer")?;
    assert!(!result.success);
    assert_eq!(result.message, "Decision not found");
    Ok(())
}

#[test]
fn apply_of_rejected_decision_is_refused() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "x"),
    );
    cmds.decide(NewDecision {
        proposal_id: proposal.id.clone(),
        decision: DecisionKind::Reject,
        reason: "not wanted".to_string(),
        decided_by: "reviewer".to_string(),
    })?;

    let result = cmds.apply(&proposal.id, "reviewer")?;
    assert!(!result.success);
    assert_eq!(result.message, "Cannot apply rejected decision");
    // The target file is untouched.
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "demo"))?,
        "# Title\nContent\n"
    );
    Ok(())
}

#[test]
fn apply_succeeds_at_most_once() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "once"),
    );
    approve(&cmds, &proposal.id);

    assert!(cmds.apply(&proposal.id, "reviewer")?.success);
    let second = cmds.apply(&proposal.id, "reviewer")?;
    assert!(!second.success);
    assert_eq!(second.message, "Proposal already applied");
    Ok(())
}

#[test]
fn duplicate_decisions_merge_by_event_order() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "keep"),
    );
    approve(&cmds, &proposal.id);

    // A later, contradictory submission is not an error; the first wins.
    let second = cmds.decide(NewDecision {
        proposal_id: proposal.id.clone(),
        decision: DecisionKind::Reject,
        reason: "changed my mind".to_string(),
        decided_by: "someone-else".to_string(),
    })?;
    assert_eq!(second.decision, DecisionKind::Approve);
    assert_eq!(second.decided_by, "reviewer");

    // Status always equals the first decision's implied status.
    assert_eq!(cmds.get_proposal(&proposal.id)?.unwrap().status, Status::Approved);
    Ok(())
}

#[test]
fn decision_for_missing_proposal_is_not_found() {
    let (_dir, cmds) = workspace();
    let err = cmds
        .decide(NewDecision {
            proposal_id: "no-such-id".to_string(),
            decision: DecisionKind::Approve,
            reason: "n/a".to_string(),
            decided_by: "reviewer".to_string(),
        })
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::NotFound(_))
    ));
}

#[test]
fn tier_reconciliation_prefers_non_pending_copy() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "x"),
    );

    let canonical = cmds
        .config()
        .storage
        .proposals
        .join(format!("{}.json", proposal.id));
    let staging = cmds
        .config()
        .storage
        .active_proposals
        .join(format!("{}.json", proposal.id));
    assert!(canonical.exists() && staging.exists());

    // Simulate the canonical copy advancing while staging lags pending.
    let mut record: Value = serde_json::from_slice(&fs::read(&canonical)?)?;
    record["status"] = Value::String("approved".to_string());
    fs::write(&canonical, serde_json::to_vec_pretty(&record)?)?;

    let got = cmds.get_proposal(&proposal.id)?.unwrap();
    assert_eq!(got.status, Status::Approved, "non-pending copy must win");

    // A real transition out of pending deletes the staging copy.
    approve(&cmds, &proposal.id);
    assert!(!staging.exists(), "staging copy must be gone after decision");
    assert!(canonical.exists());
    Ok(())
}

#[test]
fn pending_listing_excludes_ids_with_a_decision_on_file() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "x"),
    );
    let pending_copy = cmds.get_proposal(&proposal.id)?.unwrap();

    cmds.decide(NewDecision {
        proposal_id: proposal.id.clone(),
        decision: DecisionKind::Reject,
        reason: "no".to_string(),
        decided_by: "reviewer".to_string(),
    })?;

    // Simulate a lagging staging tier resurfacing the pending copy.
    let staging = cmds
        .config()
        .storage
        .active_proposals
        .join(format!("{}.json", proposal.id));
    fs::write(&staging, serde_json::to_vec_pretty(&pending_copy)?)?;

    let pending = cmds.list_pending_proposals()?;
    assert!(
        pending.iter().all(|p| p.id != proposal.id),
        "decided id must not resurface as pending"
    );
    Ok(())
}

#[test]
fn diff_is_mutable_only_while_pending() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "first"),
    );

    let edited = cmds.update_proposal(
        &proposal.id,
        ProposalUpdate {
            diff: Some(add_line_diff("demo", &["# Title", "Content"], "second")),
            status: None,
        },
    )?;
    assert!(edited.diff.contains("second"));

    approve(&cmds, &proposal.id);
    let err = cmds
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                diff: Some("anything".to_string()),
                status: None,
            },
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Conflict(_))
    ));
    Ok(())
}

#[test]
fn approving_an_unsafe_diff_fails_validation() {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title"], "please eval(this)"),
    );
    let err = cmds
        .decide(NewDecision {
            proposal_id: proposal.id.clone(),
            decision: DecisionKind::Approve,
            reason: "oops".to_string(),
            decided_by: "reviewer".to_string(),
        })
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Validation(_))
    ));
    // The failed approval must not have moved the status.
    assert_eq!(
        cmds.get_proposal(&proposal.id).unwrap().unwrap().status,
        Status::Pending
    );
}

#[test]
fn create_rejects_schema_invalid_proposal() {
    let (_dir, cmds) = workspace();
    let err = cmds
        .create_proposal(NewProposal {
            skill_name: "demo".to_string(),
            scope: Scope::Project,
            reason: "no diff".to_string(),
            diff: String::new(),
            trigger: Trigger::Agent,
            source: "tests".to_string(),
            proposer_name: None,
        })
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Validation(_))
    ));
}

#[test]
fn delete_removes_record_from_every_tier() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "x"),
    );

    cmds.delete_proposal(&proposal.id)?;
    assert!(cmds.get_proposal(&proposal.id)?.is_none());

    let err = cmds.delete_proposal(&proposal.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn rollback_ordering_is_enforced_per_skill() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "stack", "# Title\nContent\n");

    let a = propose(
        &cmds,
        "stack",
        add_line_diff("stack", &["# Title", "Content"], "Line A"),
    );
    approve(&cmds, &a.id);
    let applied_a = cmds.apply(&a.id, "reviewer")?;
    assert!(applied_a.success);
    let history_a = applied_a.history_id.unwrap();

    let b = propose(
        &cmds,
        "stack",
        add_line_diff("stack", &["# Title", "Content", "Line A"], "Line B"),
    );
    approve(&cmds, &b.id);
    let applied_b = cmds.apply(&b.id, "reviewer")?;
    assert!(applied_b.success);
    let history_b = applied_b.history_id.unwrap();

    // A sits under B: refused.
    let check_a = cmds.can_rollback(&history_a)?;
    assert!(!check_a.ok);
    let refused = cmds.rollback(&history_a, RollbackStrategy::Auto)?;
    assert!(!refused.success);

    // Undo B, then A becomes eligible again.
    assert!(cmds.rollback(&history_b, RollbackStrategy::Auto)?.success);
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "stack"))?,
        "# Title\nContent\nLine A\n"
    );
    assert!(cmds.can_rollback(&history_a)?.ok);
    assert!(cmds.rollback(&history_a, RollbackStrategy::Auto)?.success);
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "stack"))?,
        "# Title\nContent\n"
    );

    // A second rollback of the same entry is a conflict.
    let again = cmds.rollback(&history_a, RollbackStrategy::Auto)?;
    assert!(!again.success);
    Ok(())
}

#[test]
fn rollback_from_backup_restores_snapshot() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "Added line"),
    );
    approve(&cmds, &proposal.id);
    let applied = cmds.apply(&proposal.id, "reviewer")?;
    let history_id = applied.history_id.unwrap();

    let rolled = cmds.rollback(&history_id, RollbackStrategy::Backup)?;
    assert!(rolled.success, "{}", rolled.message);
    assert_eq!(rolled.restored_from, Some("backup"));
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "demo"))?,
        "# Title\nContent\n"
    );
    Ok(())
}

#[test]
fn preview_reports_result_without_mutating() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "demo", "# Title\nContent\n");
    let proposal = propose(
        &cmds,
        "demo",
        add_line_diff("demo", &["# Title", "Content"], "Preview line"),
    );

    let preview = cmds.preview(&proposal.id)?;
    assert!(preview.success);
    assert_eq!(
        preview.new_content.as_deref(),
        Some("# Title\nContent\nPreview line\n")
    );
    // Target untouched by preview.
    assert_eq!(
        fs::read_to_string(skill_file(&cmds, "demo"))?,
        "# Title\nContent\n"
    );

    let report = cmds.validate_proposal_diff(&proposal.id)?;
    assert!(report.parses && report.safety.safe && report.target_paths.safe);
    assert_eq!(report.hunk_count, 1);
    Ok(())
}

#[test]
fn proposal_listing_filters_by_status_and_skill() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace();
    seed_skill(&cmds, "one", "# Title\n");
    seed_skill(&cmds, "two", "# Title\n");
    let p1 = propose(&cmds, "one", add_line_diff("one", &["# Title"], "a"));
    let _p2 = propose(&cmds, "two", add_line_diff("two", &["# Title"], "b"));

    approve(&cmds, &p1.id);

    let approved = cmds.list_proposals(&ProposalFilter {
        status: Some(Status::Approved),
        ..ProposalFilter::default()
    })?;
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].id, p1.id);

    let by_skill = cmds.list_proposals(&ProposalFilter {
        skill_name: Some("two".to_string()),
        ..ProposalFilter::default()
    })?;
    assert_eq!(by_skill.len(), 1);
    assert_eq!(by_skill[0].skill_name, "two");
    Ok(())
}
