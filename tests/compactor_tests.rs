// tests/compactor_tests.rs
// Archival compactor: staging moves, bundling, compression, and the
// skip-while-writing rule. Policies are tightened via config.toml so records
// become eligible immediately.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use skillpatch::services::locks::LockManager;
use skillpatch::{
    Commands, DecisionKind, NewDecision, NewProposal, RollbackStrategy, Scope, Status, Trigger,
};

fn workspace_with_policy(compaction_toml: &str) -> (TempDir, Commands) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join(".skillpatch");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("config.toml"), compaction_toml).unwrap();
    let cmds = Commands::open(&root).expect("open workspace");
    (dir, cmds)
}

const EAGER_BUNDLING: &str = "[compaction]\n\
group_by = \"status\"\n\
archive_after_days = 0\n\
min_records = 1\n\
compress_after_days = 9999\n";

const EAGER_COMPRESSION: &str = "[compaction]\n\
group_by = \"status\"\n\
archive_after_days = 0\n\
min_records = 1\n\
compress_after_days = 0\n";

fn seed_skill(cmds: &Commands, skill: &str, content: &str) {
    let path = cmds
        .config()
        .storage
        .project_skills
        .join(skill)
        .join("SKILL.md");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
}

fn propose(cmds: &Commands, skill: &str, added: &str) -> skillpatch::Proposal {
    cmds.create_proposal(NewProposal {
        skill_name: skill.to_string(),
        scope: Scope::Project,
        reason: "tidy up".to_string(),
        diff: format!(
            "--- a/skills/{skill}/SKILL.md\n+++ b/skills/{skill}/SKILL.md\n@@ -1,1 +1,2 @@\n # Title\n+{added}\n"
        ),
        trigger: Trigger::Crawler,
        source: "tests".to_string(),
        proposer_name: None,
    })
    .expect("create proposal")
}

fn decide(cmds: &Commands, proposal_id: &str, decision: DecisionKind) {
    cmds.decide(NewDecision {
        proposal_id: proposal_id.to_string(),
        decision,
        reason: "reviewed".to_string(),
        decided_by: "reviewer".to_string(),
    })
    .expect("decide");
}

fn json_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn compaction_skips_while_a_write_is_in_flight() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_BUNDLING);
    let locks = LockManager::open(cmds.config().storage.locks.clone())?;

    assert!(locks.acquire("apply", 60)?);
    let result = cmds.compact()?;
    assert!(result.skipped);
    assert_eq!(result.archived_proposals, 0);

    locks.release("apply")?;
    let result = cmds.compact()?;
    assert!(!result.skipped);
    Ok(())
}

#[test]
fn pending_proposals_move_into_the_staging_tier() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_BUNDLING);
    seed_skill(&cmds, "demo", "# Title\n");
    let proposal = propose(&cmds, "demo", "extra");

    let canonical = cmds
        .config()
        .storage
        .proposals
        .join(format!("{}.json", proposal.id));
    assert!(canonical.exists());

    let result = cmds.compact()?;
    assert_eq!(result.staged_pending, 1);
    assert!(!canonical.exists(), "pending record moved out of canonical");

    // Still readable, still pending, and the decision path still works.
    let got = cmds.get_proposal(&proposal.id)?.unwrap();
    assert_eq!(got.status, Status::Pending);
    decide(&cmds, &proposal.id, DecisionKind::Approve);
    assert_eq!(cmds.get_proposal(&proposal.id)?.unwrap().status, Status::Approved);
    Ok(())
}

#[test]
fn settled_records_bundle_and_stay_discoverable() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_BUNDLING);
    seed_skill(&cmds, "demo", "# Title\n");
    let proposal = propose(&cmds, "demo", "extra");
    decide(&cmds, &proposal.id, DecisionKind::Reject);

    let result = cmds.compact()?;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.archived_proposals, 1);
    assert_eq!(result.archived_decisions, 1);

    // Per-record files are gone; the archive answers reads transparently.
    assert_eq!(json_files(&cmds.config().storage.proposals), 0);
    assert_eq!(json_files(&cmds.config().storage.decisions), 0);
    let got = cmds.get_proposal(&proposal.id)?.expect("archived proposal");
    assert_eq!(got.status, Status::Rejected);
    assert!(cmds.get_decision(&proposal.id)?.is_some());

    // Explicit delete reaches into the bundle too.
    cmds.delete_proposal(&proposal.id)?;
    assert!(cmds.get_proposal(&proposal.id)?.is_none());
    Ok(())
}

#[test]
fn bundled_history_still_supports_rollback() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_BUNDLING);
    seed_skill(&cmds, "demo", "# Title\n");
    let proposal = propose(&cmds, "demo", "Added line");
    decide(&cmds, &proposal.id, DecisionKind::Approve);
    let applied = cmds.apply(&proposal.id, "reviewer")?;
    assert!(applied.success, "{}", applied.message);
    let history_id = applied.history_id.unwrap();

    let result = cmds.compact()?;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.archived_history, 1);
    assert_eq!(json_files(&cmds.config().storage.history), 0);

    // Fresh backups survive compaction (retention is 90 days by default).
    let backups = cmds.config().storage.backups.clone();
    assert_eq!(fs::read_dir(&backups)?.count(), 1);

    let entry = cmds.get_history(&history_id)?.expect("archived entry");
    assert!(entry.rolled_back_at.is_none());
    assert!(cmds.can_rollback(&history_id)?.ok);

    let rolled = cmds.rollback(&history_id, RollbackStrategy::Auto)?;
    assert!(rolled.success, "{}", rolled.message);
    assert_eq!(
        fs::read_to_string(
            cmds.config()
                .storage
                .project_skills
                .join("demo")
                .join("SKILL.md")
        )?,
        "# Title\n"
    );
    // The bundle was rewritten in place.
    assert!(cmds.get_history(&history_id)?.unwrap().rolled_back_at.is_some());
    Ok(())
}

#[test]
fn aged_bundles_compress_and_remain_searchable() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_COMPRESSION);
    seed_skill(&cmds, "demo", "# Title\n");
    let proposal = propose(&cmds, "demo", "extra");
    decide(&cmds, &proposal.id, DecisionKind::Reject);

    let result = cmds.compact()?;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert!(result.compressed_bundles >= 1);

    let old_dir = &cmds.config().storage.archive_old;
    let gz_count = fs::read_dir(old_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json.gz"))
        .count();
    assert!(gz_count >= 1, "compressed bundles expected under old/");
    // No uncompressed bundle should remain for the proposals family.
    assert_eq!(json_files(&cmds.config().storage.archive), 0);

    // Reads reach through the compressed tier.
    let got = cmds.get_proposal(&proposal.id)?.expect("compressed proposal");
    assert_eq!(got.status, Status::Rejected);
    Ok(())
}

#[test]
fn compaction_runs_are_logged_and_reported() -> anyhow::Result<()> {
    let (_dir, cmds) = workspace_with_policy(EAGER_BUNDLING);
    cmds.compact()?;
    cmds.compact()?;

    let runs = cmds.compactor_history(10)?;
    assert!(runs.len() >= 2);
    let status = cmds.compactor_status();
    assert!(status.last_run.is_some());
    Ok(())
}
