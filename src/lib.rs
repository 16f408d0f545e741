//! skillpatch: a durable, auditable approval workflow for text-file edits
//! expressed as unified diffs.
//!
//! A change to a skill file is *proposed*, *decided* (approved or rejected),
//! *applied* with an automatic backup, and may later be *rolled back*. All
//! state (proposals, decisions, applied-change history) persists as
//! discrete JSON records in a directory-based workspace, with periodic
//! compaction into dated archive bundles to bound the number of live files.
//!
//! Entry point: [`Commands::open`] bootstraps a workspace and returns the
//! context handle everything else hangs off.
//!
//! ```no_run
//! use skillpatch::{Commands, NewProposal, NewDecision, DecisionKind, Scope, Trigger};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cmds = Commands::open(".skillpatch")?;
//! let proposal = cmds.create_proposal(NewProposal {
//!     skill_name: "review".into(),
//!     scope: Scope::Project,
//!     reason: "tighten the checklist".into(),
//!     diff: "--- a/skills/review/SKILL.md\n+++ b/skills/review/SKILL.md\n@@ -1,1 +1,2 @@\n # Review\n+Check error paths first.\n".into(),
//!     trigger: Trigger::Human,
//!     source: "cli".into(),
//!     proposer_name: None,
//! })?;
//! cmds.decide(NewDecision {
//!     proposal_id: proposal.id.clone(),
//!     decision: DecisionKind::Approve,
//!     reason: "good change".into(),
//!     decided_by: "reviewer".into(),
//! })?;
//! let applied = cmds.apply(&proposal.id, "reviewer")?;
//! assert!(applied.success);
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod errors;
pub mod services;
pub mod utils;

pub use commands::{Commands, DiffValidation, PreviewResult, RollbackResult, RollbackStrategy};
pub use config::{CompactionPolicy, CoreConfig, GroupBy};
pub use errors::WorkflowError;
pub use services::{
    ApplyResult, Decision, DecisionKind, HistoryEntry, MergeResult, NewDecision, NewProposal,
    Proposal, ProposalFilter, Scope, Status, Trigger,
};
