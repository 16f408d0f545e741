// src/services/mod.rs

pub mod audit;
pub mod locks;      // advisory TTL-bounded mutual exclusion
pub mod diff;       // unified-diff parse/apply/reverse + safety screens
pub mod schema;     // boundary interface to the structural validator
pub mod archive;    // bundle tier shared by the stores and the compactor
pub mod history;    // applied-change ledger + verbatim backups
pub mod proposals;  // staging/canonical tiered proposal store
pub mod decisions;  // one decision per proposal; the apply transition
pub mod compactor;  // moves settled records between storage tiers
pub mod scores;     // fire-and-forget per-skill scoring sink

// Public API
pub use archive::{ArchiveBundle, ArchiveStore};
pub use audit::Audit;
pub use compactor::{Compactor, CompactorStatus, MergeResult};
pub use decisions::{ApplyResult, Decision, DecisionKind, DecisionStore, NewDecision};
pub use diff::{ApplyOutcome, FileDiff, SafetyCheck};
pub use history::{HistoryEntry, HistoryStore, RollbackCheck};
pub use locks::{LockManager, LockRecord};
pub use proposals::{NewProposal, Proposal, ProposalFilter, ProposalStore, Scope, Status, Trigger};
pub use schema::{FieldPresenceValidator, RecordKind, SchemaValidator, Validation};
pub use scores::{ScoreSink, SqliteScoreSink};
