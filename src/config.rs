use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub compaction: CompactionPolicy,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.storage.proposals = absolutize(root, &self.storage.proposals);
        self.storage.active_proposals = absolutize(root, &self.storage.active_proposals);
        self.storage.decisions = absolutize(root, &self.storage.decisions);
        self.storage.history = absolutize(root, &self.storage.history);
        self.storage.backups = absolutize(root, &self.storage.backups);
        self.storage.archive = absolutize(root, &self.storage.archive);
        self.storage.archive_old = absolutize(root, &self.storage.archive_old);
        self.storage.locks = absolutize(root, &self.storage.locks);
        self.storage.logbook = absolutize(root, &self.storage.logbook);
        self.storage.scores_db = absolutize(root, &self.storage.scores_db);
        self.storage.user_skills = absolutize(root, &self.storage.user_skills);
        self.storage.project_skills = absolutize(root, &self.storage.project_skills);
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            storage: StorageConfig::default(),
            locks: LockConfig::default(),
            compaction: CompactionPolicy::default(),
            policies: PoliciesConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "skillpatch".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_proposals")]
    pub proposals: PathBuf,
    /// Staging tier: pending proposals mirrored for fast uncontended reads.
    #[serde(default = "StorageConfig::default_active_proposals")]
    pub active_proposals: PathBuf,
    #[serde(default = "StorageConfig::default_decisions")]
    pub decisions: PathBuf,
    #[serde(default = "StorageConfig::default_history")]
    pub history: PathBuf,
    #[serde(default = "StorageConfig::default_backups")]
    pub backups: PathBuf,
    #[serde(default = "StorageConfig::default_archive")]
    pub archive: PathBuf,
    #[serde(default = "StorageConfig::default_archive_old")]
    pub archive_old: PathBuf,
    #[serde(default = "StorageConfig::default_locks")]
    pub locks: PathBuf,
    #[serde(default = "StorageConfig::default_logbook")]
    pub logbook: PathBuf,
    #[serde(default = "StorageConfig::default_scores_db")]
    pub scores_db: PathBuf,
    #[serde(default = "StorageConfig::default_user_skills")]
    pub user_skills: PathBuf,
    #[serde(default = "StorageConfig::default_project_skills")]
    pub project_skills: PathBuf,
}

impl StorageConfig {
    fn default_proposals() -> PathBuf {
        PathBuf::from("proposals")
    }

    fn default_active_proposals() -> PathBuf {
        PathBuf::from("active/proposals")
    }

    fn default_decisions() -> PathBuf {
        PathBuf::from("decisions")
    }

    fn default_history() -> PathBuf {
        PathBuf::from("history")
    }

    fn default_backups() -> PathBuf {
        PathBuf::from("backups")
    }

    fn default_archive() -> PathBuf {
        PathBuf::from("archive")
    }

    fn default_archive_old() -> PathBuf {
        PathBuf::from("archive/old")
    }

    fn default_locks() -> PathBuf {
        PathBuf::from("locks")
    }

    fn default_logbook() -> PathBuf {
        PathBuf::from("logbook")
    }

    fn default_scores_db() -> PathBuf {
        PathBuf::from("cache/scores.db")
    }

    fn default_user_skills() -> PathBuf {
        PathBuf::from("skills/user")
    }

    fn default_project_skills() -> PathBuf {
        PathBuf::from("skills/project")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            proposals: Self::default_proposals(),
            active_proposals: Self::default_active_proposals(),
            decisions: Self::default_decisions(),
            history: Self::default_history(),
            backups: Self::default_backups(),
            archive: Self::default_archive(),
            archive_old: Self::default_archive_old(),
            locks: Self::default_locks(),
            logbook: Self::default_logbook(),
            scores_db: Self::default_scores_db(),
            user_skills: Self::default_user_skills(),
            project_skills: Self::default_project_skills(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lease length applied when a caller does not pass an explicit TTL.
    #[serde(default = "LockConfig::default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl LockConfig {
    fn default_ttl_secs() -> u64 {
        120
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: Self::default_ttl_secs(),
        }
    }
}

// -------------------------------------------------------------------------
// Compaction policy (used by services::compactor)
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Status,
    Day,
    Month,
}

impl Default for GroupBy {
    fn default() -> Self {
        GroupBy::Month
    }
}

impl GroupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::Status => "status",
            GroupBy::Day => "day",
            GroupBy::Month => "month",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPolicy {
    #[serde(default)]
    pub group_by: GroupBy,
    /// Terminal records younger than this stay as per-record files.
    #[serde(default = "CompactionPolicy::default_archive_after_days")]
    pub archive_after_days: u32,
    /// A record family is only bundled once this many eligible files exist.
    #[serde(default = "CompactionPolicy::default_min_records")]
    pub min_records: usize,
    /// Live bundles older than this merge into compressed monthly bundles.
    #[serde(default = "CompactionPolicy::default_compress_after_days")]
    pub compress_after_days: u32,
    /// Backups and compaction-run logs older than this are pruned.
    #[serde(default = "CompactionPolicy::default_retention_days")]
    pub retention_days: u32,
}

impl CompactionPolicy {
    fn default_archive_after_days() -> u32 {
        7
    }

    fn default_min_records() -> usize {
        20
    }

    fn default_compress_after_days() -> u32 {
        30
    }

    fn default_retention_days() -> u32 {
        90
    }
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            group_by: GroupBy::default(),
            archive_after_days: Self::default_archive_after_days(),
            min_records: Self::default_min_records(),
            compress_after_days: Self::default_compress_after_days(),
            retention_days: Self::default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoliciesConfig {
    /// Mismatched context lines tolerated per hunk before a patch is refused.
    #[serde(default = "PoliciesConfig::default_fuzz_factor")]
    pub fuzz_factor: usize,
    #[serde(default = "PoliciesConfig::default_log_preview_len")]
    pub log_preview_len: usize,
    /// Directory prefixes a proposal diff is allowed to target.
    #[serde(default = "PoliciesConfig::default_allowed_diff_targets")]
    pub allowed_diff_targets: Vec<String>,
}

impl PoliciesConfig {
    fn default_fuzz_factor() -> usize {
        2
    }

    fn default_log_preview_len() -> usize {
        160
    }

    fn default_allowed_diff_targets() -> Vec<String> {
        vec!["skills/".to_string()]
    }
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            fuzz_factor: Self::default_fuzz_factor(),
            log_preview_len: Self::default_log_preview_len(),
            allowed_diff_targets: Self::default_allowed_diff_targets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "ServicesConfig::default_true")]
    pub audit_enabled: bool,
    #[serde(default = "ServicesConfig::default_true")]
    pub scores_enabled: bool,
}

impl ServicesConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            audit_enabled: true,
            scores_enabled: true,
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
