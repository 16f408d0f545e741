// src/commands/init.rs

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

/// Ensure the workspace layout exists under `root` (idempotent).
/// Safe to call often; callers keep the returned report as their context
/// handle rather than relying on any process-global state.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let root = root.to_path_buf();
    let mut created = Vec::new();
    let mut existed = Vec::new();

    // Directories
    ensure_dir(&root, "", &mut created, &mut existed)?;
    ensure_dir(&root, "proposals", &mut created, &mut existed)?;
    ensure_dir(&root.join("active"), "proposals", &mut created, &mut existed)?;
    ensure_dir(&root, "decisions", &mut created, &mut existed)?;
    ensure_dir(&root, "history", &mut created, &mut existed)?;
    ensure_dir(&root, "backups", &mut created, &mut existed)?;
    ensure_dir(&root, "archive", &mut created, &mut existed)?;
    ensure_dir(&root.join("archive"), "old", &mut created, &mut existed)?;
    ensure_dir(&root, "locks", &mut created, &mut existed)?;
    ensure_dir(&root, "logbook", &mut created, &mut existed)?;
    ensure_dir(&root, "cache", &mut created, &mut existed)?;
    ensure_dir(&root.join("skills"), "user", &mut created, &mut existed)?;
    ensure_dir(&root.join("skills"), "project", &mut created, &mut existed)?;

    // Config
    ensure_file(
        &root,
        "config.toml",
        Some(DEFAULT_CONFIG_TOML),
        &mut created,
        &mut existed,
    )?;

    // Logbook streams (per-stream JSONL files)
    initialize_logbook_files(&root, &mut created, &mut existed)?;

    Ok(InitReport {
        root,
        created,
        existed,
    })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    };
    if p.exists() {
        existed.push(if rel.is_empty() { ".".to_string() } else { rel.to_string() });
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(if rel.is_empty() { ".".to_string() } else { rel.to_string() });
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: Option<&str>,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    if let Some(text) = content_if_absent {
        write_atomic(&p, text.as_bytes())?;
    } else {
        write_atomic(&p, b"")?;
    }
    created.push(rel_file.to_string());
    Ok(())
}

fn ensure_seeded_jsonl(
    dir: &Path,
    file: &str,
    init_line: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = dir.join(file);
    if !p.exists() {
        ensure_file(dir, file, Some(&(init_line.to_string() + "\n")), created, existed)?;
        return Ok(());
    }
    existed.push(file.to_string());
    // If exists but empty, seed it
    if fs::metadata(&p)?.len() == 0 {
        let mut f = OpenOptions::new().append(true).open(&p)?;
        f.write_all(init_line.as_bytes())?;
        f.write_all(b"\n")?;
    }
    Ok(())
}

fn initialize_logbook_files(
    root: &Path,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let ts = Utc::now().to_rfc3339();
    let init_event = format!(
        r#"{{"ts":"{}","event":"system_init","agent":"system","data":{{"version":"0.1.0"}}}}"#,
        ts
    );

    let log_dir = root.join("logbook");
    ensure_dir(root, "logbook", created, existed)?;
    ensure_seeded_jsonl(&log_dir, "actions.jsonl", &init_event, created, existed)?;
    ensure_seeded_jsonl(&log_dir, "compactions.jsonl", &init_event, created, existed)?;
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "skillpatch"
version = "0.1.0"

[storage]
proposals = "proposals"
active_proposals = "active/proposals"
decisions = "decisions"
history = "history"
backups = "backups"
archive = "archive"
archive_old = "archive/old"
locks = "locks"
logbook = "logbook"
scores_db = "cache/scores.db"
user_skills = "skills/user"
project_skills = "skills/project"

[locks]
default_ttl_secs = 120

[compaction]
group_by = "month"
archive_after_days = 7
min_records = 20
compress_after_days = 30
retention_days = 90

[policies]
fuzz_factor = 2
log_preview_len = 160
allowed_diff_targets = ["skills/"]

[services]
audit_enabled = true
scores_enabled = true
"#;
