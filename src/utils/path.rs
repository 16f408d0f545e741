// src/utils/path.rs
//! Target-file resolution: `(skill_name, scope base dir)` → absolute skill
//! file path, constrained to the base directory. This is the last line of
//! defense before any file write, independent of the diff-header checks.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// File name every skill keeps its editable content under.
pub const SKILL_FILE_NAME: &str = "SKILL.md";

/// Resolve the skill file for `skill_name` under `base`.
///
/// Rejects empty names, absolute names, and any `..` component, then verifies
/// the resolved location stays inside the canonicalized base (symlink-escape
/// defense via the parent-canonicalization check).
pub fn resolve_skill_path(base: &Path, skill_name: &str) -> Result<PathBuf> {
    let name = sanitize_skill_name(skill_name)?;
    let candidate = base.join(&name).join(SKILL_FILE_NAME);
    assert_within_root_abs(base, &candidate)
}

/// Validate a skill name for use as a path segment.
/// Normalizes separators to `/` and allows nested names like `review/rust`.
pub fn sanitize_skill_name(name: &str) -> Result<String> {
    let p = Path::new(name);
    if p.is_absolute() {
        anyhow::bail!("absolute skill names are not allowed");
    }
    for c in p.components() {
        if matches!(c, Component::ParentDir) {
            anyhow::bail!("parent paths not allowed in skill name");
        }
    }
    let s = name.trim().trim_matches('/').replace('\\', "/");
    if s.is_empty() {
        anyhow::bail!("empty skill name");
    }
    Ok(s)
}

/// Ensure that a candidate absolute path resolves (or its parent resolves) to
/// a location contained within the canonicalized `root_abs`. Returns the
/// canonicalized path that was checked.
///
/// For creation paths that don't exist yet, this canonicalizes the deepest
/// existing ancestor and rejoins the remainder to prevent symlink escapes.
pub fn assert_within_root_abs(root_abs: &Path, candidate_abs: &Path) -> Result<PathBuf> {
    let root = root_abs
        .canonicalize()
        .with_context(|| format!("canonicalize root {:?}", root_abs))?;

    let resolved = match candidate_abs.canonicalize() {
        Ok(c) => c,
        Err(_) => {
            let mut existing = candidate_abs.to_path_buf();
            let mut tail: Vec<std::ffi::OsString> = Vec::new();
            while !existing.exists() {
                let Some(leaf) = existing.file_name() else {
                    anyhow::bail!("invalid path: no existing ancestor for {:?}", candidate_abs);
                };
                tail.push(leaf.to_os_string());
                existing = existing
                    .parent()
                    .ok_or_else(|| anyhow::anyhow!("invalid path: no parent"))?
                    .to_path_buf();
            }
            let mut canon = existing
                .canonicalize()
                .with_context(|| format!("canonicalize ancestor {:?}", existing))?;
            for leaf in tail.into_iter().rev() {
                canon.push(leaf);
            }
            canon
        }
    };

    if !resolved.starts_with(&root) {
        anyhow::bail!(
            "path escapes root: path={:?} root={:?}",
            candidate_abs,
            root
        );
    }
    Ok(resolved)
}
