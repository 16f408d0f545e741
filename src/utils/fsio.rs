// src/utils/fsio.rs
//! Shared filesystem primitives: atomic writes, JSONL appends, record I/O.
//!
//! Every store in this crate persists records as one JSON file per id and
//! bundles/logs as JSONL. All record writes go through [`write_atomic`] so a
//! crash mid-write can never leave a half-written file visible to readers.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomically write bytes to a file.
/// Uses a `.tmp` sibling then renames for crash-safety.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open temp file {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

/// Serialize a record pretty-printed (for auditability) and write it atomically.
pub fn write_json<S: Serialize>(path: &Path, value: &S) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serialize record")?;
    write_atomic(path, &bytes)
}

/// Read and deserialize a JSON record. `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parse {:?}", path))?;
    Ok(Some(value))
}

/// Append a single serialized value as one line to a JSONL file.
pub fn append_jsonl<S: Serialize>(path: &Path, value: &S) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(value)?;
    writeln!(f, "{}", json)?;
    Ok(())
}

/// List the `.json` record files directly under `dir`, skipping temp siblings.
/// Returns an empty list when the directory does not exist yet.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Sanitize an id before using it as a file name.
/// Keeps alphanumerics and `-`; everything else becomes `_`.
pub fn sanitize_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
