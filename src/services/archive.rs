// src/services/archive.rs
//! Bundle tier shared by the stores and the compactor.
//!
//! A bundle is one JSON file holding many settled records of a single family
//! plus `archived_at`/`count` metadata. Bundles old enough to retire merge
//! into gzip'd monthly files under `old/`. Readers search per-record files
//! first (the stores do that part), then live bundles, then compressed ones;
//! a record moved into a bundle stays discoverable, updatable, and deletable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::utils::fsio::{list_json_files, write_atomic, write_json};

pub const FAMILY_PROPOSALS: &str = "proposals";
pub const FAMILY_DECISIONS: &str = "decisions";
pub const FAMILY_HISTORY: &str = "history";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveBundle {
    pub archived_at: DateTime<Utc>,
    pub count: usize,
    pub entries: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
    old_dir: PathBuf,
}

impl ArchiveStore {
    pub fn open(dir: impl Into<PathBuf>, old_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let old_dir = old_dir.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&old_dir)?;
        Ok(Self { dir, old_dir })
    }

    /// Append entries to the `<family>-<group>.json` bundle, creating it if
    /// needed. Read-modify-write with an atomic rename; `archived_at` is
    /// refreshed and `count` kept in sync with `entries.len()`.
    pub fn append(&self, family: &str, group: &str, mut entries: Vec<Value>) -> Result<PathBuf> {
        let path = self.bundle_path(family, group);
        let mut bundle = match read_bundle(&path)? {
            Some(existing) => existing,
            None => ArchiveBundle {
                archived_at: Utc::now(),
                count: 0,
                entries: Vec::new(),
            },
        };
        bundle.entries.append(&mut entries);
        bundle.count = bundle.entries.len();
        bundle.archived_at = Utc::now();
        write_json(&path, &bundle)?;
        Ok(path)
    }

    /// Locate a record by id across live and compressed bundles.
    pub fn find(&self, family: &str, id_field: &str, id: &str) -> Result<Option<Value>> {
        for path in self.live_bundle_paths(family)? {
            if let Some(bundle) = read_bundle(&path)? {
                if let Some(v) = pick(&bundle.entries, id_field, id) {
                    return Ok(Some(v.clone()));
                }
            }
        }
        for path in self.old_bundle_paths(family)? {
            let bundle = read_compressed_bundle(&path)?;
            if let Some(v) = pick(&bundle.entries, id_field, id) {
                return Ok(Some(v.clone()));
            }
        }
        Ok(None)
    }

    /// Mutate a bundled record in place. Returns `false` when no bundle holds
    /// the id. The containing bundle is rewritten atomically (recompressed
    /// when it lives in the old tier).
    pub fn update_entry(
        &self,
        family: &str,
        id_field: &str,
        id: &str,
        mutate: impl FnOnce(&mut Value),
    ) -> Result<bool> {
        for path in self.live_bundle_paths(family)? {
            if let Some(mut bundle) = read_bundle(&path)? {
                if let Some(entry) = pick_mut(&mut bundle.entries, id_field, id) {
                    mutate(entry);
                    write_json(&path, &bundle)?;
                    return Ok(true);
                }
            }
        }
        for path in self.old_bundle_paths(family)? {
            let mut bundle = read_compressed_bundle(&path)?;
            if let Some(entry) = pick_mut(&mut bundle.entries, id_field, id) {
                mutate(entry);
                write_compressed_bundle(&path, &bundle)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove a bundled record. Returns `false` when no bundle holds the id.
    pub fn remove_entry(&self, family: &str, id_field: &str, id: &str) -> Result<bool> {
        for path in self.live_bundle_paths(family)? {
            if let Some(mut bundle) = read_bundle(&path)? {
                let before = bundle.entries.len();
                bundle.entries.retain(|e| !matches_id(e, id_field, id));
                if bundle.entries.len() != before {
                    bundle.count = bundle.entries.len();
                    write_json(&path, &bundle)?;
                    return Ok(true);
                }
            }
        }
        for path in self.old_bundle_paths(family)? {
            let mut bundle = read_compressed_bundle(&path)?;
            let before = bundle.entries.len();
            bundle.entries.retain(|e| !matches_id(e, id_field, id));
            if bundle.entries.len() != before {
                bundle.count = bundle.entries.len();
                write_compressed_bundle(&path, &bundle)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every archived entry of a family, live and compressed tiers combined.
    pub fn list_entries(&self, family: &str) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for path in self.live_bundle_paths(family)? {
            if let Some(bundle) = read_bundle(&path)? {
                out.extend(bundle.entries);
            }
        }
        for path in self.old_bundle_paths(family)? {
            out.extend(read_compressed_bundle(&path)?.entries);
        }
        Ok(out)
    }

    /// Live (uncompressed) bundle files of a family, with their metadata.
    pub fn live_bundles(&self, family: &str) -> Result<Vec<(PathBuf, ArchiveBundle)>> {
        let mut out = Vec::new();
        for path in self.live_bundle_paths(family)? {
            if let Some(bundle) = read_bundle(&path)? {
                out.push((path, bundle));
            }
        }
        Ok(out)
    }

    /// Merge live bundles into one compressed `<family>-<month>.json.gz` under
    /// the old tier, then delete the sources. Entries already present in the
    /// compressed target are kept.
    pub fn compress_into_month(
        &self,
        family: &str,
        month: &str,
        sources: &[PathBuf],
    ) -> Result<PathBuf> {
        let target = self.old_dir.join(format!("{}-{}.json.gz", family, month));
        let mut merged = if target.exists() {
            read_compressed_bundle(&target)?
        } else {
            ArchiveBundle {
                archived_at: Utc::now(),
                count: 0,
                entries: Vec::new(),
            }
        };
        for path in sources {
            if let Some(bundle) = read_bundle(path)? {
                merged.entries.extend(bundle.entries);
            }
        }
        merged.count = merged.entries.len();
        merged.archived_at = Utc::now();
        write_compressed_bundle(&target, &merged)?;
        for path in sources {
            fs::remove_file(path).with_context(|| format!("remove merged bundle {:?}", path))?;
        }
        Ok(target)
    }

    pub fn live_bundle_count(&self) -> usize {
        list_json_files(&self.dir).map(|v| v.len()).unwrap_or(0)
    }

    // ---- internals ---------------------------------------------------------

    fn bundle_path(&self, family: &str, group: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", family, group))
    }

    fn live_bundle_paths(&self, family: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}-", family);
        Ok(list_json_files(&self.dir)?
            .into_iter()
            .filter(|p| file_name_starts_with(p, &prefix))
            .collect())
    }

    fn old_bundle_paths(&self, family: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}-", family);
        let mut out = Vec::new();
        if !self.old_dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.old_dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_file() && name.starts_with(&prefix) && name.ends_with(".json.gz") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

fn file_name_starts_with(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(prefix))
        .unwrap_or(false)
}

fn matches_id(entry: &Value, id_field: &str, id: &str) -> bool {
    entry.get(id_field).and_then(|v| v.as_str()) == Some(id)
}

fn pick<'a>(entries: &'a [Value], id_field: &str, id: &str) -> Option<&'a Value> {
    entries.iter().find(|e| matches_id(e, id_field, id))
}

fn pick_mut<'a>(entries: &'a mut [Value], id_field: &str, id: &str) -> Option<&'a mut Value> {
    entries.iter_mut().find(|e| matches_id(e, id_field, id))
}

fn read_bundle(path: &Path) -> Result<Option<ArchiveBundle>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read bundle {:?}", path))?;
    let bundle = serde_json::from_slice(&bytes).with_context(|| format!("parse bundle {:?}", path))?;
    Ok(Some(bundle))
}

fn read_compressed_bundle(path: &Path) -> Result<ArchiveBundle> {
    let file = fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut decoder = GzDecoder::new(file);
    let mut buf = Vec::new();
    decoder
        .read_to_end(&mut buf)
        .with_context(|| format!("decompress {:?}", path))?;
    serde_json::from_slice(&buf).with_context(|| format!("parse compressed bundle {:?}", path))
}

/// Compress to a temp sibling then rename, same crash discipline as the
/// uncompressed tier.
fn write_compressed_bundle(path: &Path, bundle: &ArchiveBundle) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serde_json::to_vec(bundle)?)?;
    let bytes = encoder.finish()?;
    write_atomic(path, &bytes)
}
