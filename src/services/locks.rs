// src/services/locks.rs
//! Advisory, named, TTL-bounded mutual exclusion over filesystem-visible
//! operations.
//!
//! One JSON record per operation name under `<root>/locks/`. Acquisition is
//! an atomic `create_new`, so two racing acquirers cannot both win. The TTL
//! lease is the primary staleness mechanism; a `sysinfo` pid probe reclaims
//! locks from dead same-host owners early, but correctness never depends on
//! it; foreign-host records simply age out.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::utils::fsio::sanitize_id;

/// Operation names that mutate data; `any_write_in_progress` scans these.
pub const WRITE_OPERATIONS: &[&str] = &[
    "proposal_write",
    "decision_write",
    "apply",
    "rollback",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub owner_pid: u32,
    pub host: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    owner_pid: u32,
    host: String,
}

impl LockManager {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            owner_pid: std::process::id(),
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Variant used in tests to simulate a second process on this host.
    pub fn open_as(dir: impl Into<PathBuf>, owner_pid: u32) -> Result<Self> {
        let mut mgr = Self::open(dir)?;
        mgr.owner_pid = owner_pid;
        Ok(mgr)
    }

    /// Try to take the named lock for `ttl_secs`.
    ///
    /// Garbage-collects stale records first, then creates the lock record
    /// atomically. `Ok(false)` means a live, unexpired record exists;
    /// callers treat that as "try again later", never as an error.
    pub fn acquire(&self, operation: &str, ttl_secs: u64) -> Result<bool> {
        self.gc_stale()?;

        let now = Utc::now();
        let record = LockRecord {
            operation: operation.to_string(),
            started_at: now,
            owner_pid: self.owner_pid,
            host: self.host.clone(),
            expires_at: now + Duration::seconds(ttl_secs as i64),
        };
        let path = self.lock_path(operation);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let bytes = serde_json::to_vec_pretty(&record)?;
                f.write_all(&bytes)?;
                f.sync_all()?;
                tracing::debug!(operation, ttl_secs, "lock acquired");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("create lock {:?}", path)),
        }
    }

    /// Release the named lock. Removing an absent record is not an error.
    pub fn release(&self, operation: &str) -> Result<()> {
        let path = self.lock_path(operation);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove lock {:?}", path)),
        }
    }

    /// Whether a live, unexpired record currently holds the named lock.
    pub fn is_held(&self, operation: &str) -> bool {
        match self.read_record(operation) {
            Some(rec) => !self.is_stale(&rec),
            None => false,
        }
    }

    /// Whether any write-class operation is currently in flight.
    /// The compactor calls this instead of taking locks of its own.
    pub fn any_write_in_progress(&self) -> bool {
        WRITE_OPERATIONS.iter().any(|op| self.is_held(op))
    }

    /// Current record for an operation, stale or not. Mostly for status views.
    pub fn read_record(&self, operation: &str) -> Option<LockRecord> {
        let bytes = fs::read(self.lock_path(operation)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    // ---- internals ---------------------------------------------------------

    fn lock_path(&self, operation: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(operation)))
    }

    /// Remove every lock record whose lease has lapsed or whose same-host
    /// owner is no longer running.
    fn gc_stale(&self) -> Result<()> {
        if !self.dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let stale = match fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<LockRecord>(&b).ok())
            {
                Some(rec) => self.is_stale(&rec),
                // Unparseable lock records are junk; reclaim them.
                None => true,
            };
            if stale {
                tracing::debug!(path = %path.display(), "reclaiming stale lock");
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    fn is_stale(&self, rec: &LockRecord) -> bool {
        if rec.expires_at <= Utc::now() {
            return true;
        }
        // Liveness probe only applies to same-host owners; records from other
        // hosts wait out their lease.
        rec.host == self.host && !process_alive(rec.owner_pid)
    }
}

fn process_alive(pid: u32) -> bool {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    sys.process(Pid::from_u32(pid)).is_some()
}

/// RAII guard: releases the lock when dropped. Used around apply/rollback so
/// early returns cannot leak a held lock until its TTL lapses.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    operation: String,
}

impl<'a> LockGuard<'a> {
    /// Acquire `operation`, returning `None` on contention.
    pub fn try_acquire(
        manager: &'a LockManager,
        operation: &str,
        ttl_secs: u64,
    ) -> Result<Option<Self>> {
        if manager.acquire(operation, ttl_secs)? {
            Ok(Some(Self {
                manager,
                operation: operation.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.operation) {
            tracing::warn!(operation = %self.operation, "lock release failed: {e}");
        }
    }
}
