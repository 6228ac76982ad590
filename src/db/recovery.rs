//! Corruption detection and the quarantine-and-recreate rebuild.
//!
//! Everything here runs on the database worker thread against the
//! [`StoreConnection`] it owns. The [`RepairGate`] is the only state shared with
//! other threads: it keeps two repair attempts from overlapping, and a caller
//! that finds it taken is told to skip instead of waiting.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{error, info, warn};

use super::{
    connection::StoreConnection,
    helpers::has_suspicious_control_chars,
    repositories::records::{count_records, sample_text_fields},
};

/// Verdict of a repair-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// All probes passed.
    Healthy,
    /// Probes failed and the store was rebuilt empty.
    Rebuilt,
    /// Another repair is in flight; the store is not known to be healthy.
    Skipped,
    /// Probes failed and the rebuild failed too.
    Failed,
}

impl RepairOutcome {
    /// True when the backing file is usable right now.
    pub fn is_usable(&self) -> bool {
        matches!(self, RepairOutcome::Healthy | RepairOutcome::Rebuilt)
    }
}

#[derive(Default)]
pub struct RepairGate {
    in_progress: Mutex<bool>,
}

pub struct RepairGuard<'a> {
    gate: &'a RepairGate,
}

impl RepairGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        match self.in_progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claims the gate, or returns `None` if a repair is already running.
    pub fn try_begin(&self) -> Option<RepairGuard<'_>> {
        let mut flag = self.flag();
        if *flag {
            return None;
        }
        *flag = true;
        Some(RepairGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        *self.flag()
    }
}

impl Drop for RepairGuard<'_> {
    fn drop(&mut self) {
        *self.gate.flag() = false;
    }
}

/// Runs the three probes without changing anything.
pub fn probe(store: &mut StoreConnection) -> Result<()> {
    let conn = store.ensure_open()?;

    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("integrity probe failed")?;
    if verdict != "ok" {
        bail!("integrity probe reported: {verdict}");
    }

    count_records(conn).context("liveness probe failed")?;

    if let Some(fields) = sample_text_fields(conn)? {
        if fields.iter().any(|field| has_suspicious_control_chars(field)) {
            bail!("sampled record contains control characters");
        }
    }

    Ok(())
}

/// Probes the store and rebuilds it if any probe fails.
pub fn repair_check(store: &mut StoreConnection, gate: &RepairGate) -> RepairOutcome {
    let Some(_guard) = gate.try_begin() else {
        warn!("repair-check already in progress; skipping");
        return RepairOutcome::Skipped;
    };

    let outcome = match probe(store) {
        Ok(()) => RepairOutcome::Healthy,
        Err(err) => {
            warn!("store failed health probe: {err:#}");
            match rebuild(store) {
                Ok(_) => RepairOutcome::Rebuilt,
                Err(err) => {
                    error!("store rebuild failed: {err:#}");
                    RepairOutcome::Failed
                }
            }
        }
    };

    if outcome.is_usable() {
        store.mark_health_checked();
    }
    outcome
}

/// Rebuild under the gate, for callers that did not come through `repair_check`.
pub fn guarded_rebuild(store: &mut StoreConnection, gate: &RepairGate) -> RepairOutcome {
    let Some(_guard) = gate.try_begin() else {
        warn!("rebuild requested while another repair is in progress; skipping");
        return RepairOutcome::Skipped;
    };

    match rebuild(store) {
        Ok(_) => {
            store.mark_health_checked();
            RepairOutcome::Rebuilt
        }
        Err(err) => {
            error!("store rebuild failed: {err:#}");
            RepairOutcome::Failed
        }
    }
}

/// Moves the current file aside and recreates an empty store in its place.
///
/// Returns the backup path when a file was quarantined. Does not touch any cache.
pub fn rebuild(store: &mut StoreConnection) -> Result<Option<PathBuf>> {
    info!("rebuilding store at {}", store.path().display());
    store.close();
    store.forget_health_check();

    let path = store.path().to_path_buf();
    let backup = quarantine(&path)?;
    move_sidecars(&path, backup.as_deref());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to recreate {}", parent.display()))?;
    }

    let conn = store.ensure_open().context("failed to reopen rebuilt store")?;
    count_records(conn).context("rebuilt store failed verification")?;

    match &backup {
        Some(backup) => warn!(
            "store rebuilt; previous data kept at {}",
            backup.display()
        ),
        None => info!("store rebuilt; no previous file to keep"),
    }
    Ok(backup)
}

pub fn backup_path(path: &Path, unix_timestamp: i64) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".backup.{unix_timestamp}"));
    PathBuf::from(name)
}

fn quarantine(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let backup = backup_path(path, Utc::now().timestamp());
    if backup.exists() {
        fs::remove_file(&backup)
            .with_context(|| format!("failed to remove stale backup {}", backup.display()))?;
    }

    match fs::rename(path, &backup) {
        Ok(()) => Ok(Some(backup)),
        Err(rename_err) => {
            warn!(
                "could not move {} aside ({rename_err}); deleting it instead",
                path.display()
            );
            fs::remove_file(path)
                .map_err(|err| anyhow!("failed to delete corrupt store: {err}"))?;
            Ok(None)
        }
    }
}

const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// WAL, shared-memory and journal files belong to the quarantined file, so they
/// follow it to the backup name. Without a backup they are deleted.
fn move_sidecars(path: &Path, backup: Option<&Path>) {
    for suffix in SIDECAR_SUFFIXES {
        let current = sidecar(path, suffix);
        if !current.exists() {
            continue;
        }

        if let Some(backup) = backup {
            let target = sidecar(backup, suffix);
            if target.exists() {
                if let Err(err) = fs::remove_file(&target) {
                    warn!("failed to remove stale {}: {err}", target.display());
                }
            }
            match fs::rename(&current, &target) {
                Ok(()) => continue,
                Err(err) => warn!(
                    "could not move {} next to the backup ({err}); deleting it",
                    current.display()
                ),
            }
        }

        if let Err(err) = fs::remove_file(&current) {
            warn!("failed to remove {}: {err}", current.display());
        }
    }
}
