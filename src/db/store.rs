//! The record store: one worker-owned SQLite file plus a published snapshot cache.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use super::{
    connection::StoreConnection,
    helpers::{is_corruption, is_transient},
    models::{Enrichment, Record, RecordFilter, RecordStatus},
    recovery::{guarded_rebuild, probe, repair_check, RepairGate, RepairOutcome},
    repositories::records::{
        delete_record, filter_records, load_records, records_without_enrichment, search_records,
        upsert_record, LoadOutcome,
    },
    Database,
};

const TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(25);

type Snapshot = Arc<Vec<Record>>;

#[derive(Clone)]
struct Cache {
    inner: Arc<RwLock<Snapshot>>,
}

impl Cache {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    fn snapshot(&self) -> Snapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, records: Vec<Record>) {
        let snapshot = Arc::new(records);
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Worker-side state every task needs.
#[derive(Clone)]
struct Shared {
    cache: Cache,
    gate: Arc<RepairGate>,
    health_max_age: Duration,
}

#[derive(Clone)]
pub struct RecordStore {
    db: Database,
    shared: Shared,
}

impl RecordStore {
    /// Opens (or creates) the store and loads every record into the cache.
    ///
    /// Corruption found on the way in is quarantined and the store starts empty.
    pub async fn open(path: PathBuf, health_max_age: Duration) -> Result<Self> {
        let db = Database::spawn(path)?;
        let shared = Shared {
            cache: Cache::new(),
            gate: RepairGate::new(),
            health_max_age,
        };

        let task_shared = shared.clone();
        db.execute(move |store| {
            ensure_usable(store, &task_shared.gate)?;
            if repair_check(store, &task_shared.gate) == RepairOutcome::Failed {
                bail!("store is corrupt and could not be rebuilt");
            }
            reload_cache(store, &task_shared)
        })
        .await
        .context("failed to open record store")?;

        let store = Self { db, shared };
        info!(
            "Record store ready at {} with {} records",
            store.db.path().display(),
            store.records().len()
        );
        Ok(store)
    }

    /// Latest published snapshot, newest first. Never touches the worker.
    pub fn records(&self) -> Arc<Vec<Record>> {
        self.shared.cache.snapshot()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records().iter().find(|record| record.id == id).cloned()
    }

    /// Insert-or-replace by id.
    pub async fn save(&self, record: Record) -> Result<()> {
        let shared = self.shared.clone();
        self.db
            .execute(move |store| save_inline(store, &shared, &record))
            .await
    }

    /// Removes a record; absent ids are a no-op. Returns whether a row went away.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let shared = self.shared.clone();
        self.db
            .execute(move |store| {
                ensure_usable(store, &shared.gate)?;
                let removed = with_transient_retry(|| delete_record(store.ensure_open()?, &id))?;
                reload_cache(store, &shared)?;
                Ok(removed)
            })
            .await
    }

    /// Case-insensitive substring match over content and tags, newest first.
    pub async fn search(&self, needle: &str) -> Vec<Record> {
        let needle = needle.to_string();
        self.read_or_empty("search", move |store| {
            search_records(store.ensure_open()?, &needle)
        })
        .await
    }

    pub async fn filter(&self, filter: RecordFilter) -> Vec<Record> {
        self.read_or_empty("filter", move |store| {
            filter_records(store.ensure_open()?, &filter)
        })
        .await
    }

    /// Records the enrichment pipeline has not annotated yet, newest first.
    pub async fn entries_needing_processing(&self) -> Vec<Record> {
        self.read_or_empty("pending enrichment", |store| {
            records_without_enrichment(store.ensure_open()?)
        })
        .await
    }

    /// Read-modify-write of one cached record on the worker.
    ///
    /// `id` and `created_at` are restored after the mutator runs. Returns `None`
    /// when no record has that id.
    pub async fn update<F>(&self, id: &str, mutator: F) -> Result<Option<Record>>
    where
        F: FnOnce(Record) -> Record + Send + 'static,
    {
        let id = id.to_string();
        let shared = self.shared.clone();
        self.db
            .execute(move |store| {
                let Some(current) = shared
                    .cache
                    .snapshot()
                    .iter()
                    .find(|record| record.id == id)
                    .cloned()
                else {
                    return Ok(None);
                };

                let (original_id, original_created_at) = (current.id.clone(), current.created_at);
                let mut updated = mutator(current);
                updated.id = original_id;
                updated.created_at = original_created_at;

                save_inline(store, &shared, &updated)?;
                Ok(Some(updated))
            })
            .await
    }

    /// The enrichment collaborator's only write path.
    pub async fn update_enrichment<F>(&self, id: &str, mutator: F) -> Result<Option<Record>>
    where
        F: FnOnce(Option<Enrichment>) -> Enrichment + Send + 'static,
    {
        self.update(id, move |mut record| {
            record.enrichment = Some(mutator(record.enrichment.take()));
            record
        })
        .await
    }

    pub async fn update_status(&self, id: &str, status: RecordStatus) -> Result<Option<Record>> {
        self.update(id, move |mut record| {
            record.status = status;
            record
        })
        .await
    }

    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<Option<Record>> {
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            bail!("tag must not be empty");
        }
        self.update(id, move |mut record| {
            record.tags.insert(tag);
            record
        })
        .await
    }

    /// Probes integrity without changing anything.
    pub async fn health_check(&self) -> bool {
        let gate = self.shared.gate.clone();
        let result = self
            .db
            .execute(move |store| {
                if gate.is_busy() {
                    return Ok(false);
                }
                Ok(match probe(store) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("health check failed: {err:#}");
                        false
                    }
                })
            })
            .await;

        result.unwrap_or_else(|err| {
            error!("health check could not run: {err:#}");
            false
        })
    }

    /// Quarantines the current file and starts over empty.
    pub async fn force_rebuild(&self) -> bool {
        let shared = self.shared.clone();
        let result = self
            .db
            .execute(move |store| {
                let outcome = guarded_rebuild(store, &shared.gate);
                if outcome.is_usable() {
                    reload_cache(store, &shared)?;
                }
                Ok(outcome.is_usable())
            })
            .await;

        result.unwrap_or_else(|err| {
            error!("forced rebuild failed: {err:#}");
            false
        })
    }

    async fn read_or_empty<F>(&self, what: &'static str, task: F) -> Vec<Record>
    where
        F: FnOnce(&mut StoreConnection) -> Result<Vec<Record>> + Send + 'static,
    {
        match self.db.execute(task).await {
            Ok(records) => records,
            Err(err) => {
                error!("{what} failed: {err:#}");
                Vec::new()
            }
        }
    }
}

/// Opens the file, rebuilding first if the engine says it is not a database.
fn ensure_usable(store: &mut StoreConnection, gate: &RepairGate) -> Result<()> {
    let err = match store.ensure_open() {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };
    if !is_corruption(&err) {
        return Err(err);
    }

    warn!("store failed to open: {err:#}");
    match guarded_rebuild(store, gate) {
        RepairOutcome::Rebuilt => Ok(()),
        _ => Err(err.context("store is corrupt and could not be rebuilt")),
    }
}

fn save_inline(store: &mut StoreConnection, shared: &Shared, record: &Record) -> Result<()> {
    ensure_usable(store, &shared.gate)?;

    if store.health_check_is_stale(shared.health_max_age) {
        match repair_check(store, &shared.gate) {
            RepairOutcome::Failed => {
                error!("dropping save of record {}: store unusable", record.id);
                bail!("store unusable; record {} not saved", record.id);
            }
            RepairOutcome::Rebuilt => warn!("store was rebuilt before saving {}", record.id),
            RepairOutcome::Healthy | RepairOutcome::Skipped => {}
        }
    }

    let write = |store: &mut StoreConnection| {
        with_transient_retry(|| upsert_record(store.ensure_open()?, record))
    };

    if let Err(err) = write(store) {
        if !is_corruption(&err) {
            return Err(err);
        }
        warn!("corruption while saving {}: {err:#}", record.id);
        if guarded_rebuild(store, &shared.gate) != RepairOutcome::Rebuilt {
            error!("dropping save of record {}: rebuild failed", record.id);
            return Err(err);
        }
        write(store).with_context(|| format!("save of {} failed after rebuild", record.id))?;
    }

    reload_cache(store, shared)
}

/// Publishes the table as the new snapshot; a corrupt first row rebuilds to empty.
fn reload_cache(store: &mut StoreConnection, shared: &Shared) -> Result<()> {
    let outcome = with_transient_retry(|| load_records(store.ensure_open()?))?;
    match outcome {
        LoadOutcome::Loaded(records) => shared.cache.publish(records),
        LoadOutcome::Corrupt(err) => {
            warn!("first stored record is unreadable: {err:#}");
            match guarded_rebuild(store, &shared.gate) {
                RepairOutcome::Rebuilt => shared.cache.publish(Vec::new()),
                _ => bail!("store is corrupt and could not be rebuilt"),
            }
        }
    }
    Ok(())
}

fn with_transient_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if is_transient(&err) && attempt < TRANSIENT_ATTEMPTS => {
                warn!("transient store error (attempt {attempt}/{TRANSIENT_ATTEMPTS}): {err:#}");
                thread::sleep(TRANSIENT_BACKOFF * attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}
