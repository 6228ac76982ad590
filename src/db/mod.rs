use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use tokio::sync::oneshot;

mod connection;
pub mod helpers;
mod migrations;
pub mod models;
pub mod recovery;
pub mod repositories;
mod store;

pub use connection::StoreConnection;
pub use models::{
    Category, Enrichment, EnrichmentAction, Metadata, MetadataValue, Priority, Record,
    RecordFilter, RecordStatus, ResearchResult,
};
pub use recovery::RepairOutcome;
pub use store::RecordStore;

type DbTask = Box<dyn FnOnce(&mut StoreConnection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the single worker thread that owns the backing file.
///
/// Every task runs on that thread, one at a time, with exclusive access to the
/// [`StoreConnection`]. Work a task does inline (a save that triggers a repair
/// that triggers a rebuild) never goes back through the channel.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    /// Spawns the worker. The file itself is opened lazily by the first task so that
    /// a corrupt file can be recovered instead of failing here.
    pub fn spawn(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("snapnote-db".into())
            .spawn(move || {
                let mut store = StoreConnection::new(path_for_thread);

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut store),
                        DbCommand::Shutdown => break,
                    }
                }

                store.close();
                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        info!("Database worker started for {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut StoreConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |store| {
            // A panicking task fails its own caller; the worker keeps serving.
            let result = panic::catch_unwind(AssertUnwindSafe(move || task(store)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!("DB task panicked: {message}");
                    Err(anyhow!("database task panicked: {message}"))
                });
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn connection_is_opened_lazily_and_kept() {
        let dir = TempDir::new().unwrap();
        let db = Database::spawn(dir.path().join("lazy.sqlite3")).unwrap();

        assert!(!db.execute(|store| Ok(store.is_open())).await.unwrap());
        db.execute(|store| store.ensure_open().map(|_| ()))
            .await
            .unwrap();
        assert!(db.execute(|store| Ok(store.is_open())).await.unwrap());
        assert!(db.path().exists());
    }

    #[tokio::test]
    async fn task_errors_reach_the_caller() {
        let dir = TempDir::new().unwrap();
        let db = Database::spawn(dir.path().join("err.sqlite3")).unwrap();
        let result: Result<()> = db.execute(|_| Err(anyhow!("boom"))).await;
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn panicking_task_leaves_the_worker_running() {
        let dir = TempDir::new().unwrap();
        let db = Database::spawn(dir.path().join("panic.sqlite3")).unwrap();

        let result: Result<()> = db.execute(|_| panic!("bad closure")).await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("panicked"), "{err}");
        assert!(err.contains("bad closure"), "{err}");

        db.execute(|store| store.ensure_open().map(|_| ()))
            .await
            .unwrap();
    }
}
