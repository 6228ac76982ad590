use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use log::{error, warn};
use rusqlite::Connection;

use super::migrations::run_migrations;

const CLOSE_ATTEMPTS: u32 = 3;
const CLOSE_BACKOFF: Duration = Duration::from_millis(50);

/// The backing file handle, owned by the worker thread alone.
///
/// The connection is optional so that recovery can close it, move the file aside,
/// and reopen without the owner noticing.
pub struct StoreConnection {
    path: PathBuf,
    conn: Option<Connection>,
    last_health_check: Option<Instant>,
}

impl StoreConnection {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: None,
            last_health_check: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Opens the file if needed and brings the schema up to date.
    pub fn ensure_open(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            self.conn = Some(open_connection(&self.path)?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("database connection unavailable"))
    }

    pub fn health_check_is_stale(&self, max_age: Duration) -> bool {
        self.last_health_check
            .map_or(true, |checked| checked.elapsed() >= max_age)
    }

    pub fn mark_health_checked(&mut self) {
        self.last_health_check = Some(Instant::now());
    }

    pub fn forget_health_check(&mut self) {
        self.last_health_check = None;
    }

    /// Closes the connection, retrying a stalled close before forcing it.
    pub fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        for attempt in 1..=CLOSE_ATTEMPTS {
            match conn.close() {
                Ok(()) => return,
                Err((returned, err)) => {
                    warn!("close attempt {attempt}/{CLOSE_ATTEMPTS} failed: {err}");
                    conn = returned;
                    thread::sleep(CLOSE_BACKOFF * attempt);
                }
            }
        }

        force_close(conn);
    }
}

impl Drop for StoreConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database at {}", path.display()))?;

    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("Failed to enable WAL mode: {err}");
    }
    conn.busy_timeout(Duration::from_millis(250))
        .context("failed to set busy timeout")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// Best effort: flush the WAL and drop caches, then let the handle go regardless.
fn force_close(conn: Connection) {
    warn!("forcing database close after graceful close stalled");
    if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        warn!("checkpoint during forced close failed: {err}");
    }
    if let Err(err) = conn.execute_batch("PRAGMA shrink_memory;") {
        warn!("cache release during forced close failed: {err}");
    }
    drop(conn);
}
