pub mod capture;
pub mod classify;
pub mod db;
pub mod events;
pub mod keys;
pub mod settings;
pub mod triggers;
mod utils;

use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use capture::CaptureController;
use db::RecordStore;
use events::EventBus;
use keys::{EncryptionKey, EncryptionKeyProvider, KeyringStorage, SecretStorage};
use log::{info, warn};
use settings::{CaptureSettings, SettingsStore};
use tokio::{
    runtime::{self, Handle, Runtime},
    sync::broadcast::error::RecvError,
};
use triggers::TriggerDefinition;

const DATA_DIR_ENV: &str = "SNAPNOTE_DATA_DIR";
const DATABASE_FILE: &str = "snapnote.sqlite3";
const SETTINGS_FILE: &str = "settings.json";
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Everything the process shares, built once at startup.
pub struct App {
    pub settings: Arc<SettingsStore>,
    pub store: RecordStore,
    pub events: EventBus,
    pub capture: CaptureController,
    pub encryption_key: EncryptionKey,
}

impl App {
    pub async fn bootstrap(data_dir: &Path, secrets: Box<dyn SecretStorage>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let settings = Arc::new(SettingsStore::new(data_dir.join(SETTINGS_FILE))?);
        let encryption_key = EncryptionKeyProvider::new(secrets).load_or_create();
        info!("Encryption key ready ({:?})", encryption_key.source());

        let store = RecordStore::open(
            data_dir.join(DATABASE_FILE),
            settings.store().health_check_interval(),
        )
        .await?;
        info!("Record store open with {} records", store.records().len());

        let events = EventBus::default();
        let capture = CaptureController::new(
            &settings.capture(),
            store.clone(),
            events.clone(),
            None,
            Handle::current(),
        );

        Ok(Self {
            settings,
            store,
            events,
            capture,
            encryption_key,
        })
    }

    /// Validates and persists a new trigger list, then hands it to the running capture engine.
    pub fn update_triggers(&self, triggers: Vec<TriggerDefinition>) -> Result<()> {
        self.settings.update_triggers(triggers)?;
        self.capture.apply_settings(&self.settings.capture());
        Ok(())
    }

    pub fn update_capture_settings(&self, settings: CaptureSettings) -> Result<()> {
        self.settings.update_capture(settings)?;
        self.capture.apply_settings(&self.settings.capture());
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.capture.shutdown().await;
        info!("Snapnote stopped with {} records", self.store.records().len());
    }
}

pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("snapnote"))
        .context("No local data directory on this platform; set SNAPNOTE_DATA_DIR")
}

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("Snapnote starting up...");

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("snapnote-rt")
        .build()
        .context("Failed to build the async runtime")?;

    let result = runtime.block_on(async {
        let data_dir = data_dir()?;
        let app = App::bootstrap(&data_dir, Box::new(KeyringStorage::new())).await?;
        info!("Data directory: {}", data_dir.display());

        let mut subscription = app.events.subscribe();
        let logger = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => info!("event {json}"),
                        Err(err) => warn!("Unserializable event: {err}"),
                    },
                    Err(RecvError::Lagged(missed)) => warn!("Event logger missed {missed} events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let capture = app.capture.clone();
        let reader = tokio::task::spawn_blocking(move || feed_stdin(&capture));

        tokio::select! {
            result = reader => {
                result.context("stdin reader panicked")??;
                info!("Input closed");
            }
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }

        app.shutdown().await;
        logger.abort();
        Ok(())
    });

    shut_down(runtime);
    result
}

/// The stdin reader may still be parked in a blocking read; do not wait for it.
fn shut_down(runtime: Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

/// Replays stdin as keyboard input, one decoded character at a time.
fn feed_stdin(capture: &CaptureController) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut line = Vec::new();
    let mut key = [0u8; 4];

    loop {
        line.clear();
        let read = input
            .read_until(b'\n', &mut line)
            .context("Failed to read stdin")?;
        if read == 0 {
            return Ok(());
        }
        for c in String::from_utf8_lossy(&line).chars() {
            capture.handle_decoded(c.encode_utf8(&mut key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Category,
        keys::{KeySource, MemorySecretStorage},
    };
    use std::{sync::mpsc, time::Instant};
    use tempfile::TempDir;

    async fn app(dir: &TempDir) -> App {
        App::bootstrap(dir.path(), Box::new(MemorySecretStorage::default()))
            .await
            .unwrap()
    }

    fn type_keys(app: &App, text: &str) {
        for c in text.chars() {
            app.capture.handle_decoded(&c.to_string());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bootstrap_wires_every_part() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        assert_eq!(app.encryption_key.source(), KeySource::Generated);
        assert!(app.store.records().is_empty());
        assert!(dir.path().join(DATABASE_FILE).exists());

        type_keys(&app, "///water plants\n");
        app.shutdown().await;
        assert_eq!(app.store.records()[0].content, "water plants");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_triggers_reach_the_running_engine_and_disk() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        app.update_triggers(vec![TriggerDefinition::new("@@", Category::Task)])
            .unwrap();
        type_keys(&app, "///ignored\n@@ship it\n");
        app.capture.drain().await;

        let records = app.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "ship it");
        assert_eq!(records[0].category, Category::Task);

        let reloaded = SettingsStore::new(dir.path().join(SETTINGS_FILE)).unwrap();
        let patterns: Vec<String> = reloaded
            .capture()
            .triggers
            .into_iter()
            .map(|t| t.pattern)
            .collect();
        assert_eq!(patterns, vec!["@@".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_triggers_leave_the_engine_alone() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        assert!(app
            .update_triggers(vec![TriggerDefinition::new("a b", Category::Note)])
            .is_err());
        type_keys(&app, ",,,still works\n");
        app.capture.drain().await;
        assert_eq!(app.store.records()[0].content, "still works");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_settings_update_changes_the_idle_timeout() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        app.update_capture_settings(CaptureSettings {
            idle_timeout_ms: 100,
            poll_interval_ms: 20,
            ..CaptureSettings::default()
        })
        .unwrap();
        type_keys(&app, ",,,no newline");
        tokio::time::sleep(Duration::from_millis(400)).await;
        app.capture.drain().await;

        assert_eq!(app.store.records()[0].content, "no newline");
        assert_eq!(app.settings.capture().idle_timeout_ms, 100);
    }

    #[test]
    fn blocked_reader_does_not_hold_up_exit() {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        runtime.spawn_blocking(move || {
            let _ = release_rx.recv();
        });

        let started = Instant::now();
        shut_down(runtime);
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(release_tx);
    }
}
