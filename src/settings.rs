use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{db::Category, triggers::TriggerDefinition};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureSettings {
    pub triggers: Vec<TriggerDefinition>,
    pub idle_timeout_ms: u64,
    /// How often the idle timer probes for expiry.
    pub poll_interval_ms: u64,
    /// Send deletes back to the focused app to erase the typed trigger and text.
    pub clear_typed_text: bool,
    pub clear_keystroke_delay_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            triggers: vec![
                TriggerDefinition::new("///", Category::Task),
                TriggerDefinition::new(",,,", Category::Note),
                TriggerDefinition::timer(";;;", Category::Task),
            ],
            idle_timeout_ms: 3_000,
            poll_interval_ms: 500,
            clear_typed_text: false,
            clear_keystroke_delay_ms: 8,
        }
    }
}

impl CaptureSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn clear_keystroke_delay(&self) -> Duration {
        Duration::from_millis(self.clear_keystroke_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// A repair-check older than this is re-run before the next open or save.
    pub health_check_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 300,
        }
    }
}

impl StoreSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    capture: CaptureSettings,
    store: StoreSettings,
}

/// Rejects trigger lists the capture engine cannot work with.
pub fn validate_triggers(triggers: &[TriggerDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for trigger in triggers {
        if trigger.pattern.is_empty() {
            bail!("trigger {} has an empty pattern", trigger.id);
        }
        if trigger.pattern.chars().any(char::is_whitespace) {
            bail!("trigger pattern {:?} contains whitespace", trigger.pattern);
        }
        if trigger.enabled && !seen.insert(trigger.pattern.as_str()) {
            bail!("trigger pattern {:?} is enabled more than once", trigger.pattern);
        }
    }
    Ok(())
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<UserSettings>(&contents) {
                Ok(data) if validate_triggers(&data.capture.triggers).is_ok() => data,
                Ok(_) => {
                    warn!("Stored trigger list is invalid; using defaults");
                    UserSettings::default()
                }
                Err(err) => {
                    warn!("Unreadable settings at {}: {err}; using defaults", path.display());
                    UserSettings::default()
                }
            }
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capture(&self) -> CaptureSettings {
        self.read().capture.clone()
    }

    pub fn store(&self) -> StoreSettings {
        self.read().store.clone()
    }

    pub fn update_triggers(&self, triggers: Vec<TriggerDefinition>) -> Result<()> {
        validate_triggers(&triggers)?;
        let mut guard = self.write();
        guard.capture.triggers = triggers;
        self.persist(&guard)
    }

    pub fn update_capture(&self, settings: CaptureSettings) -> Result<()> {
        validate_triggers(&settings.triggers)?;
        let mut guard = self.write();
        guard.capture = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
