use std::{
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::{runtime::Handle, time};
use tokio_util::task::TaskTracker;

use crate::{
    classify::ClassificationEngine,
    db::{Record, RecordStore},
    events::{CaptureEvent, EventBus},
    settings::CaptureSettings,
    triggers::TriggerTable,
};

use super::{
    idle_timer::{IdleTimer, TickControl},
    state::{CaptureStateMachine, CaptureStatus, FinishedCapture, KeyInput, Transition},
};

// Keystroke-rate logging; flip on for a trace.
const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_info};

/// Output side-channel that types synthetic deletes into the focused app.
pub trait KeystrokeSink: Send + Sync {
    fn send_delete(&self) -> Result<()>;
}

struct ClearSettings {
    enabled: bool,
    delay: Duration,
}

struct ControllerInner {
    machine: Mutex<CaptureStateMachine>,
    timer: Mutex<IdleTimer>,
    classifier: RwLock<ClassificationEngine>,
    clear: RwLock<ClearSettings>,
    store: RecordStore,
    events: EventBus,
    sink: Option<Arc<dyn KeystrokeSink>>,
    runtime: Handle,
    tasks: TaskTracker,
}

/// Drives the capture state machine from the input callback.
///
/// `handle_input` only takes short in-memory locks. Persistence, event delivery
/// and synthetic deletes run as tracked tasks on the runtime.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<ControllerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CaptureController {
    pub fn new(
        settings: &CaptureSettings,
        store: RecordStore,
        events: EventBus,
        sink: Option<Arc<dyn KeystrokeSink>>,
        runtime: Handle,
    ) -> Self {
        let triggers = TriggerTable::new(settings.triggers.clone());
        Self {
            inner: Arc::new(ControllerInner {
                machine: Mutex::new(CaptureStateMachine::new(
                    triggers.clone(),
                    settings.idle_timeout(),
                )),
                timer: Mutex::new(IdleTimer::new(settings.poll_interval(), runtime.clone())),
                classifier: RwLock::new(ClassificationEngine::new(triggers)),
                clear: RwLock::new(ClearSettings {
                    enabled: settings.clear_typed_text,
                    delay: settings.clear_keystroke_delay(),
                }),
                store,
                events,
                sink,
                runtime,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Re-reads triggers, timeout and clearing options. An in-flight capture keeps its trigger.
    pub fn apply_settings(&self, settings: &CaptureSettings) {
        let triggers = TriggerTable::new(settings.triggers.clone());
        {
            let mut machine = lock(&self.inner.machine);
            machine.set_triggers(triggers.clone());
            machine.set_idle_timeout(settings.idle_timeout());
        }
        lock(&self.inner.timer).set_poll_interval(settings.poll_interval());
        if let Ok(mut classifier) = self.inner.classifier.write() {
            *classifier = ClassificationEngine::new(triggers);
        }
        if let Ok(mut clear) = self.inner.clear.write() {
            *clear = ClearSettings {
                enabled: settings.clear_typed_text,
                delay: settings.clear_keystroke_delay(),
            };
        }
        log::info!(
            "Capture settings applied: {} triggers, idle timeout {}ms",
            settings.triggers.iter().filter(|t| t.enabled).count(),
            settings.idle_timeout_ms
        );
    }

    pub fn status(&self) -> CaptureStatus {
        lock(&self.inner.machine).status()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Entry point for the platform input callback.
    pub fn handle_input(&self, input: KeyInput) {
        let transition = lock(&self.inner.machine).handle(input, Instant::now());
        if let Some(transition) = transition {
            self.dispatch(transition);
        }
    }

    pub fn handle_decoded(&self, decoded: &str) {
        for input in KeyInput::from_decoded(decoded) {
            self.handle_input(input);
        }
    }

    /// Waits for every persistence and clearing task spawned so far.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Stops the idle probe and drains pending work. Any open session is dropped.
    pub async fn shutdown(&self) {
        lock(&self.inner.timer).stop();
        lock(&self.inner.machine).reset();
        self.drain().await;
    }

    fn dispatch(&self, transition: Transition) {
        match transition {
            Transition::Started(trigger) => {
                log_debug!("capture started by {}", trigger.pattern);
                self.start_idle_timer();
                self.inner.events.emit(CaptureEvent::TriggerDetected {
                    pattern: trigger.pattern,
                });
            }
            Transition::Finished(finished) => {
                lock(&self.inner.timer).stop();
                self.clear_typed_text(finished.typed_chars);
                if finished.trigger.is_timer_trigger {
                    log_info!("timer capture finished ({} chars)", finished.text.len());
                    self.inner.events.emit(CaptureEvent::TimerCaptureFinished {
                        event_name: finished.text,
                        trigger_used: finished.trigger.pattern,
                    });
                } else {
                    self.persist(finished);
                }
            }
            Transition::Discarded => {
                lock(&self.inner.timer).stop();
                log_debug!("empty capture discarded");
            }
        }
    }

    fn start_idle_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        lock(&self.inner.timer).start(move || {
            let Some(inner) = weak.upgrade() else {
                return TickControl::Stop;
            };
            CaptureController { inner }.on_idle_tick()
        });
    }

    fn on_idle_tick(&self) -> TickControl {
        let transition = {
            let mut machine = lock(&self.inner.machine);
            if machine.status() == CaptureStatus::Idle {
                return TickControl::Stop;
            }
            machine.check_idle(Instant::now())
        };

        match transition {
            Some(transition) => {
                self.dispatch(transition);
                TickControl::Stop
            }
            None => TickControl::Continue,
        }
    }

    fn persist(&self, finished: FinishedCapture) {
        let (content, category) = match self.inner.classifier.read() {
            Ok(classifier) => classifier.classify(&finished.text, &finished.trigger.pattern),
            Err(poisoned) => poisoned
                .into_inner()
                .classify(&finished.text, &finished.trigger.pattern),
        };
        if content.is_empty() {
            log_debug!("capture was only an inline prefix; discarded");
            return;
        }

        let trigger_used = finished.trigger.pattern;
        let record = Record::from_capture(content.clone(), category, &trigger_used);
        let store = self.inner.store.clone();
        let events = self.inner.events.clone();

        self.inner.tasks.spawn_on(
            async move {
                let id = record.id.clone();
                match store.save(record.clone()).await {
                    Ok(()) => {
                        log::info!("Saved {} capture {id}", category.as_str());
                        events.emit(CaptureEvent::EntryCreated { record });
                    }
                    Err(err) => log::error!("Failed to save capture {id}: {err:#}"),
                }
                events.emit(CaptureEvent::CaptureFinished {
                    content,
                    trigger_used,
                    category,
                });
            },
            &self.inner.runtime,
        );
    }

    fn clear_typed_text(&self, count: usize) {
        let (enabled, delay) = match self.inner.clear.read() {
            Ok(clear) => (clear.enabled, clear.delay),
            Err(poisoned) => {
                let clear = poisoned.into_inner();
                (clear.enabled, clear.delay)
            }
        };
        let Some(sink) = self.inner.sink.clone().filter(|_| enabled) else {
            return;
        };

        self.inner.tasks.spawn_on(
            async move {
                for sent in 0..count {
                    if let Err(err) = sink.send_delete() {
                        log::warn!("Stopped clearing typed text after {sent}/{count} deletes: {err:#}");
                        return;
                    }
                    time::sleep(delay).await;
                }
            },
            &self.inner.runtime,
        );
    }
}
