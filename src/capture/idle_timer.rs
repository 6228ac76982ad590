use std::time::Duration;

use tokio::{
    runtime::Handle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// A restartable periodic probe. Expiry is decided by the callback, so the
/// effective granularity is one poll interval.
pub struct IdleTimer {
    poll_interval: Duration,
    runtime: Handle,
    cancel: Option<CancellationToken>,
}

impl IdleTimer {
    pub fn new(poll_interval: Duration, runtime: Handle) -> Self {
        Self {
            poll_interval,
            runtime,
            cancel: None,
        }
    }

    pub fn set_poll_interval(&mut self, poll_interval: Duration) {
        self.poll_interval = poll_interval;
    }

    /// Starts probing, replacing any probe already running.
    pub fn start<F>(&mut self, mut on_tick: F)
    where
        F: FnMut() -> TickControl + Send + 'static,
    {
        self.stop();

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let period = self.poll_interval;

        self.runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if on_tick() == TickControl::Stop {
                            break;
                        }
                    }
                }
            }
            loop_token.cancel();
        });

        self.cancel = Some(token);
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |token| !token.is_cancelled())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
