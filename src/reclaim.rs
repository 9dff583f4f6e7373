//! Periodic reclamation task owned by a component.
//!
//! The loop holds only a `Weak` reference to its component: dropping the
//! component ends the loop on its next tick, and `stop()` ends it immediately.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Reclaimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `sweep` against `target` every `period`. First sweep happens one
    /// period after start. No-op if already running or no tokio runtime.
    pub fn start<T, F>(&self, name: &'static str, period: Duration, target: &Arc<T>, sweep: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(task = name, "No tokio runtime; reclamation must be driven manually");
            return;
        };

        let period = period.max(Duration::from_millis(1));
        let weak: Weak<T> = Arc::downgrade(target);

        *slot = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(target) = weak.upgrade() else {
                    debug!(task = name, "Owner dropped, reclamation loop exiting");
                    break;
                };
                sweep(&target);
            }
        }));
        debug!(task = name, period_ms = period.as_millis() as u64, "Reclamation started");
    }

    /// Abort the loop. Returns whether a loop was running.
    pub fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
