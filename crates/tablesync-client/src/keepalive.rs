//! Connection liveness probing.
//!
//! Every period the monitor sends a probe and counts it as outstanding.
//! Any inbound traffic clears the count. When `max_missed` probes in a row
//! go unanswered the connection is declared dead.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub struct Keepalive {
    missed: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Keepalive {
    #[must_use]
    pub fn new() -> Self {
        Self {
            missed: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Start probing. Replaces a running monitor.
    ///
    /// `probe` sends a ping and returns false if it could not be sent, which
    /// ends the monitor without calling `on_dead`.
    pub fn start<P, D>(&self, period: Duration, max_missed: u32, mut probe: P, on_dead: D)
    where
        P: FnMut() -> bool + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let missed = Arc::clone(&self.missed);
        missed.store(0, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let outstanding = missed.load(Ordering::SeqCst);
                if outstanding >= max_missed {
                    warn!(missed = outstanding, "Keepalive timed out");
                    on_dead();
                    return;
                }

                missed.fetch_add(1, Ordering::SeqCst);
                if !probe() {
                    debug!("Keepalive probe failed, stopping");
                    return;
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Record inbound traffic.
    pub fn on_activity(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Probes sent since the last inbound traffic.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.stop();
    }
}
