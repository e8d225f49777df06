//! Liveness Monitor
//!
//! Polls a backend-supplied probe on a fixed interval and reports each
//! change of the probe's answer. What "alive" means (process present,
//! uplink interface up) is entirely up to the probe.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A change in probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub was_alive: bool,
    pub is_alive_now: bool,
}

impl Transition {
    /// Alive → not alive
    pub fn is_loss(&self) -> bool {
        self.was_alive && !self.is_alive_now
    }
}

/// Background poller with an explicit start/stop lifecycle
#[derive(Default)]
pub struct LivenessMonitor {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin polling; replaces any previous schedule
    ///
    /// `initial` is the state the first poll is compared against. The probe
    /// and the callback both run on the blocking pool.
    pub fn start<P, F>(&mut self, probe: P, interval: Duration, initial: bool, on_transition: F)
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: Fn(Transition) + Send + Sync + 'static,
    {
        self.stop();

        let token = CancellationToken::new();
        let probe = Arc::new(probe);
        let on_transition = Arc::new(on_transition);
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; the first poll is one interval out.
            ticker.tick().await;

            let mut last = initial;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let probe = probe.clone();
                        let alive = tokio::task::spawn_blocking(move || probe())
                            .await
                            .unwrap_or_else(|e| {
                                warn!("Liveness probe panicked: {}", e);
                                false
                            });

                        if task_token.is_cancelled() {
                            break;
                        }
                        if alive == last {
                            continue;
                        }

                        let transition = Transition { was_alive: last, is_alive_now: alive };
                        last = alive;
                        let callback = on_transition.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || callback(transition)).await {
                            warn!("Liveness callback panicked: {}", e);
                        }
                    }
                }
            }
            debug!("Liveness monitor stopped");
        });

        self.token = Some(token);
        self.task = Some(task);
    }

    /// Cancel polling; no-op when not running
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.task = None;
    }

    /// Cancel polling and wait for an in-flight poll to finish
    pub async fn shutdown(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Liveness task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
