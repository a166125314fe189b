//! Per-key work queue driving a reconciler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::CaptureKey;
use crate::error::ControllerError;

use super::Reconcile;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Runs reconciles for different keys concurrently, never two for the same key.
///
/// Events for a key that is already being reconciled collapse into a single
/// rerun once the current pass finishes. Failed passes are requeued with an
/// exponential delay.
pub struct Controller<R: Reconcile> {
    reconciler: Arc<R>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

type Outcome = (CaptureKey, Result<(), ControllerError>);

struct QueueState {
    running: JoinSet<Outcome>,
    timers: JoinSet<CaptureKey>,
    in_flight: HashSet<CaptureKey>,
    dirty: HashSet<CaptureKey>,
    failures: HashMap<CaptureKey, u32>,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(reconciler: Arc<R>) -> Self {
        Self {
            reconciler,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Process `events` until cancelled, or until the channel closes and no
    /// work remains. In-flight reconciles are awaited on cancellation.
    pub async fn run(self, mut events: mpsc::Receiver<CaptureKey>, cancel: CancellationToken) {
        let mut state = QueueState {
            running: JoinSet::new(),
            timers: JoinSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
        };
        let mut events_open = true;

        info!("Capture controller started");
        loop {
            if !events_open && state.running.is_empty() && state.timers.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Capture controller stopping");
                    break;
                }
                event = events.recv(), if events_open => match event {
                    Some(key) => self.enqueue(&mut state, key),
                    None => {
                        debug!("Event channel closed");
                        events_open = false;
                    }
                },
                Some(joined) = state.running.join_next() => match joined {
                    Ok((key, result)) => self.complete(&mut state, key, result),
                    Err(e) => error!("Reconcile task failed to join: {}", e),
                },
                Some(fired) = state.timers.join_next() => {
                    if let Ok(key) = fired {
                        debug!(capture = %key, "Requeue delay elapsed");
                        self.enqueue(&mut state, key);
                    }
                }
            }
        }

        state.timers.abort_all();
        while let Some(joined) = state.running.join_next().await {
            if let Ok((key, Err(e))) = joined {
                warn!(capture = %key, "Reconcile failed during shutdown: {}", e);
            }
        }
        info!("Capture controller stopped");
    }

    fn enqueue(&self, state: &mut QueueState, key: CaptureKey) {
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        self.spawn(state, key);
    }

    fn spawn(&self, state: &mut QueueState, key: CaptureKey) {
        state.in_flight.insert(key.clone());
        let reconciler = self.reconciler.clone();
        state.running.spawn(async move {
            let task_key = key.clone();
            // Inner task so a panicking reconcile still reports its key.
            let result = match tokio::spawn(async move { reconciler.reconcile(&task_key).await }).await {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Task(e.to_string())),
            };
            (key, result)
        });
    }

    fn complete(&self, state: &mut QueueState, key: CaptureKey, result: Result<(), ControllerError>) {
        state.in_flight.remove(&key);
        let rerun = state.dirty.remove(&key);

        match result {
            Ok(()) => {
                state.failures.remove(&key);
            }
            Err(e) => {
                let failures = state.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                if rerun {
                    // The pending rerun doubles as the retry.
                    warn!(capture = %key, attempt = *failures, "Reconcile failed, rerunning for pending events: {}", e);
                } else {
                    let delay = self.backoff(*failures);
                    warn!(capture = %key, attempt = *failures, "Reconcile failed, requeueing in {:?}: {}", delay, e);
                    let requeued = key.clone();
                    state.timers.spawn(async move {
                        tokio::time::sleep(delay).await;
                        requeued
                    });
                }
            }
        }

        if rerun {
            self.spawn(state, key);
        }
    }
}
