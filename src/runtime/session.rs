//! Capture session state machine.
//!
//! A session moves `Idle -> Capturing -> Stopping -> Done`. While capturing,
//! a duration timer, a file size poll and external cancellation race to end
//! it. Each trigger writes into a single-slot channel; the first write wins
//! and later writes are dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopping,
    Done,
}

/// Why a capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Duration,
    SizeLimit,
    Cancelled,
    /// The capture file never appeared.
    CaptureFileMissing,
    /// The capture tool exited on its own.
    ProcessExited,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Duration => "duration elapsed",
            StopReason::SizeLimit => "size limit reached",
            StopReason::Cancelled => "cancelled",
            StopReason::CaptureFileMissing => "capture file missing",
            StopReason::ProcessExited => "capture tool exited",
        };
        f.write_str(text)
    }
}

/// Limits applied to one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureBudget {
    pub duration: Option<Duration>,
    pub max_size_bytes: Option<u64>,
    pub poll_interval: Duration,
    /// How long to wait for a graceful stop before killing.
    pub stop_timeout: Duration,
}

impl Default for CaptureBudget {
    fn default() -> Self {
        Self {
            duration: None,
            max_size_bytes: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl CaptureBudget {
    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: Option<u64>) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// A running native capture.
#[async_trait]
pub trait CaptureProcess: Send {
    fn tool(&self) -> &str;

    /// Non-blocking check whether the tool has already exited.
    fn has_exited(&mut self) -> Result<bool, RuntimeError>;

    /// Ask the tool to stop and flush its output.
    async fn request_stop(&mut self) -> Result<(), RuntimeError>;

    async fn kill(&mut self) -> Result<(), RuntimeError>;

    async fn wait(&mut self) -> Result<(), RuntimeError>;
}

#[derive(Clone)]
struct StopTrigger {
    tx: mpsc::Sender<StopReason>,
}

impl StopTrigger {
    /// Returns false if another trigger already fired.
    fn fire(&self, reason: StopReason) -> bool {
        let fired = self.tx.try_send(reason).is_ok();
        if !fired {
            debug!("Ignoring stop trigger ({}), capture already stopping", reason);
        }
        fired
    }
}

struct Session {
    state: CaptureState,
}

impl Session {
    fn transition(&mut self, next: CaptureState) {
        debug!("Capture state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Drive `process` until a stop trigger fires, then stop it.
///
/// Cancellation is not an error: the partial capture is kept.
pub async fn run_session(
    process: &mut dyn CaptureProcess,
    capture_file: &Path,
    budget: &CaptureBudget,
    cancel: &CancellationToken,
) -> Result<StopReason, RuntimeError> {
    let mut session = Session {
        state: CaptureState::Idle,
    };
    session.transition(CaptureState::Capturing);

    let (tx, mut rx) = mpsc::channel(1);
    let trigger = StopTrigger { tx };
    let mut triggers = JoinSet::new();

    if let Some(duration) = budget.duration {
        let trigger = trigger.clone();
        triggers.spawn(async move {
            tokio::time::sleep(duration).await;
            trigger.fire(StopReason::Duration);
        });
    }
    if let Some(limit) = budget.max_size_bytes {
        triggers.spawn(poll_file_size(
            capture_file.to_path_buf(),
            limit,
            budget.poll_interval,
            trigger.clone(),
        ));
    }
    {
        let trigger = trigger.clone();
        let cancel = cancel.clone();
        triggers.spawn(async move {
            cancel.cancelled().await;
            trigger.fire(StopReason::Cancelled);
        });
    }
    drop(trigger);

    let mut exit_check = tokio::time::interval(budget.poll_interval);
    exit_check.tick().await;
    let reason = loop {
        tokio::select! {
            Some(reason) = rx.recv() => break reason,
            _ = exit_check.tick() => {
                if process.has_exited()? {
                    break StopReason::ProcessExited;
                }
            }
        }
    };
    triggers.abort_all();
    info!("Stopping {} capture: {}", process.tool(), reason);

    session.transition(CaptureState::Stopping);
    if reason == StopReason::ProcessExited {
        process.wait().await?;
    } else {
        stop_process(process, budget.stop_timeout).await?;
    }
    session.transition(CaptureState::Done);

    if reason == StopReason::CaptureFileMissing {
        return Err(RuntimeError::CaptureFileMissing(capture_file.to_path_buf()));
    }
    Ok(reason)
}

/// Graceful stop, killing only if the stop request fails or times out.
async fn stop_process(
    process: &mut dyn CaptureProcess,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    if let Err(e) = process.request_stop().await {
        warn!("Graceful stop of {} failed, killing: {}", process.tool(), e);
        process.kill().await?;
        return process.wait().await;
    }

    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} did not exit within {:?}, killing", process.tool(), timeout);
            process.kill().await?;
            process.wait().await
        }
    }
}

async fn poll_file_size(path: PathBuf, limit: u64, interval: Duration, trigger: StopTrigger) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; give the tool one interval to create the file.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() >= limit => {
                info!(
                    "Capture file {} reached {} bytes (limit {})",
                    path.display(),
                    meta.len(),
                    limit
                );
                trigger.fire(StopReason::SizeLimit);
                return;
            }
            Ok(meta) => debug!("Capture file size {} bytes", meta.len()),
            Err(e) => {
                warn!("Cannot stat capture file {}: {}", path.display(), e);
                trigger.fire(StopReason::CaptureFileMissing);
                return;
            }
        }
    }
}
