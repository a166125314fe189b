//! Capture status derived from workload status.

use chrono::{DateTime, Utc};

use crate::domain::{CaptureStatus, ConditionType, Workload, WorkloadConditionType};

pub const REASON_JOBS_IN_PROGRESS: &str = "JobsInProgress";
pub const REASON_JOBS_COMPLETED: &str = "JobsCompleted";
pub const REASON_RUN_JOB_FAILED: &str = "RunJobFailed";
pub const REASON_CREATE_JOB_FAILED: &str = "CreateJobFailed";
pub const REASON_CREATE_SECRET_FAILED: &str = "CreateSecretFailed";

pub fn in_progress_message(active: usize, total: usize) -> String {
    format!(
        "{}/{} Capture jobs are in progress, waiting for completion",
        active, total
    )
}

/// Fold the state of every owned workload into `status`.
pub fn aggregate_status(status: &mut CaptureStatus, workloads: &[Workload], now: DateTime<Utc>) {
    let (mut active, mut succeeded, mut failed) = (0usize, 0usize, 0usize);
    for workload in workloads {
        match workload.status.finished() {
            None => active += 1,
            Some(WorkloadConditionType::Complete) => succeeded += 1,
            Some(WorkloadConditionType::Failed) => failed += 1,
        }
    }

    status.active = active as u32;
    status.succeeded = succeeded as u32;
    status.failed = failed as u32;

    if failed > 0 {
        status.set_condition(
            ConditionType::Error,
            true,
            REASON_RUN_JOB_FAILED,
            format!("{} Capture jobs are in failed state", failed),
            now,
        );
    }

    if succeeded != workloads.len() {
        status.set_condition(
            ConditionType::Complete,
            false,
            REASON_JOBS_IN_PROGRESS,
            in_progress_message(active, workloads.len()),
            now,
        );
        return;
    }

    status.set_condition(
        ConditionType::Complete,
        true,
        REASON_JOBS_COMPLETED,
        format!("All {} Capture jobs are completed", succeeded),
        now,
    );
    // Latest workload completion, so re-aggregating yields the same status.
    status.completion_time = Some(
        workloads
            .iter()
            .filter_map(|w| w.status.completion_time)
            .max()
            .unwrap_or(now),
    );
}
