//! Batch job status model and its translation into subtask phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::PhaseInfo;

/// Type of a batch job condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobConditionType {
    /// The job finished successfully.
    Complete,
    /// The job failed.
    Failed,
    /// The job is suspended.
    Suspended,
}

/// One batch job condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    /// Condition type.
    pub kind: JobConditionType,
    /// Whether the condition holds.
    pub status: bool,
    /// Machine-readable reason.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Last time the condition changed.
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Observed status of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchJobStatus {
    /// Conditions, in the order reported.
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    /// Pods currently running.
    #[serde(default)]
    pub active: u32,
    /// Pods that succeeded.
    #[serde(default)]
    pub succeeded: u32,
    /// Pods that failed.
    #[serde(default)]
    pub failed: u32,
}

impl BatchJobStatus {
    fn condition(&self, kind: JobConditionType) -> Option<&JobCondition> {
        self.conditions.iter().find(|c| c.kind == kind && c.status)
    }
}

/// Translates an observed batch job into a subtask phase.
#[must_use]
pub fn phase_info(status: &BatchJobStatus, now: DateTime<Utc>) -> PhaseInfo {
    if let Some(done) = status.condition(JobConditionType::Complete) {
        return PhaseInfo::success().at(done.last_transition_time.unwrap_or(now));
    }
    if let Some(failed) = status.condition(JobConditionType::Failed) {
        let code = if failed.reason.is_empty() {
            "JobFailed"
        } else {
            failed.reason.as_str()
        };
        return PhaseInfo::retryable_failure(code, &failed.message)
            .at(failed.last_transition_time.unwrap_or(now));
    }
    if status.active > 0 {
        return PhaseInfo::running(status.succeeded + status.failed);
    }
    PhaseInfo::queued(now, "JobPending")
}
