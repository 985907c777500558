//! Distributed training job status model and its translation into subtask phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::PhaseInfo;

/// Type of a training job condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingConditionType {
    /// Accepted by the operator.
    Created,
    /// Replicas are running.
    Running,
    /// Replicas are being restarted.
    Restarting,
    /// Finished successfully.
    Succeeded,
    /// Failed.
    Failed,
}

/// One training job condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingCondition {
    /// Condition type.
    pub kind: TrainingConditionType,
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

/// Observed status of a training job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrainingJobStatus {
    /// Conditions, oldest first.
    #[serde(default)]
    pub conditions: Vec<TrainingCondition>,
}

/// Translates an observed training job into a subtask phase.
///
/// Only the latest condition matters.
#[must_use]
pub fn phase_info(status: &TrainingJobStatus, now: DateTime<Utc>) -> PhaseInfo {
    let Some(latest) = status.conditions.last() else {
        return PhaseInfo::queued(now, "JobCreating");
    };
    let at = latest.last_transition_time.unwrap_or(now);

    match latest.kind {
        TrainingConditionType::Created => PhaseInfo::queued(at, "JobCreated"),
        TrainingConditionType::Running => PhaseInfo::running(0),
        TrainingConditionType::Succeeded => PhaseInfo::success().at(at),
        TrainingConditionType::Failed | TrainingConditionType::Restarting => {
            PhaseInfo::retryable_failure(&latest.reason, &latest.message).at(at)
        }
    }
}
