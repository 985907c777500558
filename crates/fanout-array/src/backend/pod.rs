//! Pod status model and its translation into subtask phases.
//!
//! Translation is a pure function of the observed status, the object's
//! labels and creation time, the current time, and the system-level timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterObject;
use crate::phase::PhaseInfo;

/// Termination reason reported for containers killed by the OOM killer.
pub const OOM_KILLED: &str = "OOMKilled";

/// Code used when a container was killed by the node.
pub const INTERRUPTED: &str = "Interrupted";

/// Exit code of a process killed by `SIGKILL`.
pub const SIGKILL_EXIT_CODE: i32 = 137;

/// Code used when a pending pod outlives the system-level timeout.
pub const SYSTEM_LEVEL_TIMEOUT: &str = "systemLevelTimeout";

/// High-level pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers are running.
    #[default]
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// State could not be obtained.
    Unknown,
}

/// Type of a pod condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodConditionType {
    /// The pod has been bound to a node.
    PodScheduled,
    /// The pod is ready to serve.
    Ready,
    /// Scheduling failed for lack of resources.
    Unschedulable,
    /// All init containers completed.
    Initialized,
    /// All containers are ready.
    ContainersReady,
}

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Condition holds.
    True,
    /// Condition does not hold.
    False,
    /// Unknown.
    #[default]
    Unknown,
}

/// One pod condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    /// Condition type.
    pub kind: PodConditionType,
    /// Truth value.
    pub status: ConditionStatus,
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

/// State of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Not yet running.
    Waiting {
        /// Machine-readable reason (e.g. `ImagePullBackOff`).
        reason: String,
        /// Human-readable message.
        #[serde(default)]
        message: String,
    },
    /// Running.
    Running {
        /// When the container started.
        started_at: Option<DateTime<Utc>>,
    },
    /// Exited.
    Terminated {
        /// Process exit code.
        exit_code: i32,
        /// Machine-readable reason.
        #[serde(default)]
        reason: String,
        /// Human-readable message.
        #[serde(default)]
        message: String,
    },
}

/// Status of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Whether the container passes readiness checks.
    #[serde(default)]
    pub ready: bool,
    /// Current state.
    pub state: ContainerState,
    /// Previous termination, if the container restarted.
    #[serde(default)]
    pub last_state: Option<ContainerState>,
}

impl ContainerStatus {
    fn terminated_reason(&self) -> Option<&str> {
        match &self.state {
            ContainerState::Terminated { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Last termination if present, else the current one.
    fn termination(&self) -> Option<(i32, &str, &str)> {
        [self.last_state.as_ref(), Some(&self.state)]
            .into_iter()
            .flatten()
            .find_map(|state| match state {
                ContainerState::Terminated {
                    exit_code,
                    reason,
                    message,
                } => Some((*exit_code, reason.as_str(), message.as_str())),
                _ => None,
            })
    }
}

/// Observed status of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    /// Pod phase.
    pub phase: PodPhase,
    /// Machine-readable reason for the phase.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message for the phase.
    #[serde(default)]
    pub message: String,
    /// Conditions, in the order reported.
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    /// Init container statuses.
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    /// Main container statuses.
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    /// When the kubelet started the pod.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl PodStatus {
    fn all_containers(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.init_container_statuses
            .iter()
            .chain(&self.container_statuses)
    }
}

fn timed_out(timeout: Duration, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if timeout.is_zero() {
        return false;
    }
    let Some(since) = since else {
        return false;
    };
    (now - since).to_std().is_ok_and(|elapsed| elapsed > timeout)
}

/// Translates an observed pod into a subtask phase.
#[must_use]
pub fn phase_info(
    object: &ClusterObject,
    status: &PodStatus,
    now: DateTime<Utc>,
    timeout: Duration,
) -> PhaseInfo {
    match status.phase {
        PodPhase::Succeeded => demystify_success(status),
        PodPhase::Failed => {
            let (code, message) = failure_to_error(status);
            PhaseInfo::retryable_failure(code, message).at(now)
        }
        PodPhase::Pending => demystify_pending(object, status, now, timeout),
        PodPhase::Unknown => PhaseInfo::undefined(),
        PodPhase::Running => PhaseInfo::running(0),
    }
}

/// Explains why a pod is still pending.
#[must_use]
pub fn demystify_pending(
    object: &ClusterObject,
    status: &PodStatus,
    now: DateTime<Utc>,
    timeout: Duration,
) -> PhaseInfo {
    for condition in &status.conditions {
        let at = condition.last_transition_time.unwrap_or(now);
        match condition.kind {
            PodConditionType::PodScheduled if condition.status == ConditionStatus::False => {
                if object.is_interruptible() && timed_out(timeout, Some(object.created_at), now) {
                    return PhaseInfo::system_retryable_failure(
                        SYSTEM_LEVEL_TIMEOUT,
                        "system timeout reached at status Unschedulable",
                    )
                    .at(at);
                }
                return PhaseInfo::queued(
                    at,
                    format!("{}:{}", condition.reason, condition.message),
                );
            }
            PodConditionType::Unschedulable => {
                return PhaseInfo::queued(
                    at,
                    format!("{}:{}", condition.reason, condition.message),
                );
            }
            PodConditionType::Ready if condition.status == ConditionStatus::False => {
                if let Some(info) = demystify_not_ready(condition, status, now, timeout) {
                    return info;
                }
            }
            _ => {}
        }
    }

    PhaseInfo::queued(now, "Scheduling")
}

fn demystify_not_ready(
    condition: &PodCondition,
    status: &PodStatus,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Option<PhaseInfo> {
    let at = condition.last_transition_time.unwrap_or(now);

    status
        .container_statuses
        .iter()
        .filter(|c| !c.ready)
        .find_map(|container| {
            let ContainerState::Waiting { reason, message } = &container.state else {
                return None;
            };
            let final_reason = format!("{}|{reason}", condition.reason);
            let final_message = format!("{}|{message}", condition.message);

            let info = match reason.as_str() {
                "ErrImagePull" | "ContainerCreating" | "PodInitializing" => {
                    if timed_out(timeout, status.start_time, now) {
                        PhaseInfo::system_retryable_failure(
                            SYSTEM_LEVEL_TIMEOUT,
                            format!("system timeout reached, {final_message}"),
                        )
                    } else {
                        PhaseInfo::initializing(at, format!("[{final_reason}]: {final_message}"))
                    }
                }
                "CreateContainerError" => {
                    PhaseInfo::permanent_failure(final_reason, final_message)
                }
                "ImagePullBackOff" => PhaseInfo::retryable_failure(final_reason, final_message),
                // Unrecognized waiting reasons fail fast rather than sit in Queued
                // until the pod is reaped.
                _ => PhaseInfo::system_retryable_failure(final_reason, final_message),
            };
            Some(info.at(at))
        })
}

/// Checks a succeeded pod for containers that were OOM-killed.
#[must_use]
pub fn demystify_success(status: &PodStatus) -> PhaseInfo {
    let oom = status
        .all_containers()
        .filter_map(ContainerStatus::terminated_reason)
        .any(|reason| reason.contains(OOM_KILLED));
    if oom {
        return PhaseInfo::retryable_failure(
            OOM_KILLED,
            "Pod reported success despite being OOMKilled",
        );
    }
    PhaseInfo::success()
}

/// Builds `(code, message)` for a failed pod from the pod and its containers.
#[must_use]
pub fn failure_to_error(status: &PodStatus) -> (String, String) {
    let mut code = if status.reason.is_empty() {
        "UnknownError".to_string()
    } else {
        status.reason.clone()
    };
    let mut message = if status.message.is_empty() {
        "Pod failed. No message received from the cluster.".to_string()
    } else {
        status.message.clone()
    };

    for container in status.all_containers() {
        let Some((exit_code, reason, term_message)) = container.termination() else {
            continue;
        };

        if container
            .terminated_reason()
            .is_some_and(|r| r.contains(OOM_KILLED))
        {
            code = OOM_KILLED.to_string();
        } else if exit_code == SIGKILL_EXIT_CODE {
            code = INTERRUPTED.to_string();
        }

        if exit_code == 0 {
            message.push_str(&format!("\r\n[{}] terminated with ExitCode 0.", container.name));
        } else {
            message.push_str(&format!(
                "\r\n[{}] terminated with exit code ({exit_code}). Reason [{reason}]. Message: \n{term_message}.",
                container.name
            ));
        }
    }

    (code, message)
}
