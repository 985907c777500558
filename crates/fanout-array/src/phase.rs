//! Subtask lifecycle phases and the phase report produced by status translation.
//!
//! Every backend translates its native status into a [`PhaseInfo`], so the
//! reconciliation loop only ever reasons about [`TaskPhase`] values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a single subtask.
///
/// The numeric codes are stored in the compact status array and must stay
/// stable across releases.
///
/// ```text
///   NotReady ─► WaitingForResources ─► Queued ─► Initializing ─► Running
///                                                                   │
///                   ┌───────────────────┬───────────────────────────┤
///                   ▼                   ▼                           ▼
///               Success         RetryableFailure            PermanentFailure
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    /// No status is known yet.
    #[default]
    Undefined,
    /// Inputs are not yet available.
    NotReady,
    /// Admission control denied a token.
    WaitingForResources,
    /// Accepted by the cluster, waiting to be scheduled.
    Queued,
    /// Scheduled, pulling images or running init steps.
    Initializing,
    /// Executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed in a way that may succeed on retry.
    RetryableFailure,
    /// Failed in a way that will not succeed on retry.
    PermanentFailure,
}

impl TaskPhase {
    /// All phases in code order.
    pub const ALL: [Self; 9] = [
        Self::Undefined,
        Self::NotReady,
        Self::WaitingForResources,
        Self::Queued,
        Self::Initializing,
        Self::Running,
        Self::Success,
        Self::RetryableFailure,
        Self::PermanentFailure,
    ];

    /// Largest numeric code of any phase.
    pub const MAX_CODE: u64 = Self::PermanentFailure.code();

    /// Returns the stable numeric code of this phase.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::Undefined => 0,
            Self::NotReady => 1,
            Self::WaitingForResources => 2,
            Self::Queued => 3,
            Self::Initializing => 4,
            Self::Running => 5,
            Self::Success => 6,
            Self::RetryableFailure => 7,
            Self::PermanentFailure => 8,
        }
    }

    /// Returns the phase for a numeric code, or `None` for unknown codes.
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Undefined),
            1 => Some(Self::NotReady),
            2 => Some(Self::WaitingForResources),
            3 => Some(Self::Queued),
            4 => Some(Self::Initializing),
            5 => Some(Self::Running),
            6 => Some(Self::Success),
            7 => Some(Self::RetryableFailure),
            8 => Some(Self::PermanentFailure),
            _ => None,
        }
    }

    /// Returns true if the subtask will not change phase again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::RetryableFailure | Self::PermanentFailure
        )
    }

    /// Returns true for [`TaskPhase::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true for either failure phase.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::RetryableFailure | Self::PermanentFailure)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::NotReady => "not_ready",
            Self::WaitingForResources => "waiting_for_resources",
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Who is responsible for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The user's code or configuration.
    #[default]
    User,
    /// The platform (scheduling, node loss, timeouts).
    System,
}

/// A failure attached to a phase report or to the array state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Short machine-readable code (e.g. `OOMKilled`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Failure attribution.
    pub kind: ErrorKind,
}

impl ExecutionError {
    /// Creates a user-attributed error.
    #[must_use]
    pub fn user(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: ErrorKind::User,
        }
    }

    /// Creates a system-attributed error.
    #[must_use]
    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: ErrorKind::System,
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "[{}] {}", self.code, self.message)
        }
    }
}

/// A log link for a subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    /// Display name.
    pub name: String,
    /// Link target.
    pub uri: String,
}

/// Phase report for one task, as seen by a single observation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhaseInfo {
    /// Observed phase.
    pub phase: TaskPhase,
    /// Version within the phase; bumps signal progress.
    pub version: u32,
    /// Optional free-form reason.
    pub reason: Option<String>,
    /// Failure details for failure phases.
    pub error: Option<ExecutionError>,
    /// When the observed transition happened.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Log links collected for this observation.
    pub logs: Vec<TaskLog>,
}

impl PhaseInfo {
    /// Phase unknown.
    #[must_use]
    pub fn undefined() -> Self {
        Self::default()
    }

    /// Queued with a reason.
    #[must_use]
    pub fn queued(occurred_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            phase: TaskPhase::Queued,
            reason: Some(reason.into()),
            occurred_at: Some(occurred_at),
            ..Self::default()
        }
    }

    /// Waiting on admission control.
    #[must_use]
    pub fn waiting_for_resources(reason: impl Into<String>) -> Self {
        Self {
            phase: TaskPhase::WaitingForResources,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Initializing with a reason.
    #[must_use]
    pub fn initializing(occurred_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            phase: TaskPhase::Initializing,
            reason: Some(reason.into()),
            occurred_at: Some(occurred_at),
            ..Self::default()
        }
    }

    /// Running at the given version.
    #[must_use]
    pub fn running(version: u32) -> Self {
        Self {
            phase: TaskPhase::Running,
            version,
            ..Self::default()
        }
    }

    /// Completed successfully.
    #[must_use]
    pub fn success() -> Self {
        Self {
            phase: TaskPhase::Success,
            ..Self::default()
        }
    }

    /// Retryable failure attributed to the user.
    #[must_use]
    pub fn retryable_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(
            TaskPhase::RetryableFailure,
            ExecutionError::user(code, message),
        )
    }

    /// Retryable failure attributed to the system.
    #[must_use]
    pub fn system_retryable_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(
            TaskPhase::RetryableFailure,
            ExecutionError::system(code, message),
        )
    }

    /// Permanent failure attributed to the user.
    #[must_use]
    pub fn permanent_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(
            TaskPhase::PermanentFailure,
            ExecutionError::user(code, message),
        )
    }

    /// Failure in the given phase with the given error.
    #[must_use]
    pub fn failed(phase: TaskPhase, error: ExecutionError) -> Self {
        Self {
            phase,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Sets the occurrence time.
    #[must_use]
    pub const fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Attaches log links.
    #[must_use]
    pub fn with_logs(mut self, logs: Vec<TaskLog>) -> Self {
        self.logs = logs;
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Returns a one-line description for error collection.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.error, &self.reason) {
            (Some(err), _) => err.to_string(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => self.phase.to_string(),
        }
    }
}
