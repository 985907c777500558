//! Persisted array state and the array-level phase machine.
//!
//! [`ArrayState`] is the snapshot handed back to the host after every poll and
//! passed in again on the next one. Nothing else survives between polls.

use serde::{Deserialize, Serialize};

use crate::compact::CompactArray;
use crate::phase::{ExecutionError, PhaseInfo, TaskPhase};
use crate::summary::ArraySummary;

/// Reason recorded while subtasks are still being checked.
pub const STILL_RUNNING_REASON: &str = "Task is still running.";

/// Phase of the array as a whole.
///
/// ```text
/// Start ─► CheckingSubTaskExecutions ◄─► WaitingForResources
///                  │
///        ┌─────────┴──────────────┐
///        ▼                        ▼
///  WriteToDiscovery      WriteToDiscoveryThenFail
///        │                        │
///        ▼                        ▼
///  AssembleFinalOutput    AssembleFinalError
///        │                        │
///        ▼                        ▼
///     Success              RetryableFailure
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArrayPhase {
    /// Not yet initialized.
    #[default]
    Start,
    /// At least one subtask is waiting on admission control.
    WaitingForResources,
    /// Subtasks are being launched and monitored.
    CheckingSubTaskExecutions,
    /// Enough subtasks succeeded; record results, then assemble outputs.
    WriteToDiscovery,
    /// Too few subtasks can succeed; record partial results, then assemble errors.
    WriteToDiscoveryThenFail,
    /// Combined outputs are being assembled.
    AssembleFinalOutput,
    /// Combined errors are being assembled.
    AssembleFinalError,
    /// Completed successfully.
    Success,
    /// Failed; the host may retry the whole array.
    RetryableFailure,
    /// Failed; retrying will not help.
    PermanentFailure,
}

impl ArrayPhase {
    /// Returns the stable numeric code of this phase.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Start => 0,
            Self::WaitingForResources => 1,
            Self::CheckingSubTaskExecutions => 2,
            Self::WriteToDiscovery => 3,
            Self::WriteToDiscoveryThenFail => 4,
            Self::AssembleFinalOutput => 5,
            Self::AssembleFinalError => 6,
            Self::Success => 7,
            Self::RetryableFailure => 8,
            Self::PermanentFailure => 9,
        }
    }

    /// Returns true if the array will not change phase again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::RetryableFailure | Self::PermanentFailure
        )
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::WaitingForResources => "waiting_for_resources",
            Self::CheckingSubTaskExecutions => "checking_subtask_executions",
            Self::WriteToDiscovery => "write_to_discovery",
            Self::WriteToDiscoveryThenFail => "write_to_discovery_then_fail",
            Self::AssembleFinalOutput => "assemble_final_output",
            Self::AssembleFinalError => "assemble_final_error",
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl std::fmt::Display for ArrayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Per-index status of an array.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayStatus {
    /// Phase → count cache derived from `detailed`.
    pub summary: ArraySummary,
    /// Phase code per index; the source of truth.
    pub detailed: CompactArray,
    /// Retry count per index, maintained by the host.
    #[serde(default)]
    pub retries: CompactArray,
}

impl ArrayStatus {
    /// Creates a status for `size` subtasks, all [`TaskPhase::Undefined`].
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            summary: ArraySummary::new(),
            detailed: new_phases_array(size),
            retries: CompactArray::default(),
        }
    }

    /// Returns the phase recorded for `index`.
    ///
    /// Unknown codes read as [`TaskPhase::Undefined`].
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn phase_at(&self, index: usize) -> TaskPhase {
        TaskPhase::from_code(self.detailed.get_item(index)).unwrap_or_default()
    }

    /// Records `phase` for `index` in both the detailed array and the summary.
    ///
    /// Meant for building a fresh status where each index is recorded once.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn record(&mut self, index: usize, phase: TaskPhase) {
        self.detailed.set_item(index, phase.code());
        self.summary.inc(phase);
    }

    /// Returns the retry count recorded for `index`, zero when not tracked.
    #[must_use]
    pub fn retry_count(&self, index: usize) -> u64 {
        if index < self.retries.items_count() {
            self.retries.get_item(index)
        } else {
            0
        }
    }
}

/// Creates a compact array sized for phase codes.
#[must_use]
pub fn new_phases_array(size: usize) -> CompactArray {
    CompactArray::new(size, TaskPhase::MAX_CODE)
}

/// Persisted snapshot of one array task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayState {
    /// Number of subtasks actually executed.
    pub execution_array_size: usize,
    /// Number of subtasks requested by the template.
    pub original_array_size: i64,
    /// Successes required out of the original size.
    pub original_min_successes: i64,
    /// Per-index status.
    pub array_status: ArrayStatus,
    /// Array-level phase.
    pub current_phase: ArrayPhase,
    /// Change hint within the current phase.
    pub phase_version: u32,
    /// Free-form reason for the current phase.
    #[serde(default)]
    pub reason: String,
    /// Failure attached to the array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<ExecutionError>,
}

impl ArrayState {
    /// Creates a state in [`ArrayPhase::Start`].
    #[must_use]
    pub fn new(array_size: usize, min_successes: i64) -> Self {
        let original = i64::try_from(array_size).unwrap_or(i64::MAX);
        Self {
            execution_array_size: array_size,
            original_array_size: original,
            original_min_successes: min_successes,
            ..Self::default()
        }
    }

    /// Returns true once the per-index status has been created.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        !self.array_status.detailed.is_empty()
    }

    /// Successes required out of the executed subtasks.
    ///
    /// Subtasks skipped before execution count as successes, so the minimum
    /// shrinks by the number of skipped subtasks.
    #[must_use]
    pub fn effective_min_successes(&self) -> i64 {
        let execution = i64::try_from(self.execution_array_size).unwrap_or(i64::MAX);
        self.original_min_successes - self.original_array_size + execution
    }

    /// Sets the phase and version.
    #[must_use]
    pub fn with_phase(mut self, phase: ArrayPhase, version: u32) -> Self {
        self.current_phase = phase;
        self.phase_version = version;
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Replaces the per-index status.
    #[must_use]
    pub fn with_array_status(mut self, status: ArrayStatus) -> Self {
        self.array_status = status;
        self
    }

    /// Attaches an execution error.
    #[must_use]
    pub fn with_execution_error(mut self, error: ExecutionError) -> Self {
        self.execution_error = Some(error);
        self
    }

    /// Maps the array state to the phase reported to the host.
    #[must_use]
    pub fn to_phase_info(&self) -> PhaseInfo {
        match self.current_phase {
            ArrayPhase::Success => PhaseInfo::success(),
            ArrayPhase::RetryableFailure => {
                PhaseInfo::failed(TaskPhase::RetryableFailure, self.failure())
            }
            ArrayPhase::PermanentFailure => {
                PhaseInfo::failed(TaskPhase::PermanentFailure, self.failure())
            }
            ArrayPhase::WaitingForResources => PhaseInfo::waiting_for_resources(&self.reason),
            phase => {
                let version = (phase.code() << 24) | (self.phase_version & 0x00FF_FFFF);
                let info = PhaseInfo::running(version);
                if self.reason.is_empty() {
                    info
                } else {
                    info.with_reason(&self.reason)
                }
            }
        }
    }

    fn failure(&self) -> ExecutionError {
        self.execution_error
            .clone()
            .unwrap_or_else(|| ExecutionError::user("ArrayTaskFailed", &self.reason))
    }
}

/// Derives the array phase from the subtask summary.
///
/// `min_successes` is the effective minimum (see
/// [`ArrayState::effective_min_successes`]).
#[must_use]
pub fn summary_to_phase(min_successes: i64, summary: &ArraySummary) -> ArrayPhase {
    let mut total = 0;
    let mut success = 0;
    let mut non_terminal = 0;
    let mut waiting = 0;

    for (phase, count) in summary.iter() {
        total += count;
        if phase.is_success() {
            success += count;
        } else if !phase.is_terminal() {
            non_terminal += count;
        }
        if phase == TaskPhase::WaitingForResources {
            waiting += count;
        }
    }

    if total < min_successes || success + non_terminal < min_successes {
        return ArrayPhase::WriteToDiscoveryThenFail;
    }
    if waiting > 0 {
        return ArrayPhase::WaitingForResources;
    }
    if non_terminal == 0 && success >= min_successes {
        return ArrayPhase::WriteToDiscovery;
    }
    ArrayPhase::CheckingSubTaskExecutions
}

/// Change hint for a running array: `Σ phase_code × count`.
///
/// Different summaries may produce the same value.
#[must_use]
pub fn summary_version(summary: &ArraySummary) -> u32 {
    summary.iter().fold(0u32, |acc, (phase, count)| {
        let code = u32::try_from(phase.code()).unwrap_or(u32::MAX);
        let count = u32::try_from(count).unwrap_or(0);
        acc.wrapping_add(code.wrapping_mul(count))
    })
}
