//! One reconciliation round over every subtask of an array.
//!
//! [`launch_and_check_subtasks`] is a pure function of the persisted
//! [`ArrayState`] and the external inputs: it returns the next state, or an
//! error that leaves the previous state in force. A round never partially
//! applies.

use tracing::{debug, info, warn};

use crate::driver::{LaunchResult, RoundInputs, SubTask};
use crate::error::{Error, Result};
use crate::error_collector::ErrorMessageCollector;
use crate::metrics::time_round;
use crate::phase::{TaskLog, TaskPhase};
use crate::state::{
    new_phases_array, summary_to_phase, summary_version, ArrayPhase, ArrayState, ArrayStatus,
    STILL_RUNNING_REASON,
};
use crate::summary::ArraySummary;

/// Result of a reconciliation round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// State to persist.
    pub state: ArrayState,
    /// Log links of the subtasks observed this round.
    pub log_links: Vec<TaskLog>,
    /// False when the round observed nothing new; the host may skip persisting.
    pub changed: bool,
}

/// Launches missing subtasks, observes running ones, and derives the array phase.
///
/// Indices are visited in increasing order. An index already recorded as
/// terminal is not touched on the cluster; its admission token is released
/// and its phase copied forward.
///
/// # Errors
///
/// Returns an error if any cluster, resource-manager or storage call fails in
/// a way that must be retried, or if the persisted status does not match the
/// array size. The caller keeps `current` in that case.
#[tracing::instrument(
    skip_all,
    fields(
        execution = %inputs.ctx.generated_name(),
        size = current.execution_array_size,
        phase = %current.current_phase,
    )
)]
pub async fn launch_and_check_subtasks(
    inputs: &RoundInputs<'_>,
    current: &ArrayState,
) -> Result<RoundOutcome> {
    let _timer = time_round();
    let size = current.execution_array_size;
    let max_size = inputs.config.max_array_job_size;

    if size > max_size {
        let reason =
            format!("array size > max allowed. Requested [{size}]. Allowed [{max_size}]");
        warn!(%reason, "rejecting array");
        inputs.metrics.record_round(ArrayPhase::PermanentFailure);
        let state = current
            .clone()
            .with_phase(ArrayPhase::PermanentFailure, 0)
            .with_reason(reason);
        return Ok(RoundOutcome {
            changed: state != *current,
            state,
            log_links: Vec::new(),
        });
    }

    let previous = current;
    let mut current = current.clone();
    if !current.is_initialized() {
        let retries = std::mem::take(&mut current.array_status.retries);
        current.array_status = ArrayStatus {
            retries,
            ..ArrayStatus::new(size)
        };
    }
    if current.array_status.detailed.items_count() != size {
        return Err(Error::invalid_state(format!(
            "detailed status holds {} items but the array has {size}",
            current.array_status.detailed.items_count()
        )));
    }

    let mut next = ArrayStatus {
        summary: ArraySummary::new(),
        detailed: new_phases_array(size),
        retries: current.array_status.retries.clone(),
    };
    let mut errors = ErrorMessageCollector::new();
    let mut log_links = Vec::new();

    for index in 0..size {
        let existing = current.array_status.phase_at(index);
        let task = SubTask::new(inputs, index, current.array_status.retry_count(index));

        if existing.is_terminal() {
            task.deallocate().await?;
            next.record(index, existing);
            continue;
        }

        match task.launch().await? {
            LaunchResult::Success => {}
            LaunchResult::Waiting => {
                next.record(index, TaskPhase::WaitingForResources);
                continue;
            }
            LaunchResult::ReturnState { phase, reason } => {
                info!(index, %phase, %reason, "launch ended the round early");
                inputs.metrics.record_round(phase);
                let state = current.with_phase(phase, 0).with_reason(reason);
                return Ok(RoundOutcome {
                    changed: state != *previous,
                    state,
                    log_links,
                });
            }
        }

        task.monitor(&mut next, &mut errors, &mut log_links).await?;
    }

    if inputs.ctx.read_template().await?.is_none() {
        return Err(Error::task_template(
            "required value not set, task template is missing",
        ));
    }

    let phase = summary_to_phase(current.effective_min_successes(), &next.summary);
    inputs.metrics.set_subtask_counts(&next.summary);
    inputs.metrics.record_round(phase);

    let version = if phase == ArrayPhase::CheckingSubTaskExecutions {
        summary_version(&next.summary)
    } else {
        0
    };
    // Rebuild the persisted status in place so an unchanged round reports so.
    let mut status = current.array_status.clone();
    let mut changed = status.summary.merge_from(&next.summary);
    if status.detailed != next.detailed {
        status.detailed = next.detailed;
        changed = true;
    }
    if !previous.is_initialized() {
        changed = true;
    }

    let mut state = current.with_array_status(status).with_phase(phase, version);
    match phase {
        ArrayPhase::WriteToDiscoveryThenFail => {
            state = state.with_reason(errors.summary(inputs.config.max_error_string_length));
        }
        ArrayPhase::CheckingSubTaskExecutions => {
            state = state.with_reason(STILL_RUNNING_REASON);
        }
        _ => {}
    }

    changed |= state.current_phase != previous.current_phase
        || state.phase_version != previous.phase_version
        || state.reason != previous.reason;

    debug!(%phase, version, changed, failures = errors.len(), "round complete");
    Ok(RoundOutcome {
        state,
        log_links,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use fanout_core::{MemoryBackend, OutputPaths};

    use super::*;
    use crate::backend::pod::{PodPhase, PodStatus};
    use crate::backend::Backend;
    use crate::cluster::memory::InMemoryClusterClient;
    use crate::cluster::{ClusterError, ObjectKey, ObjectKind, ObjectStatus};
    use crate::config::{ArrayConfig, ResourceManagerConfig};
    use crate::context::{ArrayJob, InMemoryTaskContext, TaskTemplate};
    use crate::metrics::ArrayMetrics;
    use crate::resource::memory::InMemoryResourceManager;

    struct Fixture {
        config: ArrayConfig,
        ctx: InMemoryTaskContext,
        client: InMemoryClusterClient,
        resources: InMemoryResourceManager,
        metrics: ArrayMetrics,
    }

    impl Fixture {
        fn new(size: usize, config: ArrayConfig) -> Result<Self> {
            let ctx = InMemoryTaskContext::new(
                "exec",
                "ns",
                OutputPaths::new("mem://bucket/exec")?,
                Arc::new(MemoryBackend::new()),
            )
            .with_template(TaskTemplate {
                task_type: "container".into(),
                output_variables: vec!["x".into()],
                array: ArrayJob::new(size),
            });
            Ok(Self {
                config,
                ctx,
                client: InMemoryClusterClient::new(),
                resources: InMemoryResourceManager::with_default_limit(100),
                metrics: ArrayMetrics::new(),
            })
        }

        fn inputs(&self) -> RoundInputs<'_> {
            RoundInputs {
                config: &self.config,
                ctx: &self.ctx,
                client: &self.client,
                resources: &self.resources,
                backend: Backend::Pod,
                metrics: &self.metrics,
                now: Utc::now(),
            }
        }

        fn set_pod(&self, index: usize, phase: PodPhase) {
            let key = ObjectKey::new(ObjectKind::Pod, "ns", format!("exec-{index}"));
            self.client.set_status(
                &key,
                ObjectStatus::Pod(PodStatus {
                    phase,
                    ..PodStatus::default()
                }),
            );
        }
    }

    #[tokio::test]
    async fn first_round_launches_everything() -> Result<()> {
        let fx = Fixture::new(4, ArrayConfig::default())?;
        let state = ArrayState::new(4, 4).with_phase(ArrayPhase::CheckingSubTaskExecutions, 0);

        let outcome = launch_and_check_subtasks(&fx.inputs(), &state).await?;

        assert_eq!(fx.client.len(), 4);
        assert_eq!(outcome.state.array_status.summary.total(), 4);
        assert_eq!(outcome.state.array_status.summary.count(TaskPhase::Queued), 4);
        assert_eq!(
            outcome.state.current_phase,
            ArrayPhase::CheckingSubTaskExecutions
        );
        assert_eq!(outcome.state.reason, STILL_RUNNING_REASON);
        // Four subtasks at Queued (code 3).
        assert_eq!(outcome.state.phase_version, 12);
        Ok(())
    }

    #[tokio::test]
    async fn quiet_round_reports_no_change() -> Result<()> {
        let fx = Fixture::new(3, ArrayConfig::default())?;
        let first = launch_and_check_subtasks(&fx.inputs(), &ArrayState::new(3, 3)).await?;
        assert!(first.changed);

        let second = launch_and_check_subtasks(&fx.inputs(), &first.state).await?;
        assert!(!second.changed);
        assert_eq!(second.state, first.state);

        fx.set_pod(1, PodPhase::Running);
        let third = launch_and_check_subtasks(&fx.inputs(), &second.state).await?;
        assert!(third.changed);
        assert_eq!(third.state.array_status.summary.count(TaskPhase::Running), 1);
        assert_eq!(third.state.array_status.summary.count(TaskPhase::Queued), 2);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_array_fails_without_cluster_calls() -> Result<()> {
        let config = ArrayConfig {
            max_array_job_size: 3,
            ..ArrayConfig::default()
        };
        let fx = Fixture::new(4, config)?;
        let state = ArrayState::new(4, 4);

        let outcome = launch_and_check_subtasks(&fx.inputs(), &state).await?;

        assert_eq!(outcome.state.current_phase, ArrayPhase::PermanentFailure);
        assert_eq!(
            outcome.state.reason,
            "array size > max allowed. Requested [4]. Allowed [3]"
        );
        assert_eq!(fx.client.total_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn enough_successes_moves_to_discovery() -> Result<()> {
        let fx = Fixture::new(5, ArrayConfig::default())?;
        let state = ArrayState::new(5, 3);
        let state = launch_and_check_subtasks(&fx.inputs(), &state).await?.state;

        for index in 0..3 {
            fx.set_pod(index, PodPhase::Succeeded);
        }
        for index in 3..5 {
            fx.set_pod(index, PodPhase::Failed);
        }

        let outcome = launch_and_check_subtasks(&fx.inputs(), &state).await?;
        let summary = &outcome.state.array_status.summary;
        assert_eq!(summary.count(TaskPhase::Success), 3);
        assert_eq!(summary.count(TaskPhase::RetryableFailure), 2);
        assert_eq!(outcome.state.current_phase, ArrayPhase::WriteToDiscovery);
        assert_eq!(outcome.state.phase_version, 0);
        Ok(())
    }

    #[tokio::test]
    async fn too_many_failures_collects_reason() -> Result<()> {
        let fx = Fixture::new(3, ArrayConfig::default())?;
        let state = launch_and_check_subtasks(&fx.inputs(), &ArrayState::new(3, 3))
            .await?
            .state;
        fx.set_pod(0, PodPhase::Succeeded);
        fx.set_pod(1, PodPhase::Failed);

        let outcome = launch_and_check_subtasks(&fx.inputs(), &state).await?;
        assert_eq!(
            outcome.state.current_phase,
            ArrayPhase::WriteToDiscoveryThenFail
        );
        assert!(outcome.state.reason.starts_with("[1]: "));
        Ok(())
    }

    #[tokio::test]
    async fn terminal_indices_are_not_touched() -> Result<()> {
        let config = ArrayConfig {
            resource_manager: ResourceManagerConfig {
                primary_label: "pool".into(),
            },
            ..ArrayConfig::default()
        };
        let fx = Fixture::new(2, config)?;
        let state = launch_and_check_subtasks(&fx.inputs(), &ArrayState::new(2, 2))
            .await?
            .state;
        fx.set_pod(0, PodPhase::Succeeded);
        let state = launch_and_check_subtasks(&fx.inputs(), &state).await?.state;
        assert_eq!(state.array_status.phase_at(0), TaskPhase::Success);

        // Index 0 is gone from the cluster, but its recorded phase stands.
        fx.client
            .remove(&ObjectKey::new(ObjectKind::Pod, "ns", "exec-0"));
        let calls_before = fx.client.total_calls();
        let state = launch_and_check_subtasks(&fx.inputs(), &state).await?.state;
        let state = launch_and_check_subtasks(&fx.inputs(), &state).await?.state;

        assert_eq!(state.array_status.phase_at(0), TaskPhase::Success);
        // Only index 1 is launched and read each round.
        assert_eq!(fx.client.total_calls() - calls_before, 4);
        assert_eq!(fx.resources.release_count("pool", "exec-0")?, 1);
        assert!(fx.resources.is_held("pool", "exec-1")?);
        Ok(())
    }

    #[tokio::test]
    async fn failed_read_leaves_state_alone() -> Result<()> {
        let fx = Fixture::new(2, ArrayConfig::default())?;
        let state = launch_and_check_subtasks(&fx.inputs(), &ArrayState::new(2, 2))
            .await?
            .state;
        fx.client.fail_gets(
            "exec-1",
            ClusterError::Transient {
                message: "apiserver unavailable".into(),
            },
        );

        let result = launch_and_check_subtasks(&fx.inputs(), &state).await;
        assert!(matches!(
            result,
            Err(Error::CheckSubTaskStatus { index: 1, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_status_is_rejected() -> Result<()> {
        let fx = Fixture::new(3, ArrayConfig::default())?;
        let state = ArrayState::new(3, 3).with_array_status(ArrayStatus::new(2));

        let result = launch_and_check_subtasks(&fx.inputs(), &state).await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        Ok(())
    }
}
