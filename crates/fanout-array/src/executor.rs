//! Array-level state machine.
//!
//! The host calls [`ArrayExecutor::handle`] on every poll with the last
//! persisted [`ArrayState`] and persists the returned one. Each call advances
//! the array by at most one phase:
//!
//! ```text
//! Start ─► CheckingSubTaskExecutions ◄─► WaitingForResources
//!                 │                 │
//!                 ▼                 ▼
//!         WriteToDiscovery   WriteToDiscoveryThenFail
//!                 │                 │
//!                 ▼                 ▼
//!       AssembleFinalOutput  AssembleFinalError
//!                 │                 │
//!                 ▼                 ▼
//!              Success       RetryableFailure
//! ```
//!
//! Any phase may also end in `PermanentFailure` or `RetryableFailure` when the
//! array cannot run at all.

use chrono::Utc;
use tracing::{debug, info};

use crate::assembler::{assemble_final_outputs, error_assembler, output_assembler, Assembler};
use crate::backend::Backend;
use crate::cluster::{ClusterClient, ClusterError, ObjectKey};
use crate::compact::CompactArray;
use crate::config::ArrayConfig;
use crate::context::{TaskExecutionContext, TaskTemplate};
use crate::driver::{release_token, subtask_name, RoundInputs};
use crate::error::{Error, Result};
use crate::metrics::ArrayMetrics;
use crate::phase::{PhaseInfo, TaskLog};
use crate::reconcile::launch_and_check_subtasks;
use crate::resource::ResourceManager;
use crate::state::{ArrayPhase, ArrayState};

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct Transition {
    /// State to persist.
    pub state: ArrayState,
    /// Log links of subtasks observed during the poll.
    pub log_links: Vec<TaskLog>,
    /// Phase to report to the host.
    pub phase_info: PhaseInfo,
    /// False when `state` equals the polled state; the host may skip persisting it.
    pub changed: bool,
}

/// Drives arrays through their phases.
///
/// One executor serves every array the host runs; the only state it keeps
/// across polls is its two assembly queues.
#[derive(Debug)]
pub struct ArrayExecutor {
    config: ArrayConfig,
    output_assembler: Assembler,
    error_assembler: Assembler,
    metrics: ArrayMetrics,
}

impl ArrayExecutor {
    /// Creates an executor. Call [`start`](Self::start) before the first poll
    /// that reaches assembly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(config: ArrayConfig) -> Result<Self> {
        config.validate()?;
        let metrics = ArrayMetrics::new();
        Ok(Self {
            output_assembler: output_assembler(&config.output_assembler, metrics.clone()),
            error_assembler: error_assembler(
                config.max_error_string_length,
                &config.error_assembler,
                metrics.clone(),
            ),
            config,
            metrics,
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &ArrayConfig {
        &self.config
    }

    /// Starts both assembly queues on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkQueue`] if the executor was already started.
    pub fn start(&self) -> Result<()> {
        self.output_assembler.start()?;
        self.error_assembler.start()?;
        Ok(())
    }

    /// Advances an array by one poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll has to be retried; the host keeps `state`.
    #[tracing::instrument(
        skip_all,
        fields(execution = %ctx.generated_name(), phase = %state.current_phase)
    )]
    pub async fn handle(
        &self,
        ctx: &dyn TaskExecutionContext,
        client: &dyn ClusterClient,
        resources: &dyn ResourceManager,
        state: &ArrayState,
    ) -> Result<Transition> {
        let mut round_changed = None;
        let (next, log_links) = match state.current_phase {
            ArrayPhase::Start => (self.initialize(ctx, state).await?, Vec::new()),

            ArrayPhase::WaitingForResources | ArrayPhase::CheckingSubTaskExecutions => {
                let template = read_template(ctx).await?;
                let inputs = RoundInputs {
                    config: &self.config,
                    ctx,
                    client,
                    resources,
                    backend: Backend::for_task_type(&template.task_type)?,
                    metrics: &self.metrics,
                    now: Utc::now(),
                };
                let outcome = launch_and_check_subtasks(&inputs, state).await?;
                round_changed = Some(outcome.changed);
                (outcome.state, outcome.log_links)
            }

            ArrayPhase::WriteToDiscovery => {
                self.release_all(ctx, resources, state).await?;
                (
                    state.clone().with_phase(ArrayPhase::AssembleFinalOutput, 0),
                    Vec::new(),
                )
            }

            ArrayPhase::WriteToDiscoveryThenFail => {
                self.release_all(ctx, resources, state).await?;
                (
                    state.clone().with_phase(ArrayPhase::AssembleFinalError, 0),
                    Vec::new(),
                )
            }

            ArrayPhase::AssembleFinalOutput => (
                assemble_final_outputs(&self.output_assembler, ctx, ArrayPhase::Success, state)
                    .await?,
                Vec::new(),
            ),

            ArrayPhase::AssembleFinalError => (
                assemble_final_outputs(
                    &self.error_assembler,
                    ctx,
                    ArrayPhase::RetryableFailure,
                    state,
                )
                .await?,
                Vec::new(),
            ),

            ArrayPhase::Success | ArrayPhase::RetryableFailure | ArrayPhase::PermanentFailure => {
                (state.clone(), Vec::new())
            }
        };

        // Terminal phases are returned unchanged later, so tokens go back now.
        if next.current_phase.is_terminal() && !state.current_phase.is_terminal() {
            self.release_all(ctx, resources, &next).await?;
        }

        if next.current_phase != state.current_phase {
            info!(
                from = %state.current_phase,
                to = %next.current_phase,
                reason = %next.reason,
                "array phase changed"
            );
        }

        let changed = round_changed.unwrap_or_else(|| next != *state);
        let phase_info = next.to_phase_info().with_logs(log_links.clone());
        Ok(Transition {
            state: next,
            log_links,
            phase_info,
            changed,
        })
    }

    /// Stops an array: deletes every subtask object that is not terminal and
    /// releases every admission token.
    ///
    /// Objects that are already gone are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete or release fails; calling again is safe.
    #[tracing::instrument(skip_all, fields(execution = %ctx.generated_name()))]
    pub async fn abort(
        &self,
        ctx: &dyn TaskExecutionContext,
        client: &dyn ClusterClient,
        resources: &dyn ResourceManager,
        state: &ArrayState,
    ) -> Result<()> {
        let template = read_template(ctx).await?;
        let kind = Backend::for_task_type(&template.task_type)?.object_kind();

        for index in 0..state.execution_array_size {
            if state.is_initialized() && state.array_status.phase_at(index).is_terminal() {
                continue;
            }
            let name = subtask_name(
                ctx.generated_name(),
                index,
                state.array_status.retry_count(index),
            );
            let key = ObjectKey::new(kind, ctx.namespace(), name);
            match client.delete(&key).await {
                Ok(()) => debug!(index, object = %key, "deleted subtask object"),
                Err(ClusterError::NotFound { .. }) => {}
                Err(err) => {
                    return Err(Error::delete_subtask(
                        index,
                        format!("failed to delete {key}"),
                        err,
                    ))
                }
            }
        }

        self.release_all(ctx, resources, state).await
    }

    /// Releases every admission token of an array.
    ///
    /// # Errors
    ///
    /// Returns an error if a release fails; calling again is safe.
    #[tracing::instrument(skip_all, fields(execution = %ctx.generated_name()))]
    pub async fn finalize(
        &self,
        ctx: &dyn TaskExecutionContext,
        resources: &dyn ResourceManager,
        state: &ArrayState,
    ) -> Result<()> {
        self.release_all(ctx, resources, state).await
    }

    async fn initialize(
        &self,
        ctx: &dyn TaskExecutionContext,
        state: &ArrayState,
    ) -> Result<ArrayState> {
        let template = read_template(ctx).await?;
        if let Err(err) = Backend::for_task_type(&template.task_type) {
            return Ok(state
                .clone()
                .with_phase(ArrayPhase::PermanentFailure, 0)
                .with_reason(err.to_string()));
        }

        let size = template.array.size;
        let mut next = ArrayState::new(size, template.array.min_successes());
        next.array_status.retries = CompactArray::new(size, u64::from(self.config.max_retries));
        debug!(
            size,
            min_successes = next.original_min_successes,
            "initialized array"
        );
        Ok(next.with_phase(ArrayPhase::CheckingSubTaskExecutions, 0))
    }

    async fn release_all(
        &self,
        ctx: &dyn TaskExecutionContext,
        resources: &dyn ResourceManager,
        state: &ArrayState,
    ) -> Result<()> {
        if !self.config.resource_manager.is_enabled() {
            return Ok(());
        }
        for index in 0..state.execution_array_size {
            let name = subtask_name(
                ctx.generated_name(),
                index,
                state.array_status.retry_count(index),
            );
            release_token(&self.config, resources, &self.metrics, &name).await?;
        }
        Ok(())
    }
}

async fn read_template(ctx: &dyn TaskExecutionContext) -> Result<TaskTemplate> {
    ctx.read_template()
        .await?
        .ok_or_else(|| Error::task_template("required value not set, task template is missing"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fanout_core::{MemoryBackend, OutputPaths};

    use super::*;
    use crate::cluster::memory::InMemoryClusterClient;
    use crate::context::{ArrayJob, InMemoryTaskContext};
    use crate::phase::TaskPhase;
    use crate::resource::memory::InMemoryResourceManager;

    fn context(task_type: &str, size: usize) -> Result<InMemoryTaskContext> {
        Ok(InMemoryTaskContext::new(
            "exec",
            "ns",
            OutputPaths::new("mem://bucket/exec")?,
            Arc::new(MemoryBackend::new()),
        )
        .with_template(TaskTemplate {
            task_type: task_type.into(),
            output_variables: vec![],
            array: ArrayJob::new(size),
        }))
    }

    #[tokio::test]
    async fn start_initializes_sizes_and_retries() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = context("container", 3)?;
        let client = InMemoryClusterClient::new();
        let resources = InMemoryResourceManager::new();

        let transition = executor
            .handle(&ctx, &client, &resources, &ArrayState::default())
            .await?;

        let state = transition.state;
        assert_eq!(state.current_phase, ArrayPhase::CheckingSubTaskExecutions);
        assert_eq!(state.execution_array_size, 3);
        assert_eq!(state.original_min_successes, 3);
        assert_eq!(state.array_status.retries.items_count(), 3);
        assert_eq!(state.array_status.retries.max_value(), 15);
        assert!(client.is_empty());
        assert_eq!(transition.phase_info.phase, TaskPhase::Running);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_task_type_fails_permanently() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = context("hive", 3)?;

        let transition = executor
            .handle(
                &ctx,
                &InMemoryClusterClient::new(),
                &InMemoryResourceManager::new(),
                &ArrayState::default(),
            )
            .await?;
        assert_eq!(transition.state.current_phase, ArrayPhase::PermanentFailure);
        assert_eq!(transition.phase_info.phase, TaskPhase::PermanentFailure);
        Ok(())
    }

    #[tokio::test]
    async fn missing_template_is_an_error() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = InMemoryTaskContext::new(
            "exec",
            "ns",
            OutputPaths::new("mem://bucket/exec")?,
            Arc::new(MemoryBackend::new()),
        );

        let result = executor
            .handle(
                &ctx,
                &InMemoryClusterClient::new(),
                &InMemoryResourceManager::new(),
                &ArrayState::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::TaskTemplate { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn terminal_states_are_returned_unchanged() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = context("container", 1)?;
        let client = InMemoryClusterClient::new();
        let resources = InMemoryResourceManager::new();

        for phase in [
            ArrayPhase::Success,
            ArrayPhase::RetryableFailure,
            ArrayPhase::PermanentFailure,
        ] {
            let state = ArrayState::new(1, 1).with_phase(phase, 0).with_reason("done");
            let transition = executor.handle(&ctx, &client, &resources, &state).await?;
            assert_eq!(transition.state, state);
            assert!(!transition.changed);
        }
        assert_eq!(client.total_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn discovery_moves_to_assembly() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = context("container", 1)?;
        let client = InMemoryClusterClient::new();
        let resources = InMemoryResourceManager::new();

        let state = ArrayState::new(1, 1).with_phase(ArrayPhase::WriteToDiscovery, 0);
        let next = executor.handle(&ctx, &client, &resources, &state).await?.state;
        assert_eq!(next.current_phase, ArrayPhase::AssembleFinalOutput);

        let state = ArrayState::new(1, 1).with_phase(ArrayPhase::WriteToDiscoveryThenFail, 0);
        let next = executor.handle(&ctx, &client, &resources, &state).await?.state;
        assert_eq!(next.current_phase, ArrayPhase::AssembleFinalError);
        Ok(())
    }

    #[tokio::test]
    async fn no_output_variables_skip_assembly() -> Result<()> {
        let executor = ArrayExecutor::new(ArrayConfig::default())?;
        let ctx = context("container", 1)?;

        let state = ArrayState::new(1, 1).with_phase(ArrayPhase::AssembleFinalOutput, 0);
        let transition = executor
            .handle(
                &ctx,
                &InMemoryClusterClient::new(),
                &InMemoryResourceManager::new(),
                &state,
            )
            .await?;
        assert_eq!(transition.state.current_phase, ArrayPhase::Success);
        assert_eq!(transition.phase_info.phase, TaskPhase::Success);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ArrayConfig {
            max_error_string_length: 0,
            ..ArrayConfig::default()
        };
        assert!(matches!(
            ArrayExecutor::new(config),
            Err(Error::Configuration { .. })
        ));
    }
}
