//! Per-subtask driver.
//!
//! A [`SubTask`] handles one index of an array within one reconciliation
//! round: acquire an admission token and create the workload object
//! ([`SubTask::launch`]), read its status back ([`SubTask::monitor`]), and give
//! the token back once the index is terminal ([`SubTask::deallocate`]).
//!
//! Nothing here is cached between rounds. Every call is keyed by the subtask
//! name, so a round can be re-run from the last persisted state.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cluster::{ClusterClient, ClusterError, ObjectKey, INTERRUPTIBLE_LABEL};
use crate::config::ArrayConfig;
use crate::context::TaskExecutionContext;
use crate::error::{Error, Result};
use crate::error_collector::ErrorMessageCollector;
use crate::io;
use crate::metrics::ArrayMetrics;
use crate::phase::{PhaseInfo, TaskLog, TaskPhase};
use crate::resource::{ReleaseOutcome, ResourceManager};
use crate::state::{ArrayPhase, ArrayStatus};

/// Everything a round needs from outside the persisted state.
#[derive(Clone, Copy)]
pub struct RoundInputs<'a> {
    /// Engine configuration.
    pub config: &'a ArrayConfig,
    /// Host context of the array.
    pub ctx: &'a dyn TaskExecutionContext,
    /// Cluster the subtasks run on.
    pub client: &'a dyn ClusterClient,
    /// Admission control.
    pub resources: &'a dyn ResourceManager,
    /// Backend chosen from the task type.
    pub backend: Backend,
    /// Metrics recorder.
    pub metrics: &'a ArrayMetrics,
    /// Reference time for timeout checks.
    pub now: DateTime<Utc>,
}

/// Outcome of [`SubTask::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    /// The object exists; monitor it this round.
    Success,
    /// No admission token; try again next round.
    Waiting,
    /// End the round and move the whole array to `phase`.
    ReturnState {
        /// Array phase to move to.
        phase: ArrayPhase,
        /// Reason recorded on the array.
        reason: String,
    },
}

/// Returns the object name of subtask `index`.
///
/// Retried subtasks get a `-{retry}` suffix so each attempt is a fresh object.
#[must_use]
pub fn subtask_name(generated_name: &str, index: usize, retry: u64) -> String {
    if retry == 0 {
        format!("{generated_name}-{index}")
    } else {
        format!("{generated_name}-{index}-{retry}")
    }
}

/// One index of an array within a round.
pub struct SubTask<'a> {
    inputs: &'a RoundInputs<'a>,
    index: usize,
    name: String,
}

impl<'a> SubTask<'a> {
    /// Creates the driver for `index`, named after its retry count.
    #[must_use]
    pub fn new(inputs: &'a RoundInputs<'a>, index: usize, retry: u64) -> Self {
        Self {
            inputs,
            index,
            name: subtask_name(inputs.ctx.generated_name(), index, retry),
        }
    }

    /// Object name; also the admission token.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster key of the subtask object.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.inputs.backend.object_kind(),
            self.inputs.ctx.namespace(),
            &self.name,
        )
    }

    /// Acquires an admission token and creates the subtask object.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource manager fails, the host cannot build
    /// the manifest, or the create fails for a reason other than the object
    /// already existing or the cluster forbidding it.
    pub async fn launch(&self) -> Result<LaunchResult> {
        let inputs = self.inputs;
        let resource_config = &inputs.config.resource_manager;

        if resource_config.is_enabled() {
            let status = inputs
                .resources
                .allocate_resource(&resource_config.primary_label, &self.name)
                .await?;
            if !status.is_granted() {
                debug!(
                    index = self.index,
                    token = %self.name,
                    status = status.as_label(),
                    "subtask waiting for resources"
                );
                inputs.metrics.record_launch("waiting");
                return Ok(LaunchResult::Waiting);
            }
            inputs.metrics.record_launch("granted");
        }

        let key = self.key();
        let mut manifest = inputs.ctx.subtask_manifest(self.index, key.clone())?;
        if inputs.ctx.is_interruptible() {
            manifest = manifest.with_label(INTERRUPTIBLE_LABEL, "true");
        }

        match inputs.client.create(manifest).await {
            Ok(()) => {
                debug!(index = self.index, object = %key, "created subtask object");
                inputs.metrics.record_launch("created");
                Ok(LaunchResult::Success)
            }
            Err(ClusterError::AlreadyExists { .. }) => {
                inputs.metrics.record_launch("already_exists");
                Ok(LaunchResult::Success)
            }
            Err(err) if err.is_quota_exceeded() => {
                warn!(index = self.index, object = %key, error = %err, "namespace quota exceeded");
                inputs.metrics.record_launch("forbidden");
                Ok(LaunchResult::ReturnState {
                    phase: ArrayPhase::WaitingForResources,
                    reason: err.to_string(),
                })
            }
            Err(err @ ClusterError::Forbidden { .. }) => {
                warn!(index = self.index, object = %key, error = %err, "subtask creation forbidden");
                inputs.metrics.record_launch("forbidden");
                Ok(LaunchResult::ReturnState {
                    phase: ArrayPhase::RetryableFailure,
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(Error::submit_subtask(
                self.index,
                format!("failed to create {key}"),
                err,
            )),
        }
    }

    /// Reads the subtask's status and records it in `status`.
    ///
    /// Failure messages go to `errors`; log links for started subtasks go to
    /// `log_links`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status read or the error-document check fails.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range for `status`.
    pub async fn monitor(
        &self,
        status: &mut ArrayStatus,
        errors: &mut ErrorMessageCollector,
        log_links: &mut Vec<TaskLog>,
    ) -> Result<TaskPhase> {
        let inputs = self.inputs;
        let key = self.key();
        let observed = inputs
            .backend
            .check_status(
                inputs.client,
                self.index,
                &key,
                inputs.now,
                inputs.config.max_system_level_timeout,
            )
            .await?;
        let mut info = observed.info;

        if info.phase.is_success() {
            let store = inputs.ctx.data_store();
            let paths = inputs.ctx.output_paths().subtask(self.index);
            if io::has_error(store.as_ref(), &paths).await? {
                info = PhaseInfo::retryable_failure(
                    "SubtaskWroteError",
                    format!("{key} succeeded but wrote an error document"),
                )
                .at(inputs.now);
            }
        }

        if info.phase.is_failure() {
            errors.collect(self.index, info.describe());
        }

        if let (Some(object), Some(linker)) = (&observed.object, inputs.ctx.log_linker()) {
            if info.phase == TaskPhase::Running || info.phase.is_terminal() {
                log_links.extend(linker.log_links(object));
            }
        }

        debug!(index = self.index, object = %key, phase = %info.phase, "observed subtask");
        status.record(self.index, info.phase);
        Ok(info.phase)
    }

    /// Gives the subtask's admission token back.
    ///
    /// Releasing a token that is no longer held is a no-op, so this may be
    /// called every round once the index is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReleaseResource`] if the resource manager fails.
    pub async fn deallocate(&self) -> Result<()> {
        release_token(
            self.inputs.config,
            self.inputs.resources,
            self.inputs.metrics,
            &self.name,
        )
        .await
    }
}

/// Releases the admission token `token` if admission control is enabled.
///
/// # Errors
///
/// Returns [`Error::ReleaseResource`] if the resource manager fails.
pub async fn release_token(
    config: &ArrayConfig,
    resources: &dyn ResourceManager,
    metrics: &ArrayMetrics,
    token: &str,
) -> Result<()> {
    let resource_config = &config.resource_manager;
    if !resource_config.is_enabled() {
        return Ok(());
    }

    match resources
        .release_resource(&resource_config.primary_label, token)
        .await
    {
        Ok(ReleaseOutcome::Released) => {
            debug!(%token, "released resource token");
            metrics.record_release("released");
            Ok(())
        }
        Ok(ReleaseOutcome::NotHeld) => {
            metrics.record_release("not_held");
            Ok(())
        }
        Err(err) => Err(Error::ReleaseResource {
            token: token.to_string(),
            message: err.to_string(),
        }),
    }
}
