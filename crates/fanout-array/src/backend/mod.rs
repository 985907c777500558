//! Workload backends for subtasks.
//!
//! Each array runs all of its subtasks on one backend, selected once from the
//! task template's type. A backend decides which object kind to submit and how
//! to translate that kind's observed status into a [`PhaseInfo`].

pub mod batch;
pub mod pod;
pub mod training;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cluster::{ClusterClient, ClusterError, ClusterObject, ObjectKey, ObjectKind, ObjectStatus};
use crate::error::{Error, Result};
use crate::phase::PhaseInfo;

/// Task types that run as a single pod.
pub const POD_TASK_TYPES: &[&str] = &["container", "python-task", "sidecar", "pod"];

/// Task types that run as a batch job.
pub const BATCH_TASK_TYPES: &[&str] = &["batch", "aws-batch"];

/// Task types that run as a distributed training job.
pub const TRAINING_TASK_TYPES: &[&str] = &["tensorflow", "pytorch", "mpi"];

/// Workload backend for an array's subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// One pod per subtask.
    Pod,
    /// One batch job per subtask.
    BatchJob,
    /// One training job per subtask.
    TrainingJob,
}

/// Result of checking one subtask object.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Translated phase.
    pub info: PhaseInfo,
    /// The object, if it still exists.
    pub object: Option<ClusterObject>,
}

impl Backend {
    /// Selects the backend for a task type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskTemplate`] for unsupported task types.
    pub fn for_task_type(task_type: &str) -> Result<Self> {
        if POD_TASK_TYPES.contains(&task_type) {
            Ok(Self::Pod)
        } else if BATCH_TASK_TYPES.contains(&task_type) {
            Ok(Self::BatchJob)
        } else if TRAINING_TASK_TYPES.contains(&task_type) {
            Ok(Self::TrainingJob)
        } else {
            Err(Error::task_template(format!(
                "unsupported task type for array execution: {task_type}"
            )))
        }
    }

    /// Returns the kind of object submitted for each subtask.
    #[must_use]
    pub const fn object_kind(self) -> ObjectKind {
        match self {
            Self::Pod => ObjectKind::Pod,
            Self::BatchJob => ObjectKind::BatchJob,
            Self::TrainingJob => ObjectKind::TrainingJob,
        }
    }

    /// Translates an observed object into a subtask phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the object's status does not belong
    /// to this backend.
    pub fn phase_info(
        self,
        object: &ClusterObject,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<PhaseInfo> {
        match (self, &object.status) {
            (Self::Pod, ObjectStatus::Pod(status)) => {
                Ok(pod::phase_info(object, status, now, timeout))
            }
            (Self::BatchJob, ObjectStatus::BatchJob(status)) => Ok(batch::phase_info(status, now)),
            (Self::TrainingJob, ObjectStatus::TrainingJob(status)) => {
                Ok(training::phase_info(status, now))
            }
            _ => Err(Error::invalid_state(format!(
                "object {} has a status of the wrong kind for the {self:?} backend",
                object.key
            ))),
        }
    }

    /// Reads a subtask object and translates its status.
    ///
    /// An object that has disappeared was deleted or garbage collected; it is
    /// reported as a system-attributed retryable failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckSubTaskStatus`] if the read fails for any other
    /// reason.
    pub async fn check_status(
        self,
        client: &dyn ClusterClient,
        index: usize,
        key: &ObjectKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Observation> {
        match client.get(key).await {
            Ok(object) => {
                let info = self.phase_info(&object, now, timeout)?;
                Ok(Observation {
                    info,
                    object: Some(object),
                })
            }
            Err(err @ ClusterError::NotFound { .. }) => Ok(Observation {
                info: PhaseInfo::system_retryable_failure(err.code(), err.to_string()).at(now),
                object: None,
            }),
            Err(err) => Err(Error::check_subtask_status(
                index,
                format!("failed to read {key}"),
                err,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryClusterClient;
    use crate::cluster::ObjectManifest;
    use crate::phase::{ErrorKind, TaskPhase};

    #[test]
    fn selects_backend_by_task_type() -> Result<()> {
        assert_eq!(Backend::for_task_type("container")?, Backend::Pod);
        assert_eq!(Backend::for_task_type("aws-batch")?, Backend::BatchJob);
        assert_eq!(Backend::for_task_type("pytorch")?, Backend::TrainingJob);
        assert!(matches!(
            Backend::for_task_type("hive"),
            Err(Error::TaskTemplate { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_object_is_system_failure() -> Result<()> {
        let client = InMemoryClusterClient::new();
        let key = ObjectKey::new(ObjectKind::Pod, "ns", "exec-0");

        let observed = Backend::Pod
            .check_status(&client, 0, &key, Utc::now(), Duration::ZERO)
            .await?;
        assert_eq!(observed.info.phase, TaskPhase::RetryableFailure);
        assert_eq!(observed.info.error.map(|e| e.kind), Some(ErrorKind::System));
        assert!(observed.object.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn transient_read_is_an_error() {
        let client = InMemoryClusterClient::new();
        let key = ObjectKey::new(ObjectKind::Pod, "ns", "exec-0");
        client.fail_gets(
            "exec-0",
            ClusterError::Transient {
                message: "timeout".into(),
            },
        );

        let result = Backend::Pod
            .check_status(&client, 0, &key, Utc::now(), Duration::ZERO)
            .await;
        assert!(matches!(
            result,
            Err(Error::CheckSubTaskStatus { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn mismatched_status_kind_is_invalid_state() -> Result<()> {
        let client = InMemoryClusterClient::new();
        let key = ObjectKey::new(ObjectKind::Pod, "ns", "exec-0");
        client
            .create(ObjectManifest::new(key.clone()))
            .await
            .map_err(|e| Error::submit_subtask(0, "create", e))?;

        let result = Backend::BatchJob
            .check_status(&client, 0, &key, Utc::now(), Duration::ZERO)
            .await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        Ok(())
    }
}
