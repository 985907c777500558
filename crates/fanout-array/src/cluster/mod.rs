//! Cluster client contract for subtask workloads.
//!
//! This module provides:
//!
//! - [`ClusterClient`]: get/create/delete of namespaced workload objects
//! - [`ObjectManifest`] / [`ClusterObject`]: what is submitted and what is observed
//! - [`ClusterError`]: failure classes the engine reacts to differently
//! - [`memory::InMemoryClusterClient`]: In-memory client for tests
//!
//! Building the manifest for a subtask is the host's job; the engine only
//! names objects, submits them, and reads their status back.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::batch::BatchJobStatus;
use crate::backend::pod::PodStatus;
use crate::backend::training::TrainingJobStatus;

/// Label that marks a workload as running on preemptible capacity.
pub const INTERRUPTIBLE_LABEL: &str = "interruptible";

/// Kind of workload object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A single pod.
    Pod,
    /// A batch job.
    BatchJob,
    /// A distributed training job.
    TrainingJob,
}

impl ObjectKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::BatchJob => "batch_job",
            Self::TrainingJob => "training_job",
        }
    }
}

/// Namespaced identity of a workload object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Object kind.
    pub kind: ObjectKind,
    /// Namespace.
    pub namespace: String,
    /// Name, unique within kind and namespace.
    pub name: String,
}

impl ObjectKey {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_label(), self.namespace, self.name)
    }
}

/// Object submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectManifest {
    /// Identity.
    pub key: ObjectKey,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Workload specification, opaque to the engine.
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl ObjectManifest {
    /// Creates a manifest with no labels and an empty spec.
    #[must_use]
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            spec: serde_json::Value::Null,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the workload specification.
    #[must_use]
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }
}

/// Observed status of a workload object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum ObjectStatus {
    /// Pod status.
    Pod(PodStatus),
    /// Batch job status.
    BatchJob(BatchJobStatus),
    /// Training job status.
    TrainingJob(TrainingJobStatus),
}

impl ObjectStatus {
    /// Returns the initial status of a freshly created object of `kind`.
    #[must_use]
    pub fn initial(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Pod => Self::Pod(PodStatus::default()),
            ObjectKind::BatchJob => Self::BatchJob(BatchJobStatus::default()),
            ObjectKind::TrainingJob => Self::TrainingJob(TrainingJobStatus::default()),
        }
    }
}

/// A workload object as read back from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterObject {
    /// Identity.
    pub key: ObjectKey,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// When the cluster accepted the object.
    pub created_at: DateTime<Utc>,
    /// Observed status.
    pub status: ObjectStatus,
}

impl ClusterObject {
    /// Returns true if the object carries `interruptible=true`.
    #[must_use]
    pub fn is_interruptible(&self) -> bool {
        self.labels
            .get(INTERRUPTIBLE_LABEL)
            .is_some_and(|v| v == "true")
    }
}

/// Failure of a cluster call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("object not found: {key}")]
    NotFound {
        /// The missing object.
        key: ObjectKey,
    },

    /// An object with the same key already exists.
    #[error("object already exists: {key}")]
    AlreadyExists {
        /// The existing object.
        key: ObjectKey,
    },

    /// The cluster refused the request.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Refusal message from the cluster.
        message: String,
    },

    /// The request failed and may succeed later.
    #[error("transient cluster error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },
}

impl ClusterError {
    /// Returns true if this is a refusal because the namespace quota is used up.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::Forbidden { message } if message.contains("exceeded quota"))
    }

    /// Returns a short code for the failure class.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Forbidden { .. } => "Forbidden",
            Self::Transient { .. } => "Transient",
        }
    }
}

/// Client for workload objects.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple polling tasks.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Reads an object.
    async fn get(&self, key: &ObjectKey) -> Result<ClusterObject, ClusterError>;

    /// Creates an object.
    ///
    /// Returns [`ClusterError::AlreadyExists`] if the key is taken.
    async fn create(&self, manifest: ObjectManifest) -> Result<(), ClusterError>;

    /// Deletes an object.
    ///
    /// Returns [`ClusterError::NotFound`] if it does not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError>;
}
