//! Host-provided execution context for one array task.
//!
//! The engine never builds workload manifests, formats log URLs, or decides
//! where outputs go on its own; all of that comes from the
//! [`TaskExecutionContext`] the host passes into every poll.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use fanout_core::{OutputPaths, StorageBackend};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterObject, ObjectKey, ObjectManifest};
use crate::error::{Error, Result};
use crate::io::LiteralMap;
use crate::phase::TaskLog;

/// Array sizing taken from the task template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayJob {
    /// Number of subtasks.
    pub size: usize,
    /// Absolute number of subtasks that must succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_successes: Option<i64>,
    /// Fraction of subtasks that must succeed; used when `min_successes` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_success_ratio: Option<f64>,
}

impl ArrayJob {
    /// Creates a job where every subtask must succeed.
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            min_successes: None,
            min_success_ratio: None,
        }
    }

    /// Required successes.
    ///
    /// `min_successes` wins over `min_success_ratio`; with neither, all
    /// subtasks must succeed. Ratios round up.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn min_successes(&self) -> i64 {
        let size = i64::try_from(self.size).unwrap_or(i64::MAX);
        match (self.min_successes, self.min_success_ratio) {
            (Some(min), _) => min,
            (None, Some(ratio)) => {
                let ratio = ratio.clamp(0.0, 1.0);
                (size as f64 * ratio).ceil() as i64
            }
            (None, None) => size,
        }
    }
}

/// The parts of a task template the engine reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Task type; selects the backend.
    pub task_type: String,
    /// Names of the task's output variables.
    #[serde(default)]
    pub output_variables: Vec<String>,
    /// Array sizing.
    pub array: ArrayJob,
}

/// Produces log links for a running or finished subtask.
pub trait LogLinker: Send + Sync {
    /// Returns links for `object`.
    fn log_links(&self, object: &ClusterObject) -> Vec<TaskLog>;
}

/// Everything the engine needs from the host for one array task.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; the context is shared with the
/// assembly workers through the data store it hands out.
#[async_trait]
pub trait TaskExecutionContext: Send + Sync {
    /// Unique generated name of this execution. Subtask objects and assembly
    /// jobs are named after it.
    fn generated_name(&self) -> &str;

    /// Namespace subtask objects are created in.
    fn namespace(&self) -> &str;

    /// Reads the task template, or `None` if the host has none.
    async fn read_template(&self) -> Result<Option<TaskTemplate>>;

    /// Output location of the array as a whole. Subtask `i` writes under
    /// `output_paths().subtask(i)`.
    fn output_paths(&self) -> &OutputPaths;

    /// Blob store holding input and output documents.
    fn data_store(&self) -> Arc<dyn StorageBackend>;

    /// Builds the manifest for subtask `index`, to be created under `key`.
    fn subtask_manifest(&self, index: usize, key: ObjectKey) -> Result<ObjectManifest>;

    /// Whether subtasks may run on preemptible capacity.
    fn is_interruptible(&self) -> bool {
        false
    }

    /// Log link generator, if the host has one.
    fn log_linker(&self) -> Option<&dyn LogLinker> {
        None
    }

    /// Hands the assembled outputs of the array to the host.
    async fn publish_outputs(&self, outputs: LiteralMap) -> Result<()>;
}

/// Log linker that points at `{base_url}/{namespace}/{name}`.
#[derive(Debug, Clone)]
pub struct StaticLogLinker {
    name: String,
    base_url: String,
}

impl StaticLogLinker {
    /// Creates a linker producing links named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl LogLinker for StaticLogLinker {
    fn log_links(&self, object: &ClusterObject) -> Vec<TaskLog> {
        vec![TaskLog {
            name: self.name.clone(),
            uri: format!(
                "{}/{}/{}",
                self.base_url, object.key.namespace, object.key.name
            ),
        }]
    }
}

/// In-memory context for tests and local runs.
///
/// Published outputs are kept and can be inspected with
/// [`InMemoryTaskContext::published`].
pub struct InMemoryTaskContext {
    generated_name: String,
    namespace: String,
    template: RwLock<Option<TaskTemplate>>,
    output_paths: OutputPaths,
    store: Arc<dyn StorageBackend>,
    interruptible: bool,
    log_linker: Option<Box<dyn LogLinker>>,
    published: RwLock<Vec<LiteralMap>>,
}

impl std::fmt::Debug for InMemoryTaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTaskContext")
            .field("generated_name", &self.generated_name)
            .field("namespace", &self.namespace)
            .field("output_paths", &self.output_paths)
            .field("interruptible", &self.interruptible)
            .finish_non_exhaustive()
    }
}

impl InMemoryTaskContext {
    /// Creates a context without a template.
    #[must_use]
    pub fn new(
        generated_name: impl Into<String>,
        namespace: impl Into<String>,
        output_paths: OutputPaths,
        store: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            generated_name: generated_name.into(),
            namespace: namespace.into(),
            template: RwLock::new(None),
            output_paths,
            store,
            interruptible: false,
            log_linker: None,
            published: RwLock::new(Vec::new()),
        }
    }

    /// Sets the template.
    #[must_use]
    pub fn with_template(mut self, template: TaskTemplate) -> Self {
        self.template = RwLock::new(Some(template));
        self
    }

    /// Marks subtasks as interruptible.
    #[must_use]
    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Sets the log linker.
    #[must_use]
    pub fn with_log_linker(mut self, linker: impl LogLinker + 'static) -> Self {
        self.log_linker = Some(Box::new(linker));
        self
    }

    /// Replaces or removes the template.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_template(&self, template: Option<TaskTemplate>) -> Result<()> {
        let mut guard = self.template.write().map_err(poison_err)?;
        *guard = template;
        drop(guard);
        Ok(())
    }

    /// Returns every output map published so far, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<LiteralMap>> {
        let guard = self.published.read().map_err(poison_err)?;
        Ok(guard.clone())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::invalid_state("task context lock poisoned")
}

#[async_trait]
impl TaskExecutionContext for InMemoryTaskContext {
    fn generated_name(&self) -> &str {
        &self.generated_name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn read_template(&self) -> Result<Option<TaskTemplate>> {
        let guard = self.template.read().map_err(poison_err)?;
        Ok(guard.clone())
    }

    fn output_paths(&self) -> &OutputPaths {
        &self.output_paths
    }

    fn data_store(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.store)
    }

    fn subtask_manifest(&self, index: usize, key: ObjectKey) -> Result<ObjectManifest> {
        Ok(ObjectManifest::new(key).with_spec(serde_json::json!({
            "arrayIndex": index,
            "outputPrefix": self.output_paths.subtask(index).prefix(),
        })))
    }

    fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    fn log_linker(&self) -> Option<&dyn LogLinker> {
        self.log_linker.as_deref()
    }

    async fn publish_outputs(&self, outputs: LiteralMap) -> Result<()> {
        let mut guard = self.published.write().map_err(poison_err)?;
        guard.push(outputs);
        drop(guard);
        Ok(())
    }
}
