//! Background assembly of an array's combined outputs and errors.
//!
//! Once every subtask is terminal, the per-subtask documents are merged into
//! one document at the array's output prefix. Merging reads one document per
//! subtask, so it runs on an [`IndexedWorkQueue`] and the poll only checks on
//! it:
//!
//! - the **output** worker builds, for every output variable, a collection with
//!   exactly one entry per subtask ([`Literal::None`] for subtasks that did not
//!   succeed);
//! - the **error** worker collects the error documents of failed subtasks into
//!   one truncated summary.

use std::sync::Arc;

use async_trait::async_trait;
use fanout_core::{OutputPaths, StorageBackend};
use tracing::{debug, info, warn};

use crate::compact::CompactArray;
use crate::config::WorkQueueConfig;
use crate::context::TaskExecutionContext;
use crate::error::{Error, Result};
use crate::error_collector::ErrorMessageCollector;
use crate::io::{self, ErrorDocument, Literal, LiteralMap};
use crate::metrics::ArrayMetrics;
use crate::phase::{ExecutionError, TaskPhase};
use crate::state::{ArrayPhase, ArrayState};
use crate::workqueue::{IndexedWorkQueue, Processor, WorkStatus};

/// Queue name of the output assembler.
pub const OUTPUTS_QUEUE: &str = "outputs";

/// Queue name of the error assembler.
pub const ERRORS_QUEUE: &str = "errors";

/// Error code attached to an array whose assembly job failed.
pub const ASSEMBLY_FAILED: &str = "AssemblyFailed";

/// One assembly job.
pub struct AssembleItem {
    /// Output prefix of the array.
    pub paths: OutputPaths,
    /// Output variable names, in template order.
    pub var_names: Vec<String>,
    /// Final phase code of every subtask.
    pub final_phases: CompactArray,
    /// Store holding the documents.
    pub store: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for AssembleItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssembleItem")
            .field("paths", &self.paths)
            .field("var_names", &self.var_names)
            .field("size", &self.final_phases.items_count())
            .finish_non_exhaustive()
    }
}

impl AssembleItem {
    fn phase_at(&self, index: usize) -> TaskPhase {
        TaskPhase::from_code(self.final_phases.get_item(index)).unwrap_or_default()
    }
}

/// What an assembler produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyKind {
    /// Combined outputs.
    Outputs,
    /// Combined error summary capped at `max_error_length` bytes.
    Errors {
        /// Summary cap.
        max_error_length: usize,
    },
}

/// [`Processor`] that assembles one kind of document.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyWorker {
    kind: AssemblyKind,
}

impl AssemblyWorker {
    /// What this worker produces.
    #[must_use]
    pub const fn kind(&self) -> AssemblyKind {
        self.kind
    }
}

#[async_trait]
impl Processor for AssemblyWorker {
    type Item = AssembleItem;

    async fn process(&self, item: &AssembleItem) -> Result<()> {
        match self.kind {
            AssemblyKind::Outputs => assemble_outputs(item).await,
            AssemblyKind::Errors { max_error_length } => {
                assemble_errors(item, max_error_length).await
            }
        }
    }
}

/// Work queue running an [`AssemblyWorker`].
pub type Assembler = IndexedWorkQueue<AssemblyWorker>;

/// Creates the output assembler.
#[must_use]
pub fn output_assembler(config: &WorkQueueConfig, metrics: ArrayMetrics) -> Assembler {
    IndexedWorkQueue::new(
        OUTPUTS_QUEUE,
        config.clone(),
        AssemblyWorker {
            kind: AssemblyKind::Outputs,
        },
        metrics,
    )
}

/// Creates the error assembler.
#[must_use]
pub fn error_assembler(
    max_error_length: usize,
    config: &WorkQueueConfig,
    metrics: ArrayMetrics,
) -> Assembler {
    IndexedWorkQueue::new(
        ERRORS_QUEUE,
        config.clone(),
        AssemblyWorker {
            kind: AssemblyKind::Errors { max_error_length },
        },
        metrics,
    )
}

/// Merges subtask outputs into one document at the array prefix.
///
/// # Errors
///
/// Returns an error if a document cannot be read or the result cannot be
/// written.
pub async fn assemble_outputs(item: &AssembleItem) -> Result<()> {
    let size = item.final_phases.items_count();
    let mut columns: Vec<Vec<Literal>> = item
        .var_names
        .iter()
        .map(|_| Vec::with_capacity(size))
        .collect();

    for index in 0..size {
        let outputs = if item.phase_at(index).is_success() {
            io::read_outputs(item.store.as_ref(), &item.paths.subtask(index)).await?
        } else {
            None
        };

        for (name, column) in item.var_names.iter().zip(&mut columns) {
            let value = outputs
                .as_ref()
                .and_then(|map| map.get(name))
                .cloned()
                .unwrap_or(Literal::None);
            column.push(value);
        }
    }

    let mut combined = LiteralMap::new();
    for (name, column) in item.var_names.iter().zip(columns) {
        combined.insert(name.clone(), Literal::Collection(column));
    }
    io::write_outputs(item.store.as_ref(), &item.paths, &combined).await?;
    debug!(prefix = %item.paths, size, "assembled outputs");
    Ok(())
}

/// Merges the error documents of failed subtasks into one error document at
/// the array prefix.
///
/// # Errors
///
/// Returns an error if a document cannot be read or the result cannot be
/// written.
pub async fn assemble_errors(item: &AssembleItem, max_error_length: usize) -> Result<()> {
    let mut collector = ErrorMessageCollector::new();
    for index in 0..item.final_phases.items_count() {
        if !item.phase_at(index).is_failure() {
            continue;
        }
        if let Some(document) =
            io::read_error(item.store.as_ref(), &item.paths.subtask(index)).await?
        {
            collector.collect(index, document.error.to_string());
        }
    }

    let message = if collector.is_empty() {
        String::new()
    } else {
        collector.summary(max_error_length)
    };
    let document = ErrorDocument {
        error: ExecutionError::user("ArrayTaskFailed", message),
        recoverable: false,
    };
    io::write_error(item.store.as_ref(), &item.paths, &document).await?;
    debug!(prefix = %item.paths, failures = collector.len(), "assembled errors");
    Ok(())
}

/// Drives the assembly step of an array one poll forward.
///
/// Queues the job on first call and returns the state unchanged until the job
/// is done. On success the array moves to `terminal_phase`; on failure it moves
/// to [`ArrayPhase::RetryableFailure`] with the job's error attached.
///
/// An output assembler with no output variables skips the job.
///
/// # Errors
///
/// Returns an error if the template is missing, the job cannot be queued, or
/// the assembled document cannot be read back.
#[tracing::instrument(
    skip_all,
    fields(queue = %assembler.name(), work_item = %ctx.generated_name())
)]
pub async fn assemble_final_outputs(
    assembler: &Assembler,
    ctx: &dyn TaskExecutionContext,
    terminal_phase: ArrayPhase,
    state: &ArrayState,
) -> Result<ArrayState> {
    let id = ctx.generated_name();
    let kind = assembler.processor().kind();

    let info = if let Some(info) = assembler.get(id)? {
        info
    } else {
        let template = ctx
            .read_template()
            .await?
            .ok_or_else(|| Error::task_template("required value not set, task template is missing"))?;

        if kind == AssemblyKind::Outputs && template.output_variables.is_empty() {
            debug!("no output variables to assemble");
            return Ok(state.clone().with_phase(terminal_phase, 0));
        }

        let queued = assembler.queue(
            id,
            AssembleItem {
                paths: ctx.output_paths().clone(),
                var_names: template.output_variables,
                final_phases: state.array_status.detailed.clone(),
                store: ctx.data_store(),
            },
        )?;
        if queued {
            info!("queued assembly job");
        }
        assembler.get(id)?.ok_or_else(|| {
            Error::work_queue(format!(
                "couldn't find work item [{id}] after immediately adding it"
            ))
        })?
    };

    match info.status {
        WorkStatus::NotDone => Ok(state.clone()),
        WorkStatus::Succeeded => {
            let store = ctx.data_store();
            match kind {
                AssemblyKind::Outputs => {
                    let outputs = io::read_outputs(store.as_ref(), ctx.output_paths())
                        .await?
                        .unwrap_or_default();
                    ctx.publish_outputs(outputs).await?;
                    Ok(state.clone().with_phase(terminal_phase, 0))
                }
                AssemblyKind::Errors { .. } => {
                    let document = io::read_error(store.as_ref(), ctx.output_paths()).await?;
                    Ok(failed_state(state, terminal_phase, document))
                }
            }
        }
        WorkStatus::Failed => {
            let message = info.error.unwrap_or_default();
            warn!(error = %message, "assembly job failed");
            Ok(state
                .clone()
                .with_phase(ArrayPhase::RetryableFailure, 0)
                .with_reason(message.clone())
                .with_execution_error(ExecutionError::system(ASSEMBLY_FAILED, message)))
        }
    }
}

/// Attaches the assembled error summary to a failing array.
///
/// Subtasks that failed at the cluster level never write an error document,
/// so an empty summary keeps the reason collected by the last round.
fn failed_state(
    state: &ArrayState,
    terminal_phase: ArrayPhase,
    document: Option<ErrorDocument>,
) -> ArrayState {
    let next = state.clone().with_phase(terminal_phase, 0);
    match document {
        Some(document) if !document.error.message.is_empty() => next
            .with_reason(document.error.message.clone())
            .with_execution_error(document.error),
        _ => {
            let error = ExecutionError::user("ArrayTaskFailed", &state.reason);
            next.with_execution_error(error)
        }
    }
}
