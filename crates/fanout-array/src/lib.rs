//! # fanout-array
//!
//! Resumable execution engine for array tasks: one logical task fanned out
//! into N independently scheduled subtasks on a cluster.
//!
//! This crate provides:
//!
//! - **Launch and monitor**: per-subtask admission control, object creation,
//!   and status translation for pod, batch-job and training-job backends
//! - **Reconciliation**: a round function from the persisted array state to the
//!   next one, with a compact per-index status and a phase summary
//! - **Assembly**: background merging of subtask outputs and errors on an
//!   indexed work queue
//! - **Executor**: the array-level phase machine the host polls
//!
//! ## Guarantees
//!
//! - **Resumable**: every poll is a function of the persisted [`ArrayState`]
//!   and external inputs; nothing is cached between polls
//! - **All or nothing**: a round that fails returns an error and the previous
//!   state stays in force
//! - **Bounded**: admission tokens are released once per index, and error
//!   summaries are capped
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fanout_array::prelude::*;
//! use fanout_core::{MemoryBackend, OutputPaths};
//!
//! # async fn run() -> fanout_array::error::Result<()> {
//! let executor = ArrayExecutor::new(ArrayConfig::default())?;
//! executor.start()?;
//!
//! let ctx = InMemoryTaskContext::new(
//!     "exec-1",
//!     "default",
//!     OutputPaths::new("s3://bucket/exec-1")?,
//!     Arc::new(MemoryBackend::new()),
//! )
//! .with_template(TaskTemplate {
//!     task_type: "container".into(),
//!     output_variables: vec!["result".into()],
//!     array: ArrayJob::new(10),
//! });
//! let client = InMemoryClusterClient::new();
//! let resources = InMemoryResourceManager::new();
//!
//! let mut state = ArrayState::default();
//! while !state.current_phase.is_terminal() {
//!     state = executor.handle(&ctx, &client, &resources, &state).await?.state;
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod assembler;
pub mod backend;
pub mod cluster;
pub mod compact;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod error_collector;
pub mod executor;
pub mod io;
pub mod metrics;
pub mod phase;
pub mod reconcile;
pub mod resource;
pub mod state;
pub mod summary;
pub mod workqueue;

pub use state::ArrayState;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::assembler::{AssembleItem, Assembler, AssemblyKind};
    pub use crate::backend::Backend;
    pub use crate::cluster::memory::InMemoryClusterClient;
    pub use crate::cluster::{ClusterClient, ClusterError, ClusterObject, ObjectKey, ObjectKind};
    pub use crate::compact::CompactArray;
    pub use crate::config::{ArrayConfig, ResourceManagerConfig, WorkQueueConfig};
    pub use crate::context::{
        ArrayJob, InMemoryTaskContext, LogLinker, TaskExecutionContext, TaskTemplate,
    };
    pub use crate::error::{Error, Result};
    pub use crate::error_collector::ErrorMessageCollector;
    pub use crate::executor::{ArrayExecutor, Transition};
    pub use crate::io::{ErrorDocument, Literal, LiteralMap};
    pub use crate::metrics::ArrayMetrics;
    pub use crate::phase::{ExecutionError, PhaseInfo, TaskLog, TaskPhase};
    pub use crate::reconcile::{launch_and_check_subtasks, RoundOutcome};
    pub use crate::resource::memory::InMemoryResourceManager;
    pub use crate::resource::{AllocationStatus, ResourceManager};
    pub use crate::state::{ArrayPhase, ArrayState, ArrayStatus};
    pub use crate::summary::ArraySummary;
    pub use crate::workqueue::{IndexedWorkQueue, Processor, WorkItemInfo, WorkStatus};
}
