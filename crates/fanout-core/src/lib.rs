//! # fanout-core
//!
//! Shared primitives for the fanout array-task engine.
//!
//! This crate provides the foundational types and traits used by the array engine:
//!
//! - **Storage**: Abstract object storage for subtask artifacts
//! - **Paths**: Typed output locations for a task and its subtasks
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use fanout_core::prelude::*;
//!
//! let paths = OutputPaths::new("s3://bucket/exec-1").unwrap();
//! assert_eq!(paths.subtask(2).outputs_path(), "s3://bucket/exec-1/2/outputs.json");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod observability;
pub mod paths;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use fanout_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::paths::OutputPaths;
    pub use crate::storage::{MemoryBackend, ObjectMeta, StorageBackend};
}

pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
pub use paths::OutputPaths;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend};
