//! Error types for the array engine.

/// The result type used throughout fanout-array.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort an array round or an engine operation.
///
/// Subtask failures are not errors: they are recorded as failure phases in the
/// array status. An `Error` means the round could not complete and the previous
/// persisted state must be kept.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating a subtask's cluster object failed.
    #[error("failed to submit subtask {index}: {message}")]
    SubmitSubTask {
        /// Subtask index.
        index: usize,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Reading a subtask's status failed.
    #[error("failed to check status of subtask {index}: {message}")]
    CheckSubTaskStatus {
        /// Subtask index.
        index: usize,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Deleting a subtask's cluster object failed.
    #[error("failed to delete subtask {index}: {message}")]
    DeleteSubTask {
        /// Subtask index.
        index: usize,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Releasing an admission-control token failed.
    #[error("failed to release resource token {token}: {message}")]
    ReleaseResource {
        /// The token that could not be released.
        token: String,
        /// Description of the failure.
        message: String,
    },

    /// The task template is missing or invalid.
    #[error("task template error: {message}")]
    TaskTemplate {
        /// Description of the problem.
        message: String,
    },

    /// The assembly work queue is in an inconsistent state.
    #[error("work queue error: {message}")]
    WorkQueue {
        /// Description of the problem.
        message: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The persisted array state is inconsistent.
    #[error("invalid array state: {message}")]
    InvalidState {
        /// Description of the inconsistency.
        message: String,
    },

    /// An error from fanout-core.
    #[error("core error: {0}")]
    Core(#[from] fanout_core::Error),
}

impl Error {
    /// Creates a subtask submission error with a source.
    #[must_use]
    pub fn submit_subtask(
        index: usize,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SubmitSubTask {
            index,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a subtask status error with a source.
    #[must_use]
    pub fn check_subtask_status(
        index: usize,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CheckSubTaskStatus {
            index,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a subtask deletion error with a source.
    #[must_use]
    pub fn delete_subtask(
        index: usize,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DeleteSubTask {
            index,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a task template error.
    #[must_use]
    pub fn task_template(message: impl Into<String>) -> Self {
        Self::TaskTemplate {
            message: message.into(),
        }
    }

    /// Creates a work queue error.
    #[must_use]
    pub fn work_queue(message: impl Into<String>) -> Self {
        Self::WorkQueue {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn submit_error_display_and_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "api timeout");
        let err = Error::submit_subtask(4, "create pod", source);
        let msg = err.to_string();
        assert!(msg.contains("subtask 4"));
        assert!(msg.contains("create pod"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_error_converts() {
        let err: Error = fanout_core::Error::NotFound("outputs.json".into()).into();
        assert!(err.to_string().contains("core error"));
    }

    #[test]
    fn serde_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
