//! Admission control for subtask launches.
//!
//! This module provides:
//!
//! - [`ResourceManager`]: Trait for token-based admission control
//! - [`AllocationStatus`]: Outcome of a token request
//! - [`memory::InMemoryResourceManager`]: In-memory manager for tests and local runs
//!
//! A subtask must hold a token in the configured namespace before its cluster
//! object is created, and gives it back once its phase is terminal. Tokens are
//! keyed by the subtask's object name, so a repeated allocation for the same
//! subtask is idempotent.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

/// Result of a token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationStatus {
    /// The token is held.
    Granted,
    /// The namespace has no capacity left.
    Exhausted,
    /// The namespace is not allowed to allocate at all.
    NamespaceQuotaExceeded,
}

impl AllocationStatus {
    /// Returns true if the token is held.
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Exhausted => "exhausted",
            Self::NamespaceQuotaExceeded => "namespace_quota_exceeded",
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Result of a token release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseOutcome {
    /// The token was held and is now free.
    Released,
    /// The token was not held; nothing changed.
    NotHeld,
}

/// Token-based admission control.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so one manager can serve every array that
/// the host polls concurrently.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Requests `token` in `namespace`.
    ///
    /// Requesting a token that is already held returns
    /// [`AllocationStatus::Granted`] without consuming more capacity.
    async fn allocate_resource(&self, namespace: &str, token: &str) -> Result<AllocationStatus>;

    /// Gives `token` back to `namespace`.
    ///
    /// Releasing a token that is not held is not an error.
    async fn release_resource(&self, namespace: &str, token: &str) -> Result<ReleaseOutcome>;
}
