//! In-memory resource manager implementation for testing.
//!
//! This module provides [`InMemoryResourceManager`], a simple in-memory
//! implementation of the [`ResourceManager`] trait.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no cross-process coordination
//! - **Single-process only**: Tokens are not visible across process boundaries

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{AllocationStatus, ReleaseOutcome, ResourceManager};
use crate::error::{Error, Result};

/// State for a single namespace.
#[derive(Debug, Clone, Default)]
struct NamespaceState {
    limit: usize,
    held: HashSet<String>,
}

#[derive(Debug, Default)]
struct ManagerState {
    namespaces: HashMap<String, NamespaceState>,
    /// Effective releases per `(namespace, token)`.
    releases: HashMap<(String, String), usize>,
}

/// In-memory resource manager for testing.
///
/// ## Example
///
/// ```rust
/// use fanout_array::resource::memory::InMemoryResourceManager;
///
/// let manager = InMemoryResourceManager::with_limits([("gpu".to_string(), 2)]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryResourceManager {
    state: RwLock<ManagerState>,
    /// Limit applied to namespaces without an explicit one; `None` rejects them.
    default_limit: Option<usize>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Core(fanout_core::Error::storage(
        "resource manager lock poisoned",
    ))
}

impl InMemoryResourceManager {
    /// Creates a manager that rejects every namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager that admits unknown namespaces up to `limit` tokens.
    #[must_use]
    pub fn with_default_limit(limit: usize) -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            default_limit: Some(limit),
        }
    }

    /// Pre-configures limits for multiple namespaces.
    #[must_use]
    pub fn with_limits(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let namespaces = limits
            .into_iter()
            .map(|(namespace, limit)| {
                (
                    namespace,
                    NamespaceState {
                        limit,
                        held: HashSet::new(),
                    },
                )
            })
            .collect();

        Self {
            state: RwLock::new(ManagerState {
                namespaces,
                releases: HashMap::new(),
            }),
            default_limit: None,
        }
    }

    /// Returns the number of tokens held in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn held(&self, namespace: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.namespaces.get(namespace).map_or(0, |ns| ns.held.len()))
    }

    /// Returns true if `token` is held in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_held(&self, namespace: &str, token: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .namespaces
            .get(namespace)
            .is_some_and(|ns| ns.held.contains(token)))
    }

    /// Returns how many times `token` was actually released in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn release_count(&self, namespace: &str, token: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .releases
            .get(&(namespace.to_string(), token.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl ResourceManager for InMemoryResourceManager {
    async fn allocate_resource(&self, namespace: &str, token: &str) -> Result<AllocationStatus> {
        let mut state = self.state.write().map_err(poison_err)?;

        if !state.namespaces.contains_key(namespace) {
            let Some(limit) = self.default_limit else {
                return Ok(AllocationStatus::NamespaceQuotaExceeded);
            };
            state.namespaces.insert(
                namespace.to_string(),
                NamespaceState {
                    limit,
                    held: HashSet::new(),
                },
            );
        }

        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| Error::Core(fanout_core::Error::storage("namespace vanished")))?;

        let status = if ns.held.contains(token) {
            AllocationStatus::Granted
        } else if ns.held.len() < ns.limit {
            ns.held.insert(token.to_string());
            AllocationStatus::Granted
        } else {
            AllocationStatus::Exhausted
        };
        drop(state);
        Ok(status)
    }

    async fn release_resource(&self, namespace: &str, token: &str) -> Result<ReleaseOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;

        let removed = state
            .namespaces
            .get_mut(namespace)
            .is_some_and(|ns| ns.held.remove(token));
        if !removed {
            return Ok(ReleaseOutcome::NotHeld);
        }

        *state
            .releases
            .entry((namespace.to_string(), token.to_string()))
            .or_insert(0) += 1;
        drop(state);
        Ok(ReleaseOutcome::Released)
    }
}
