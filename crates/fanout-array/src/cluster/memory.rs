//! In-memory cluster client implementation for testing.
//!
//! Objects are created with the initial status of their kind; tests drive them
//! forward with [`InMemoryClusterClient::set_status`] and inject failures with
//! [`InMemoryClusterClient::fail_creates`] and [`InMemoryClusterClient::fail_gets`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ClusterClient, ClusterError, ClusterObject, ObjectKey, ObjectManifest, ObjectStatus};

#[derive(Debug, Default)]
struct ClusterState {
    objects: HashMap<ObjectKey, ClusterObject>,
    create_failures: HashMap<String, ClusterError>,
    get_failures: HashMap<String, ClusterError>,
}

/// In-memory cluster client for testing.
#[derive(Debug, Default)]
pub struct InMemoryClusterClient {
    state: RwLock<ClusterState>,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

fn poison_err<T>(_: PoisonError<T>) -> ClusterError {
    ClusterError::Transient {
        message: "cluster client lock poisoned".into(),
    }
}

impl InMemoryClusterClient {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the status of an existing object.
    ///
    /// Returns false if the object does not exist.
    pub fn set_status(&self, key: &ObjectKey, status: ObjectStatus) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        state.objects.get_mut(key).is_some_and(|object| {
            object.status = status;
            true
        })
    }

    /// Overrides the creation time of an existing object.
    pub fn set_created_at(&self, key: &ObjectKey, created_at: DateTime<Utc>) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        state.objects.get_mut(key).is_some_and(|object| {
            object.created_at = created_at;
            true
        })
    }

    /// Removes an object without going through [`ClusterClient::delete`].
    pub fn remove(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.state.write().ok()?.objects.remove(key)
    }

    /// Makes every create of an object named `name` fail with `err`.
    pub fn fail_creates(&self, name: impl Into<String>, err: ClusterError) {
        if let Ok(mut state) = self.state.write() {
            state.create_failures.insert(name.into(), err);
        }
    }

    /// Makes every get of an object named `name` fail with `err`.
    pub fn fail_gets(&self, name: impl Into<String>, err: ClusterError) {
        if let Ok(mut state) = self.state.write() {
            state.get_failures.insert(name.into(), err);
        }
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.create_failures.clear();
            state.get_failures.clear();
        }
    }

    /// Returns a copy of an object, if present.
    #[must_use]
    pub fn object(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.state.read().ok()?.objects.get(key).cloned()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map_or(0, |state| state.objects.len())
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total calls to any client method.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.get_calls() + self.create_calls() + self.delete_calls()
    }

    /// Calls to [`ClusterClient::get`].
    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Calls to [`ClusterClient::create`].
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Calls to [`ClusterClient::delete`].
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for InMemoryClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<ClusterObject, ClusterError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().map_err(poison_err)?;

        if let Some(err) = state.get_failures.get(&key.name) {
            return Err(err.clone());
        }
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound { key: key.clone() })
    }

    async fn create(&self, manifest: ObjectManifest) -> Result<(), ClusterError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(err) = state.create_failures.get(&manifest.key.name) {
            return Err(err.clone());
        }
        if state.objects.contains_key(&manifest.key) {
            return Err(ClusterError::AlreadyExists { key: manifest.key });
        }

        let object = ClusterObject {
            status: ObjectStatus::initial(manifest.key.kind),
            key: manifest.key.clone(),
            labels: manifest.labels,
            created_at: Utc::now(),
        };
        state.objects.insert(manifest.key, object);
        drop(state);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().map_err(poison_err)?;
        let removed = state.objects.remove(key);
        drop(state);
        removed
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound { key: key.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ObjectKind;

    #[tokio::test]
    async fn create_get_delete() -> Result<(), ClusterError> {
        let client = InMemoryClusterClient::new();
        let key = ObjectKey::new(ObjectKind::Pod, "ns", "exec-0");

        client.create(ObjectManifest::new(key.clone())).await?;
        let object = client.get(&key).await?;
        assert_eq!(object.status, ObjectStatus::initial(ObjectKind::Pod));

        let dup = client.create(ObjectManifest::new(key.clone())).await;
        assert!(matches!(dup, Err(ClusterError::AlreadyExists { .. })));

        client.delete(&key).await?;
        assert!(matches!(
            client.get(&key).await,
            Err(ClusterError::NotFound { .. })
        ));
        assert_eq!(client.create_calls(), 2);
        assert_eq!(client.get_calls(), 2);
        assert_eq!(client.delete_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures() {
        let client = InMemoryClusterClient::new();
        let key = ObjectKey::new(ObjectKind::Pod, "ns", "exec-1");
        client.fail_creates(
            "exec-1",
            ClusterError::Transient {
                message: "etcd unavailable".into(),
            },
        );

        let result = client.create(ObjectManifest::new(key.clone())).await;
        assert!(matches!(result, Err(ClusterError::Transient { .. })));
        assert!(client.is_empty());

        client.clear_failures();
        assert!(client.create(ObjectManifest::new(key)).await.is_ok());
        assert_eq!(client.len(), 1);
    }
}
