//! Blob storage for subtask artifacts.
//!
//! Subtasks write their outputs and error documents to object storage under a
//! per-subtask prefix. The array engine reads those documents back, checks
//! whether an error document exists, and writes the assembled documents at the
//! array prefix. Writes replace whatever is stored at the path, so a retried
//! assembly job overwrites its previous attempt.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// When the object was last written.
    pub last_modified: DateTime<Utc>,
}

/// Artifact store shared by subtasks and the engine.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns [`Error::NotFound`] if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object, replacing any previous content.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Reads object metadata without the content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "storage lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poison_err)?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        drop(objects);
        Ok(())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() -> Result<()> {
        let backend = MemoryBackend::new();
        let data = Bytes::from(r#"{"literals":{}}"#);

        backend.put("run/0/outputs.json", data.clone()).await?;
        assert_eq!(backend.get("run/0/outputs.json").await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn put_replaces_previous_content() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put("run/error.json", Bytes::from("first")).await?;
        backend.put("run/error.json", Bytes::from("second")).await?;

        assert_eq!(backend.get("run/error.json").await?, Bytes::from("second"));
        assert_eq!(backend.len()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get("run/7/error.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn head_reports_size() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put("run/1/error.json", Bytes::from("data")).await?;

        let meta = backend
            .head("run/1/error.json")
            .await?
            .expect("object should exist");
        assert_eq!(meta.path, "run/1/error.json");
        assert_eq!(meta.size, 4);

        assert!(backend.head("run/2/error.json").await?.is_none());
        Ok(())
    }
}
