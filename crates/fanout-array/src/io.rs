//! Output and error documents exchanged through blob storage.
//!
//! Each subtask writes an [`OUTPUTS_FILE`](fanout_core::paths::OUTPUTS_FILE)
//! holding a [`LiteralMap`] or an [`ERROR_FILE`](fanout_core::paths::ERROR_FILE)
//! holding an [`ErrorDocument`] under its own output prefix.

use std::collections::BTreeMap;

use bytes::Bytes;
use fanout_core::{OutputPaths, StorageBackend};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::phase::ExecutionError;

/// A typed value produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    /// Absent value; used as a placeholder for subtasks that produced nothing.
    None,
    /// A single value.
    Scalar(serde_json::Value),
    /// An ordered collection of values.
    Collection(Vec<Literal>),
}

impl Literal {
    /// Returns the items if this is a collection.
    #[must_use]
    pub fn as_collection(&self) -> Option<&[Self]> {
        match self {
            Self::Collection(items) => Some(items),
            _ => None,
        }
    }
}

/// Named outputs of a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiteralMap {
    /// Values by variable name.
    pub literals: BTreeMap<String, Literal>,
}

impl LiteralMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Literal> {
        self.literals.get(name)
    }

    /// Sets the value of `name`.
    pub fn insert(&mut self, name: impl Into<String>, literal: Literal) {
        self.literals.insert(name.into(), literal);
    }
}

/// Failure written by a task instead of (or alongside) its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument {
    /// The failure.
    pub error: ExecutionError,
    /// Whether a retry may succeed.
    #[serde(default)]
    pub recoverable: bool,
}

/// Reads the outputs document under `paths`, or `None` if it does not exist.
///
/// # Errors
///
/// Returns an error if storage fails or the document cannot be parsed.
pub async fn read_outputs(
    store: &dyn StorageBackend,
    paths: &OutputPaths,
) -> Result<Option<LiteralMap>> {
    read_json(store, &paths.outputs_path()).await
}

/// Reads the error document under `paths`, or `None` if it does not exist.
///
/// # Errors
///
/// Returns an error if storage fails or the document cannot be parsed.
pub async fn read_error(
    store: &dyn StorageBackend,
    paths: &OutputPaths,
) -> Result<Option<ErrorDocument>> {
    read_json(store, &paths.error_path()).await
}

/// Returns true if an error document exists under `paths`.
///
/// # Errors
///
/// Returns an error if storage fails.
pub async fn has_error(store: &dyn StorageBackend, paths: &OutputPaths) -> Result<bool> {
    Ok(store.head(&paths.error_path()).await?.is_some())
}

/// Writes the outputs document under `paths`, replacing any previous one.
///
/// # Errors
///
/// Returns an error if serialization or storage fails.
pub async fn write_outputs(
    store: &dyn StorageBackend,
    paths: &OutputPaths,
    outputs: &LiteralMap,
) -> Result<()> {
    write_json(store, &paths.outputs_path(), outputs).await
}

/// Writes the error document under `paths`, replacing any previous one.
///
/// # Errors
///
/// Returns an error if serialization or storage fails.
pub async fn write_error(
    store: &dyn StorageBackend,
    paths: &OutputPaths,
    error: &ErrorDocument,
) -> Result<()> {
    write_json(store, &paths.error_path(), error).await
}

async fn read_json<T: serde::de::DeserializeOwned>(
    store: &dyn StorageBackend,
    path: &str,
) -> Result<Option<T>> {
    match store.get(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_json<T: Serialize>(store: &dyn StorageBackend, path: &str, value: &T) -> Result<()> {
    let data = Bytes::from(serde_json::to_vec(value)?);
    store.put(path, data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::MemoryBackend;

    #[tokio::test]
    async fn missing_documents_read_as_none() -> Result<()> {
        let store = MemoryBackend::new();
        let paths = OutputPaths::new("runs/exec-1/0")?;
        assert!(read_outputs(&store, &paths).await?.is_none());
        assert!(read_error(&store, &paths).await?.is_none());
        assert!(!has_error(&store, &paths).await?);
        Ok(())
    }

    #[tokio::test]
    async fn written_documents_read_back() -> Result<()> {
        let store = MemoryBackend::new();
        let paths = OutputPaths::new("runs/exec-1/0")?;

        let mut outputs = LiteralMap::new();
        outputs.insert("x", Literal::Scalar(serde_json::json!(42)));
        write_outputs(&store, &paths, &outputs).await?;
        assert_eq!(read_outputs(&store, &paths).await?, Some(outputs));

        let doc = ErrorDocument {
            error: ExecutionError::user("ValueError", "bad input"),
            recoverable: false,
        };
        write_error(&store, &paths, &doc).await?;
        assert!(has_error(&store, &paths).await?);
        assert_eq!(read_error(&store, &paths).await?, Some(doc));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() -> Result<()> {
        let store = MemoryBackend::new();
        let paths = OutputPaths::new("runs/exec-1/0")?;
        store
            .put(&paths.outputs_path(), Bytes::from("{"))
            .await?;
        assert!(read_outputs(&store, &paths).await.is_err());
        Ok(())
    }

    #[test]
    fn literal_serialization_shape() {
        let literal = Literal::Collection(vec![
            Literal::Scalar(serde_json::json!("a")),
            Literal::None,
        ]);
        let json = serde_json::to_string(&literal).unwrap();
        assert_eq!(json, r#"{"collection":[{"scalar":"a"},"none"]}"#);
    }
}
