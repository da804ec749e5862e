//! Dataset storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{debug, error};

use crate::error::{GatewayError, Result};
use crate::security::SanitizedPath;

/// Contents and metadata of one dataset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub contents: Vec<u8>,
    pub last_modified: DateTime<Utc>,
}

/// Trait for dataset stores. Lookups only accept sanitized paths.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch a dataset by its sanitized path.
    async fn fetch(&self, path: &SanitizedPath) -> Result<DataFile>;
}

/// Store reading datasets from a directory.
#[derive(Debug, Clone)]
pub struct FsDataStore {
    root: PathBuf,
}

impl FsDataStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DataStore for FsDataStore {
    async fn fetch(&self, path: &SanitizedPath) -> Result<DataFile> {
        let full_path = self.root.join(path.as_str());

        let metadata = match tokio::fs::metadata(&full_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(GatewayError::NotFound("dataset not found".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "Dataset not found");
                return Err(GatewayError::NotFound("dataset not found".to_string()));
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to stat dataset");
                return Err(GatewayError::Io(e));
            }
        };

        let contents = tokio::fs::read(&full_path).await.map_err(|e| {
            error!(path = %path, error = %e, "Failed to read dataset");
            GatewayError::Io(e)
        })?;

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(DataFile {
            contents,
            last_modified,
        })
    }
}
