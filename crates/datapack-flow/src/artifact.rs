//! Artifact handles for produced output files.
//!
//! An artifact's lifetime is independent of any single step record: runs
//! hold weak references through their steps, and an artifact is deleted only
//! when no live run references it (longest-holder rule, enforced by the
//! store's sweep).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::ArtifactId;

/// A produced output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Unique artifact identifier.
    pub id: ArtifactId,
    /// Base file name.
    pub file_name: String,
    /// Absolute path of the produced file.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Public download URL, when published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Deletion flag; set by the sweep when no live run references the
    /// artifact any more.
    #[serde(default)]
    pub deleted: bool,
    /// When the artifact was produced.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates an artifact handle for a produced file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: ArtifactId::generate(),
            file_name,
            path,
            size_bytes,
            download_url: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    /// Creates an artifact handle from a file on disk, reading its size.
    ///
    /// # Errors
    ///
    /// Returns an io error if the file cannot be stat'ed.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::new(path, meta.len()))
    }

    /// Sets the public download URL.
    #[must_use]
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }
}
