//! DataPack manifest: data sources, extent and file inventory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::BoundingBox;
use crate::run::Run;

/// One data source listed in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSource {
    /// Provider slug.
    pub slug: String,
    /// Provider display name.
    pub name: String,
    /// Number of data files contributed by this source.
    pub file_count: usize,
}

/// One file listed in the manifest inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Archive-relative path.
    pub archive_path: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// The manifest written into every DataPack.
///
/// Side files (styles, readme, the manifest itself) are not part of the
/// inventory; it enumerates the data files only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// DataPack display name (the job name).
    pub datapack: String,
    /// Run identifier the pack was produced from.
    pub run_id: String,
    /// When the manifest was generated.
    pub generated_at: DateTime<Utc>,
    /// Geographic extent, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent: Option<BoundingBox>,
    /// Data sources covered by the pack.
    pub sources: Vec<ManifestSource>,
    /// File inventory.
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    /// Creates an empty manifest for a run.
    #[must_use]
    pub fn for_run(run: &Run) -> Self {
        Self {
            datapack: run.job_name.clone(),
            run_id: run.id.to_string(),
            generated_at: Utc::now(),
            extent: run.extent,
            sources: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Adds a data source.
    pub fn add_source(&mut self, slug: impl Into<String>, name: impl Into<String>, file_count: usize) {
        self.sources.push(ManifestSource {
            slug: slug.into(),
            name: name.into(),
            file_count,
        });
    }

    /// Adds a file to the inventory.
    pub fn add_file(&mut self, archive_path: impl Into<String>, size_bytes: u64) {
        self.files.push(ManifestFile {
            archive_path: archive_path.into(),
            size_bytes,
        });
    }

    /// Renders the manifest as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization {
            message: format!("failed to serialize manifest: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datapack_core::JobId;

    #[test]
    fn manifest_lists_sources_and_files() {
        let run = Run::new(JobId::generate(), "Flood Extent", "gis-user", 14);
        let mut manifest = Manifest::for_run(&run);
        manifest.add_source("osm", "OpenStreetMap", 2);
        manifest.add_file("data/osm/export.gpkg", 2048);
        manifest.add_file("data/osm/export.shp", 512);

        assert_eq!(manifest.sources.len(), 1);
        assert_eq!(manifest.files.len(), 2);

        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"datapack\": \"Flood Extent\""));
        assert!(json.contains("data/osm/export.gpkg"));
    }
}
