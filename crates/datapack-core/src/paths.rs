//! Filesystem layout for export staging and download areas.
//!
//! Staging directories are namespaced per run and per provider so that
//! chains never share a directory across providers:
//!
//! ```text
//! <staging_root>/<run_id>/<provider_slug>/...   intermediate outputs
//! <download_root>/<run_id>/...                  published artifacts
//! ```
//!
//! Inside an archive, provider files live under `data/<provider_slug>/` so
//! that a DataPack unpacks into per-source directories.

use std::path::{Path, PathBuf};

use crate::id::RunId;

/// Archive-relative directory that holds provider data files.
const ARCHIVE_DATA_DIR: &str = "data";

/// Path layout for staging and download roots.
///
/// Constructed once from [`crate::settings::Settings`] and passed by
/// reference to the components that touch the filesystem.
#[derive(Debug, Clone)]
pub struct ExportLayout {
    staging_root: PathBuf,
    download_root: PathBuf,
}

impl ExportLayout {
    /// Creates a layout rooted at the given staging and download paths.
    #[must_use]
    pub fn new(staging_root: impl Into<PathBuf>, download_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            download_root: download_root.into(),
        }
    }

    /// Returns the staging root.
    #[must_use]
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Returns the staging directory for a run.
    #[must_use]
    pub fn run_staging_dir(&self, run_id: RunId) -> PathBuf {
        self.staging_root.join(run_id.to_string())
    }

    /// Returns the staging directory for one provider within a run.
    #[must_use]
    pub fn provider_staging_dir(&self, run_id: RunId, provider_slug: &str) -> PathBuf {
        self.run_staging_dir(run_id).join(provider_slug)
    }

    /// Returns the download directory for a run.
    #[must_use]
    pub fn run_download_dir(&self, run_id: RunId) -> PathBuf {
        self.download_root.join(run_id.to_string())
    }

    /// Returns the archive-relative path for a provider data file.
    ///
    /// Files are grouped by provider slug under the `data/` directory.
    #[must_use]
    pub fn archive_data_path(provider_slug: &str, file_name: &str) -> String {
        format!("{ARCHIVE_DATA_DIR}/{provider_slug}/{file_name}")
    }

    /// Builds a download file name from a base name, extension and optional
    /// descriptors, normalized to lowercase-with-underscores.
    #[must_use]
    pub fn download_filename(name: &str, ext: &str, descriptors: &[&str]) -> String {
        let mut parts: Vec<String> = vec![normalize_name(name)];
        parts.extend(descriptors.iter().map(|d| normalize_name(d)));
        let stem = parts.join("-");
        let ext = ext.trim_start_matches('.');
        format!("{stem}.{ext}")
    }
}

/// Normalizes a display name into a filesystem-safe slug.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_dirs_are_namespaced_per_provider() {
        let layout = ExportLayout::new("/stage", "/download");
        let run_id = RunId::generate();

        let run_dir = layout.run_staging_dir(run_id);
        let osm_dir = layout.provider_staging_dir(run_id, "osm");
        let wms_dir = layout.provider_staging_dir(run_id, "wms-basemap");

        assert!(osm_dir.starts_with(&run_dir));
        assert!(wms_dir.starts_with(&run_dir));
        assert_ne!(osm_dir, wms_dir);
    }

    #[test]
    fn archive_data_path_groups_by_provider() {
        assert_eq!(
            ExportLayout::archive_data_path("osm", "export.gpkg"),
            "data/osm/export.gpkg"
        );
    }

    #[test]
    fn download_filename_joins_descriptors() {
        assert_eq!(
            ExportLayout::download_filename("My Export", ".gpkg", &["flood", "datapack"]),
            "my_export-flood-datapack.gpkg"
        );
    }

    #[test]
    fn normalize_name_replaces_unsafe_chars() {
        assert_eq!(normalize_name("Køln Região / test"), "k_ln_regi_o___test");
        assert_eq!(normalize_name("plain-name.gpkg"), "plain-name.gpkg");
    }
}
