//! Job inputs consumed by the pipeline factory.
//!
//! The surrounding CRUD application (job management, permissions,
//! notifications delivery) is an external collaborator; this module keeps
//! only the slice of job data the orchestration engine needs to build a run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use datapack_core::JobId;

use crate::catalog::{ExportFormat, ProviderKind};
use crate::error::{Error, Result};

/// Geographic extent of an export, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    /// Western longitude.
    pub west: f64,
    /// Southern latitude.
    pub south: f64,
    /// Eastern longitude.
    pub east: f64,
    /// Northern latitude.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a bounding box, validating the coordinate ranges.
    ///
    /// # Errors
    ///
    /// Returns a validation error for inverted or out-of-range bounds.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        if !(-180.0..=180.0).contains(&west)
            || !(-180.0..=180.0).contains(&east)
            || !(-90.0..=90.0).contains(&south)
            || !(-90.0..=90.0).contains(&north)
        {
            return Err(Error::validation("bounding box out of range"));
        }
        if west >= east || south >= north {
            return Err(Error::validation("bounding box is inverted or empty"));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }
}

/// A data license a provider's output is distributed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    /// Stable license slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// License text, written into the DataPack alongside the data.
    pub text: String,
}

/// One provider export requested by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderExport {
    /// Service kind.
    pub kind: ProviderKind,
    /// Stable provider slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Requested output formats.
    pub formats: Vec<ExportFormat>,
    /// License the user must have accepted, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    /// Whether this provider's outputs get their own zip inside the run.
    #[serde(default)]
    pub zip_outputs: bool,
    /// Estimated output size in megabytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_mb: Option<f64>,
    /// Estimated duration in seconds, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    /// Opaque provider configuration handed to the conversion operations.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ProviderExport {
    /// Creates a provider export with the given formats.
    #[must_use]
    pub fn new(
        kind: ProviderKind,
        slug: impl Into<String>,
        name: impl Into<String>,
        formats: Vec<ExportFormat>,
    ) -> Self {
        Self {
            kind,
            slug: slug.into(),
            name: name.into(),
            formats,
            license: None,
            zip_outputs: false,
            estimated_size_mb: None,
            estimated_duration_secs: None,
            config: serde_json::Value::Null,
        }
    }

    /// Attaches a license requirement.
    #[must_use]
    pub fn with_license(mut self, license: License) -> Self {
        self.license = Some(license);
        self
    }
}

/// The slice of a job the orchestration engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Display name.
    pub name: String,
    /// Owning user.
    pub owner: String,
    /// Optional event tag (e.g. a disaster activation name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Geographic extent.
    pub extent: BoundingBox,
    /// Additional EPSG codes to reproject outputs into (4326 is implicit).
    #[serde(default)]
    pub projections: Vec<u32>,
    /// Requested provider exports.
    pub provider_exports: Vec<ProviderExport>,
}

/// Licenses a user has agreed to.
#[derive(Debug, Clone, Default)]
pub struct LicenseGrants {
    accepted: BTreeSet<String>,
}

impl LicenseGrants {
    /// Creates an empty grant set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records acceptance of a license slug.
    pub fn accept(&mut self, slug: impl Into<String>) {
        self.accepted.insert(slug.into());
    }

    /// Returns true if the slug has been accepted.
    #[must_use]
    pub fn accepts(&self, slug: &str) -> bool {
        self.accepted.contains(slug)
    }
}

/// Returns the licenses required by `job` that `grants` does not cover.
#[must_use]
pub fn unmet_licenses<'a>(job: &'a Job, grants: &LicenseGrants) -> Vec<&'a License> {
    job.provider_exports
        .iter()
        .filter_map(|p| p.license.as_ref())
        .filter(|l| !grants.accepts(&l.slug))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odbl() -> License {
        License {
            slug: "osm-odbl".into(),
            name: "ODbL".into(),
            text: "Open Database License".into(),
        }
    }

    #[test]
    fn bounding_box_rejects_inverted_bounds() {
        assert!(BoundingBox::new(10.0, 10.0, 5.0, 20.0).is_err());
        assert!(BoundingBox::new(-200.0, 0.0, 10.0, 20.0).is_err());
        assert!(BoundingBox::new(5.0, 5.0, 10.0, 10.0).is_ok());
    }

    #[test]
    fn unmet_licenses_reports_unaccepted_only() {
        let job = Job {
            id: JobId::generate(),
            name: "Flood Extent".into(),
            owner: "gis-user".into(),
            event: None,
            extent: BoundingBox::new(5.0, 5.0, 10.0, 10.0).unwrap(),
            projections: vec![],
            provider_exports: vec![
                ProviderExport::new(ProviderKind::Osm, "osm", "OSM", vec![ExportFormat::Gpkg])
                    .with_license(odbl()),
                ProviderExport::new(ProviderKind::Wms, "wms", "WMS", vec![ExportFormat::Gpkg]),
            ],
        };

        let mut grants = LicenseGrants::new();
        assert_eq!(unmet_licenses(&job, &grants).len(), 1);

        grants.accept("osm-odbl");
        assert!(unmet_licenses(&job, &grants).is_empty());
    }
}
