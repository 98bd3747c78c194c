//! Work-unit catalog: provider kinds, export formats and step kinds.
//!
//! The catalog is pure data. Provider type and output format are closed
//! enums; the mapping from a provider/format pair to the conversion steps it
//! needs is resolved exactly once, when the plan is built, never re-dispatched
//! per call on loosely-typed strings.

use serde::{Deserialize, Serialize};

/// The kind of data service a provider exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenStreetMap extract via an Overpass-style endpoint.
    Osm,
    /// Web Map Service raster capture.
    Wms,
    /// Web Map Tile Service raster capture.
    Wmts,
    /// Tile Map Service raster capture.
    Tms,
    /// Web Feature Service vector query.
    Wfs,
    /// Web Coverage Service elevation/coverage query.
    Wcs,
    /// ArcGIS raster (map service) capture.
    ArcgisRaster,
    /// ArcGIS feature service query.
    ArcgisFeature,
    /// OGC API Processes execution.
    OgcApiProcess,
    /// Pre-existing vector file download.
    VectorFile,
    /// Pre-existing raster file download.
    RasterFile,
}

impl ProviderKind {
    /// Returns a lowercase label suitable for slugs, metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Osm => "osm",
            Self::Wms => "wms",
            Self::Wmts => "wmts",
            Self::Tms => "tms",
            Self::Wfs => "wfs",
            Self::Wcs => "wcs",
            Self::ArcgisRaster => "arcgis-raster",
            Self::ArcgisFeature => "arcgis-feature",
            Self::OgcApiProcess => "ogcapi-process",
            Self::VectorFile => "vector-file",
            Self::RasterFile => "raster-file",
        }
    }

    /// Returns true if this service yields vector data.
    #[must_use]
    pub const fn is_vector(&self) -> bool {
        matches!(
            self,
            Self::Osm | Self::Wfs | Self::ArcgisFeature | Self::VectorFile
        )
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// A requested output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// OGC GeoPackage.
    Gpkg,
    /// Esri Shapefile.
    Shp,
    /// Keyhole Markup Language.
    Kml,
    /// GPS Exchange Format.
    Gpx,
    /// SpatiaLite database.
    Sqlite,
    /// MBTiles tileset.
    Mbtiles,
    /// Cloud-optimizable GeoTIFF.
    Geotiff,
}

impl ExportFormat {
    /// Returns a lowercase label suitable for slugs, metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Gpkg => "gpkg",
            Self::Shp => "shp",
            Self::Kml => "kml",
            Self::Gpx => "gpx",
            Self::Sqlite => "sqlite",
            Self::Mbtiles => "mbtiles",
            Self::Geotiff => "geotiff",
        }
    }

    /// Returns the file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Gpkg => "gpkg",
            Self::Shp => "shp",
            Self::Kml => "kml",
            Self::Gpx => "gpx",
            Self::Sqlite => "sqlite",
            Self::Mbtiles => "mbtiles",
            Self::Geotiff => "tif",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// The kind of work one step performs.
///
/// Acquisition steps pull source data into the staging directory, conversion
/// steps derive additional formats from it, and the finalize kinds are
/// orchestration-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Writes the job's area-of-interest selection as GeoJSON.
    SelectionExport,
    /// Collects OSM source data.
    OsmCollection,
    /// Captures raster tiles from a WMS/WMTS/TMS/ArcGIS map service.
    RasterCapture,
    /// Queries a WFS endpoint.
    WfsQuery,
    /// Queries a WCS endpoint.
    WcsQuery,
    /// Queries an ArcGIS feature service.
    ArcgisFeatureQuery,
    /// Executes an OGC API process and fetches its result.
    OgcProcessFetch,
    /// Downloads a pre-existing vector file.
    VectorFileDownload,
    /// Downloads a pre-existing raster file.
    RasterFileDownload,
    /// Converts source data to GeoPackage.
    ConvertGpkg,
    /// Converts source data to Shapefile.
    ConvertShp,
    /// Converts source data to KML.
    ConvertKml,
    /// Converts source data to GPX.
    ConvertGpx,
    /// Converts source data to SpatiaLite.
    ConvertSqlite,
    /// Converts source data to MBTiles.
    ConvertMbtiles,
    /// Converts source data to GeoTIFF.
    ConvertGeotiff,
    /// Reprojects outputs into an additional requested projection.
    Reproject,
    /// Zips one provider's outputs.
    ProviderZip,
    /// Aggregates one provider's step results into its final status.
    FinalizeProvider,
    /// Aggregates the whole run: archive assembly, status, notification.
    FinalizeRun,
}

impl StepKind {
    /// Returns a lowercase label suitable for lock keys, metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::SelectionExport => "selection_export",
            Self::OsmCollection => "osm_collection",
            Self::RasterCapture => "raster_capture",
            Self::WfsQuery => "wfs_query",
            Self::WcsQuery => "wcs_query",
            Self::ArcgisFeatureQuery => "arcgis_feature_query",
            Self::OgcProcessFetch => "ogc_process_fetch",
            Self::VectorFileDownload => "vector_file_download",
            Self::RasterFileDownload => "raster_file_download",
            Self::ConvertGpkg => "convert_gpkg",
            Self::ConvertShp => "convert_shp",
            Self::ConvertKml => "convert_kml",
            Self::ConvertGpx => "convert_gpx",
            Self::ConvertSqlite => "convert_sqlite",
            Self::ConvertMbtiles => "convert_mbtiles",
            Self::ConvertGeotiff => "convert_geotiff",
            Self::Reproject => "reproject",
            Self::ProviderZip => "provider_zip",
            Self::FinalizeProvider => "finalize_provider",
            Self::FinalizeRun => "finalize_run",
        }
    }

    /// Returns the human-readable display name.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::SelectionExport => "Area of Interest (.geojson)",
            Self::OsmCollection => "OpenStreetMap Data (.gpkg)",
            Self::RasterCapture => "Raster Export (.gpkg)",
            Self::WfsQuery => "WFS Export",
            Self::WcsQuery => "WCS Export",
            Self::ArcgisFeatureQuery => "ArcGIS Feature Export",
            Self::OgcProcessFetch => "OGC Process Export",
            Self::VectorFileDownload => "Vector File Download",
            Self::RasterFileDownload => "Raster File Download",
            Self::ConvertGpkg => "GeoPackage (.gpkg)",
            Self::ConvertShp => "Shapefile (.shp)",
            Self::ConvertKml => "Google Earth (.kml)",
            Self::ConvertGpx => "GPS Exchange (.gpx)",
            Self::ConvertSqlite => "SpatiaLite (.sqlite)",
            Self::ConvertMbtiles => "MBTiles (.mbtiles)",
            Self::ConvertGeotiff => "GeoTIFF (.tif)",
            Self::Reproject => "Reprojection",
            Self::ProviderZip => "Provider Files (.zip)",
            Self::FinalizeProvider => "Finalize Provider",
            Self::FinalizeRun => "Finalize Run",
        }
    }

    /// Returns the result key under which this step publishes its output.
    ///
    /// Downstream steps reference this key to locate their input without
    /// global state.
    #[must_use]
    pub const fn result_key(&self) -> &'static str {
        match self {
            Self::SelectionExport => "selection",
            Self::OsmCollection
            | Self::RasterCapture
            | Self::WfsQuery
            | Self::WcsQuery
            | Self::ArcgisFeatureQuery
            | Self::OgcProcessFetch
            | Self::VectorFileDownload
            | Self::RasterFileDownload => "source",
            Self::ConvertGpkg => "gpkg",
            Self::ConvertShp => "shp",
            Self::ConvertKml => "kml",
            Self::ConvertGpx => "gpx",
            Self::ConvertSqlite => "sqlite",
            Self::ConvertMbtiles => "mbtiles",
            Self::ConvertGeotiff => "geotiff",
            Self::Reproject => "reprojected",
            Self::ProviderZip => "provider_zip",
            Self::FinalizeProvider => "finalize_provider",
            Self::FinalizeRun => "finalize_run",
        }
    }

    /// Returns true if a failure of this step does not fail its provider.
    #[must_use]
    pub const fn is_skippable(&self) -> bool {
        matches!(self, Self::SelectionExport)
    }

    /// Returns true if this step is orchestration-internal rather than an
    /// external conversion operation.
    #[must_use]
    pub const fn is_finalize(&self) -> bool {
        matches!(self, Self::FinalizeProvider | Self::FinalizeRun)
    }

    /// Returns true if this step's output is shown to users.
    #[must_use]
    pub const fn is_display(&self) -> bool {
        !matches!(self, Self::FinalizeProvider | Self::FinalizeRun)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Registry resolving provider kinds and formats to the steps that serve
/// them.
///
/// Resolution happens once at plan-build time; the scheduler and workers
/// only ever see the resulting [`StepKind`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkUnitCatalog;

impl WorkUnitCatalog {
    /// Creates the catalog.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the data-acquisition step for a provider kind.
    #[must_use]
    pub const fn acquisition_for(&self, kind: ProviderKind) -> StepKind {
        match kind {
            ProviderKind::Osm => StepKind::OsmCollection,
            ProviderKind::Wms
            | ProviderKind::Wmts
            | ProviderKind::Tms
            | ProviderKind::ArcgisRaster => StepKind::RasterCapture,
            ProviderKind::Wfs => StepKind::WfsQuery,
            ProviderKind::Wcs => StepKind::WcsQuery,
            ProviderKind::ArcgisFeature => StepKind::ArcgisFeatureQuery,
            ProviderKind::OgcApiProcess => StepKind::OgcProcessFetch,
            ProviderKind::VectorFile => StepKind::VectorFileDownload,
            ProviderKind::RasterFile => StepKind::RasterFileDownload,
        }
    }

    /// Returns the format the acquisition step already natively produces.
    ///
    /// A requested format equal to the native one needs no conversion step;
    /// listing it twice would only duplicate the file in the DataPack.
    #[must_use]
    pub const fn native_format_for(&self, kind: ProviderKind) -> ExportFormat {
        match kind {
            ProviderKind::Wcs => ExportFormat::Geotiff,
            _ => ExportFormat::Gpkg,
        }
    }

    /// Returns the conversion step for a requested format.
    #[must_use]
    pub const fn conversion_for(&self, format: ExportFormat) -> StepKind {
        match format {
            ExportFormat::Gpkg => StepKind::ConvertGpkg,
            ExportFormat::Shp => StepKind::ConvertShp,
            ExportFormat::Kml => StepKind::ConvertKml,
            ExportFormat::Gpx => StepKind::ConvertGpx,
            ExportFormat::Sqlite => StepKind::ConvertSqlite,
            ExportFormat::Mbtiles => StepKind::ConvertMbtiles,
            ExportFormat::Geotiff => StepKind::ConvertGeotiff,
        }
    }
}
