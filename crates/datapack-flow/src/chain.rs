//! Task chain construction for one provider.
//!
//! A chain is an ordered pipeline of step specs: data acquisition precedes
//! format conversion, conversion precedes reprojection, reprojection
//! precedes zip inclusion, and a provider-finalize step closes the chain.
//! Each spec names the upstream result key its operation reads, so a step
//! can locate its predecessor's output without global state.

use serde::{Deserialize, Serialize};

use datapack_core::{ProviderTaskId, StepId};

use crate::catalog::{StepKind, WorkUnitCatalog};
use crate::error::{Error, Result};
use crate::job::{Job, ProviderExport};

/// Specification of one executable step within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step identifier; matches the persisted `StepRecord`.
    pub step_id: StepId,
    /// What the step does.
    pub kind: StepKind,
    /// Display name.
    pub name: String,
    /// Provider record that owns the step.
    pub provider_task_id: ProviderTaskId,
    /// Slug of the owning provider (or `run` for run-level steps).
    pub provider_slug: String,
    /// Steps that must reach a terminal state before this one dispatches.
    #[serde(default)]
    pub upstream: Vec<StepId>,
    /// Result key of the step whose output this one consumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_result_key: Option<String>,
    /// Whether a failure of this step fails the provider.
    pub skippable: bool,
}

impl StepSpec {
    fn new(kind: StepKind, provider_task_id: ProviderTaskId, provider_slug: &str) -> Self {
        Self {
            step_id: StepId::generate(),
            kind,
            name: kind.display_name().to_string(),
            provider_task_id,
            provider_slug: provider_slug.to_string(),
            upstream: Vec::new(),
            upstream_result_key: None,
            skippable: kind.is_skippable(),
        }
    }
}

/// The ordered chain of steps for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderChain {
    /// Provider record the chain belongs to.
    pub provider_task_id: ProviderTaskId,
    /// Provider slug.
    pub provider_slug: String,
    /// Steps in execution order; each depends on its predecessor.
    pub steps: Vec<StepSpec>,
}

impl ProviderChain {
    /// Returns the final step of the chain (the provider finalize step).
    #[must_use]
    pub fn last_step(&self) -> Option<&StepSpec> {
        self.steps.last()
    }
}

/// Builds per-provider chains from the work-unit catalog.
#[derive(Debug, Clone, Copy)]
pub struct ChainBuilder {
    catalog: WorkUnitCatalog,
}

impl ChainBuilder {
    /// Creates a chain builder over the given catalog.
    #[must_use]
    pub const fn new(catalog: WorkUnitCatalog) -> Self {
        Self { catalog }
    }

    /// Builds the ordered chain for one provider export.
    ///
    /// Order: selection export, acquisition, one conversion per requested
    /// format the acquisition does not natively produce, one reprojection
    /// per extra projection, an optional provider zip (only when the
    /// provider opts in and the job has more than one provider, single-source
    /// zips would be redundant), and the provider finalize step.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the provider requests no formats.
    pub fn build_chain(
        &self,
        provider_task_id: ProviderTaskId,
        provider: &ProviderExport,
        job: &Job,
    ) -> Result<ProviderChain> {
        if provider.formats.is_empty() {
            return Err(Error::validation(format!(
                "provider {} requests no output formats",
                provider.slug
            )));
        }

        let mut steps: Vec<StepSpec> = Vec::new();
        let slug = provider.slug.as_str();

        steps.push(StepSpec::new(
            StepKind::SelectionExport,
            provider_task_id,
            slug,
        ));

        let acquisition = self.catalog.acquisition_for(provider.kind);
        steps.push(StepSpec::new(acquisition, provider_task_id, slug));

        let native = self.catalog.native_format_for(provider.kind);
        let mut seen = Vec::new();
        for format in &provider.formats {
            if *format == native || seen.contains(format) {
                continue;
            }
            seen.push(*format);
            steps.push(StepSpec::new(
                self.catalog.conversion_for(*format),
                provider_task_id,
                slug,
            ));
        }

        for _epsg in job.projections.iter().filter(|p| **p != 4326) {
            steps.push(StepSpec::new(StepKind::Reproject, provider_task_id, slug));
        }

        if provider.zip_outputs && job.provider_exports.len() > 1 {
            steps.push(StepSpec::new(StepKind::ProviderZip, provider_task_id, slug));
        }

        steps.push(StepSpec::new(
            StepKind::FinalizeProvider,
            provider_task_id,
            slug,
        ));

        // Sequential composition: each step waits on its predecessor and
        // reads the predecessor's published result key. Conversions read the
        // acquisition output, which the sequential ordering keeps in place.
        for i in 1..steps.len() {
            let prev_id = steps[i - 1].step_id;
            let prev_key = steps[i - 1].kind.result_key().to_string();
            let step = &mut steps[i];
            step.upstream.push(prev_id);
            step.upstream_result_key = Some(match step.kind {
                StepKind::ConvertGpkg
                | StepKind::ConvertShp
                | StepKind::ConvertKml
                | StepKind::ConvertGpx
                | StepKind::ConvertSqlite
                | StepKind::ConvertMbtiles
                | StepKind::ConvertGeotiff
                | StepKind::Reproject => "source".to_string(),
                _ => prev_key,
            });
        }

        Ok(ProviderChain {
            provider_task_id,
            provider_slug: provider.slug.clone(),
            steps,
        })
    }
}
