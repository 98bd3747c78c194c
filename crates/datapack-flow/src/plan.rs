//! Run-level plans and the pipeline factory.
//!
//! A plan is the explicit, inspectable composition of a run: parallel
//! provider chains plus a single run-level finalize step that depends on
//! every chain. The dependency structure is plain data (steps + edges), so
//! it can be validated and tested without executing anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use datapack_core::{ProviderTaskId, RunId, StepId};

use crate::catalog::{StepKind, WorkUnitCatalog};
use crate::chain::{ChainBuilder, ProviderChain, StepSpec};
use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::job::{unmet_licenses, Job, LicenseGrants};
use crate::provider::{ProviderTaskRecord, ProviderTaskState};
use crate::run::Run;
use crate::step::StepRecord;
use crate::store::Store;

/// Production guardrail: hard cap on steps per plan.
const MAX_STEPS_PER_PLAN: usize = 1_000;

/// Dependency edge in the plan graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    /// Upstream step.
    pub from: StepId,
    /// Downstream step.
    pub to: StepId,
}

/// The full execution plan for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Unique plan identifier.
    pub plan_id: String,
    /// Run the plan executes.
    pub run_id: RunId,
    /// Plan creation timestamp.
    pub created_at: DateTime<Utc>,
    /// SHA-256 fingerprint of the plan's semantic content.
    pub fingerprint: String,
    /// Preferred worker queue for this run's dispatches, when pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_hint: Option<String>,
    /// Parallel provider chains.
    pub chains: Vec<ProviderChain>,
    /// The run-level finalize step; depends on every chain's last step.
    pub finalize: StepSpec,
    /// All dependency edges (chain-internal plus finalize fan-in).
    pub dependencies: Vec<DependencyEdge>,
}

impl Plan {
    /// Returns the total number of steps, finalize included.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.chains.iter().map(|c| c.steps.len()).sum::<usize>() + 1
    }

    /// Iterates every step spec, finalize last.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.chains
            .iter()
            .flat_map(|c| c.steps.iter())
            .chain(std::iter::once(&self.finalize))
    }

    /// Returns a step spec by id.
    #[must_use]
    pub fn get_step(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.all_steps().find(|s| &s.step_id == step_id)
    }

    /// Returns the chain for a provider record.
    #[must_use]
    pub fn chain_for(&self, provider_task_id: &ProviderTaskId) -> Option<&ProviderChain> {
        self.chains
            .iter()
            .find(|c| &c.provider_task_id == provider_task_id)
    }
}

/// Builder assembling and validating plans.
pub struct PlanBuilder {
    run_id: RunId,
    run_provider_task_id: ProviderTaskId,
    worker_hint: Option<String>,
    chains: Vec<ProviderChain>,
}

impl PlanBuilder {
    /// Creates a builder for a run; `run_provider_task_id` is the reserved
    /// pseudo-provider record that owns the finalize step.
    #[must_use]
    pub fn new(run_id: RunId, run_provider_task_id: ProviderTaskId) -> Self {
        Self {
            run_id,
            run_provider_task_id,
            worker_hint: None,
            chains: Vec::new(),
        }
    }

    /// Pins dispatches to a worker queue.
    #[must_use]
    pub fn with_worker_hint(mut self, hint: impl Into<String>) -> Self {
        self.worker_hint = Some(hint.into());
        self
    }

    /// Adds a provider chain.
    #[must_use]
    pub fn add_chain(mut self, chain: ProviderChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Builds the plan: composes the finalize step, validates the
    /// dependency graph and computes the fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan exceeds the step cap, references
    /// unknown dependencies or contains a cycle.
    #[tracing::instrument(skip(self), fields(run_id = %self.run_id, chain_count = self.chains.len()))]
    pub fn build(self) -> Result<Plan> {
        let step_count: usize = self.chains.iter().map(|c| c.steps.len()).sum::<usize>() + 1;
        if step_count > MAX_STEPS_PER_PLAN {
            return Err(Error::PlanTooLarge {
                step_count,
                max_steps: MAX_STEPS_PER_PLAN,
            });
        }

        let mut finalize = StepSpec {
            step_id: StepId::generate(),
            kind: StepKind::FinalizeRun,
            name: StepKind::FinalizeRun.display_name().to_string(),
            provider_task_id: self.run_provider_task_id,
            provider_slug: crate::provider::RUN_PROVIDER_SLUG.to_string(),
            upstream: Vec::new(),
            upstream_result_key: None,
            skippable: false,
        };
        for chain in &self.chains {
            if let Some(last) = chain.last_step() {
                finalize.upstream.push(last.step_id);
            }
        }

        // Validate with a DAG: every edge endpoint exists, no cycles.
        let mut dag: Dag<StepId> = Dag::new();
        let mut dependencies = Vec::new();
        for step in self
            .chains
            .iter()
            .flat_map(|c| c.steps.iter())
            .chain(std::iter::once(&finalize))
        {
            dag.add_node(step.step_id);
        }
        for step in self
            .chains
            .iter()
            .flat_map(|c| c.steps.iter())
            .chain(std::iter::once(&finalize))
        {
            let to = dag
                .get_index(&step.step_id)
                .ok_or(Error::StepNotFound {
                    step_id: step.step_id,
                })?;
            for upstream in &step.upstream {
                let from = dag.get_index(upstream).ok_or(Error::PlanGenerationFailed {
                    message: format!("step {} depends on unknown step {upstream}", step.step_id),
                })?;
                dag.add_edge(from, to)?;
                dependencies.push(DependencyEdge {
                    from: *upstream,
                    to: step.step_id,
                });
            }
        }
        dag.toposort()?;

        let fingerprint = compute_fingerprint(&self.chains, &finalize);

        Ok(Plan {
            plan_id: ulid::Ulid::new().to_string(),
            run_id: self.run_id,
            created_at: Utc::now(),
            fingerprint,
            worker_hint: self.worker_hint,
            chains: self.chains,
            finalize,
            dependencies,
        })
    }
}

/// Version of the plan fingerprint preimage format.
const PLAN_FINGERPRINT_VERSION: u32 = 1;

/// Computes a SHA-256 fingerprint over semantic plan content only.
///
/// Chains are keyed by provider slug and steps by kind/result-key, so the
/// fingerprint is independent of generated step ids and of chain insertion
/// order.
fn compute_fingerprint(chains: &[ProviderChain], finalize: &StepSpec) -> String {
    let mut chain_keys: Vec<String> = chains
        .iter()
        .map(|chain| {
            let steps: Vec<String> = chain
                .steps
                .iter()
                .map(|s| {
                    format!(
                        "{}<{}",
                        s.kind.as_label(),
                        s.upstream_result_key.as_deref().unwrap_or("")
                    )
                })
                .collect();
            format!("{}:[{}]", chain.provider_slug, steps.join(","))
        })
        .collect();
    chain_keys.sort();

    let mut hasher = Sha256::new();
    hasher.update(format!("datapack-plan:v{PLAN_FINGERPRINT_VERSION}:").as_bytes());
    for key in &chain_keys {
        hasher.update(key.as_bytes());
        hasher.update(b";");
    }
    hasher.update(finalize.kind.as_label().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Builds runs and plans from jobs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineFactory {
    catalog: WorkUnitCatalog,
    chain_builder: ChainBuilder,
    expiration_days: u32,
}

impl PipelineFactory {
    /// Creates a factory over the given catalog.
    #[must_use]
    pub const fn new(catalog: WorkUnitCatalog, expiration_days: u32) -> Self {
        Self {
            catalog,
            chain_builder: ChainBuilder::new(catalog),
            expiration_days,
        }
    }

    /// Returns the work-unit catalog.
    #[must_use]
    pub const fn catalog(&self) -> &WorkUnitCatalog {
        &self.catalog
    }

    /// Creates a run for a job in state `Submitted`.
    ///
    /// One provider record is created per provider export plus the reserved
    /// `run` pseudo-provider. License validation runs after the run
    /// persists; on violation the run is deleted again and a validation
    /// error returned, so the caller observes an atomic create-or-nothing.
    ///
    /// With a `parent`, completed provider records are carried over so the
    /// re-run only re-executes what did not finish.
    ///
    /// # Errors
    ///
    /// Returns a validation error for jobs without providers or with
    /// unaccepted licenses.
    #[tracing::instrument(skip_all, fields(job_id = %job.id, requested_by = requested_by))]
    pub async fn create_run(
        &self,
        store: &dyn Store,
        job: &Job,
        grants: &LicenseGrants,
        requested_by: &str,
        parent: Option<&Run>,
    ) -> Result<RunId> {
        if job.provider_exports.is_empty() {
            return Err(Error::validation(
                "this job has no data sources or formats associated with it",
            ));
        }

        let mut run = Run::new(job.id, &job.name, requested_by, self.expiration_days)
            .with_extent(job.extent);
        if let Some(parent) = parent {
            run = run.with_parent(parent.id);
        }
        run.provider_tasks.push(ProviderTaskRecord::run_record());

        for export in &job.provider_exports {
            // Completed providers from the parent run carry over untouched.
            let carried = parent.and_then(|p| {
                p.data_provider_tasks()
                    .find(|r| r.slug == export.slug && r.state == ProviderTaskState::Completed)
                    .cloned()
            });
            if let Some(record) = carried {
                run.provider_tasks.push(record);
                continue;
            }

            let mut record = ProviderTaskRecord::new(export.kind, &export.slug, &export.name)
                .with_estimates(export.estimated_size_mb, export.estimated_duration_secs);
            record.license_text = export.license.as_ref().map(|l| l.text.clone());
            run.provider_tasks.push(record);
        }

        let run_id = run.id;
        store.save_run(&run).await?;

        let unmet = unmet_licenses(job, grants);
        if !unmet.is_empty() {
            let names: Vec<&str> = unmet.iter().map(|l| l.name.as_str()).collect();
            store.delete_run(&run_id).await?;
            tracing::info!(%run_id, licenses = ?names, "run rejected for unaccepted licenses");
            return Err(Error::validation(format!(
                "user {requested_by} has not agreed to the following licenses: {}",
                names.join(", ")
            )));
        }

        tracing::info!(%run_id, providers = job.provider_exports.len(), "run created");
        Ok(run_id)
    }

    /// Builds the plan for a run and persists the step records.
    ///
    /// Each eligible (non-terminal) provider record gets a chain; terminal
    /// records are skipped, which is what makes re-runs incremental. The
    /// plan composes the chains with a single run-finalize step gated on
    /// all of them. A worker hint pins every dispatch of this run to that
    /// worker's queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the run does not exist or plan validation fails.
    #[tracing::instrument(skip_all, fields(run_id = %run_id, worker_hint = worker_hint))]
    pub async fn build_plan(
        &self,
        store: &dyn Store,
        job: &Job,
        run_id: RunId,
        worker_hint: Option<&str>,
    ) -> Result<Plan> {
        let mut run = store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;

        let run_record_id = run
            .provider_tasks
            .iter()
            .find(|p| p.is_run_record())
            .map(|p| p.id)
            .ok_or_else(|| Error::PlanGenerationFailed {
                message: format!("run {run_id} has no reserved run record"),
            })?;

        let mut builder = PlanBuilder::new(run_id, run_record_id);
        if let Some(hint) = worker_hint {
            builder = builder.with_worker_hint(hint);
        }
        for export in &job.provider_exports {
            let Some(record) = run
                .provider_tasks
                .iter()
                .find(|p| p.slug == export.slug && !p.is_run_record())
            else {
                continue;
            };
            if record.is_terminal() {
                tracing::debug!(slug = %export.slug, state = %record.state, "skipping finished provider");
                continue;
            }

            let chain = self.chain_builder.build_chain(record.id, export, job)?;
            builder = builder.add_chain(chain);
        }

        let plan = builder.build()?;

        // Persist one step record per spec so workers and the kill
        // controller share the same source of truth.
        for chain in &plan.chains {
            let provider = run
                .get_provider_task_mut(&chain.provider_task_id)
                .ok_or(Error::ProviderTaskNotFound {
                    provider_task_id: chain.provider_task_id,
                })?;
            provider.steps = chain.steps.iter().map(record_for_spec).collect();
        }
        let run_record = run
            .get_provider_task_mut(&run_record_id)
            .ok_or(Error::ProviderTaskNotFound {
                provider_task_id: run_record_id,
            })?;
        run_record.steps = vec![record_for_spec(&plan.finalize)];

        store.save_run(&run).await?;
        tracing::info!(plan_id = %plan.plan_id, steps = plan.step_count(), "plan built");
        Ok(plan)
    }
}

fn record_for_spec(spec: &StepSpec) -> StepRecord {
    let mut record = StepRecord::new(spec.kind);
    record.id = spec.step_id;
    record.name = spec.name.clone();
    record
}
