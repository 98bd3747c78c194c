//! # datapack-flow
//!
//! Export task orchestration engine for DataPack production.
//!
//! Given a submitted export job, this crate builds a directed multi-stage
//! pipeline of per-provider conversion steps, schedules them onto a
//! queue-backed worker pool, enforces at-most-one in-flight execution per
//! logical unit of work, tracks live status through a persisted state
//! machine, supports cooperative cancellation and provider-level retry, and
//! finally aggregates per-provider artifacts into a single downloadable
//! archive.
//!
//! ## Core Concepts
//!
//! - **Run**: One execution attempt of an export job
//! - **Provider task**: The portion of a run belonging to one data provider
//! - **Step**: One executable unit within a provider's pipeline
//! - **Plan**: Parallel provider chains plus the run-level finalize step
//! - **Chain**: The ordered step sequence for one provider
//!
//! ## Guarantees
//!
//! - **Forward-only state**: Terminal records accept no further transitions
//! - **Partial success**: One provider's failure never hard-fails a run
//! - **Inspectable plans**: Dependency structure is plain data, validated
//!   before anything executes
//!
//! ## Example
//!
//! ```rust,no_run
//! use datapack_flow::catalog::{ExportFormat, ProviderKind, WorkUnitCatalog};
//! use datapack_flow::error::Result;
//! use datapack_flow::job::{BoundingBox, Job, LicenseGrants, ProviderExport};
//! use datapack_flow::plan::PipelineFactory;
//! use datapack_flow::store::memory::InMemoryStore;
//! use datapack_core::JobId;
//!
//! # async fn example() -> Result<()> {
//! let job = Job {
//!     id: JobId::generate(),
//!     name: "Flood Extent".into(),
//!     owner: "gis-user".into(),
//!     event: None,
//!     extent: BoundingBox::new(5.0, 5.0, 10.0, 10.0)?,
//!     projections: vec![],
//!     provider_exports: vec![ProviderExport::new(
//!         ProviderKind::Osm,
//!         "osm",
//!         "OpenStreetMap",
//!         vec![ExportFormat::Gpkg],
//!     )],
//! };
//!
//! let store = InMemoryStore::new();
//! let factory = PipelineFactory::new(WorkUnitCatalog::new(), 14);
//! let run_id = factory
//!     .create_run(&store, &job, &LicenseGrants::new(), "gis-user", None)
//!     .await?;
//! let plan = factory.build_plan(&store, &job, run_id, None).await?;
//! # let _ = plan;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod archive;
pub mod artifact;
pub mod cancel;
pub mod catalog;
pub mod chain;
pub(crate) mod dag;
pub mod dispatch;
pub mod error;
pub mod finalize;
pub mod job;
pub mod manifest;
pub mod metrics;
pub mod notify;
pub mod operation;
pub mod plan;
pub mod proc;
pub mod provider;
pub mod run;
pub mod scaler;
pub mod scheduler;
pub mod service;
pub mod step;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::archive::{ArchiveRecord, ArchiveState, Archiver};
    pub use crate::artifact::Artifact;
    pub use crate::cancel::KillController;
    pub use crate::catalog::{ExportFormat, ProviderKind, StepKind, WorkUnitCatalog};
    pub use crate::chain::{ChainBuilder, ProviderChain, StepSpec};
    pub use crate::dispatch::{
        EnqueueOptions, EnqueueResult, Envelope, Priority, StepEnvelope, StepQueue,
    };
    pub use crate::error::{Error, Result};
    pub use crate::finalize::{finalize_provider, FinalizeOutcome, RunFinalizer};
    pub use crate::job::{Job, LicenseGrants, ProviderExport};
    pub use crate::manifest::Manifest;
    pub use crate::metrics::FlowMetrics;
    pub use crate::notify::{InMemoryNotifier, LogNotifier, Notifier};
    pub use crate::operation::{ExportOperation, OperationContext, OperationRegistry};
    pub use crate::plan::{Plan, PlanBuilder, PipelineFactory};
    pub use crate::provider::{ProviderTaskRecord, ProviderTaskState};
    pub use crate::run::{Run, RunState};
    pub use crate::scaler::{CapacityProvider, FleetScaler, ScalerConfig};
    pub use crate::scheduler::Scheduler;
    pub use crate::service::{ExportService, RunStatus};
    pub use crate::step::{FailureKind, FailureRecord, StepRecord, StepState};
    pub use crate::store::{CasResult, Store};
    pub use crate::worker::{Worker, WorkerTick};
}
