//! # datapack-core
//!
//! Core primitives for the DataPack export engine.
//!
//! This crate provides the foundational types shared by every DataPack
//! component:
//!
//! - **Identifiers**: Strongly-typed ULID ids for jobs, runs, tasks and
//!   artifacts
//! - **Locking**: The execution lock cache that enforces at-most-one
//!   in-flight execution per logical unit of work
//! - **Filesystem Layout**: Staging and download directory conventions
//! - **Settings**: Environment-driven operational configuration
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `datapack-core` is the only crate allowed to define shared primitives.
//! The orchestration domain lives in `datapack-flow` and consumes these
//! types through explicit contracts.
//!
//! ## Example
//!
//! ```rust
//! use datapack_core::prelude::*;
//!
//! let run_id = RunId::generate();
//! let step_id = StepId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod settings;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ArchiveId, ArtifactId, JobId, ProviderTaskId, RunId, StepId};
    pub use crate::lock::{AcquireResult, InMemoryLockCache, LockCache, LockGuard, LockKey};
    pub use crate::paths::ExportLayout;
    pub use crate::settings::Settings;
}

pub use error::{Error, Result};
pub use id::{ArchiveId, ArtifactId, JobId, ProviderTaskId, RunId, StepId};
pub use lock::{AcquireResult, InMemoryLockCache, LockCache, LockGuard, LockKey};
pub use observability::{init_logging, LogFormat};
pub use paths::ExportLayout;
pub use settings::Settings;
