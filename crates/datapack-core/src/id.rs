//! Strongly-typed identifiers for DataPack entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different id types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! ULID strings are the externally visible identifiers; any sequential ids a
//! storage backend might use internally are never exposed.
//!
//! # Example
//!
//! ```rust
//! use datapack_core::id::{RunId, StepId};
//!
//! let run = RunId::generate();
//! let step = StepId::generate();
//!
//! // Ids are different types - this won't compile:
//! // let wrong: RunId = step;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique id.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an id from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the id.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} id '{s}': {e}", $label),
                })
            }
        }
    };
}

entity_id!(
    /// A unique identifier for an export job (the user-facing request a run
    /// executes).
    JobId,
    "job"
);

entity_id!(
    /// A unique identifier for an export run.
    ///
    /// A run is one execution attempt of a job; it owns provider task
    /// records and step records for their lifetime.
    RunId,
    "run"
);

entity_id!(
    /// A unique identifier for one provider's unit of work within a run.
    ProviderTaskId,
    "provider task"
);

entity_id!(
    /// A unique identifier for an executable step within a provider chain.
    StepId,
    "step"
);

entity_id!(
    /// A unique identifier for a produced output file.
    ArtifactId,
    "artifact"
);

entity_id!(
    /// A unique identifier for an aggregated downloadable archive.
    ArchiveId,
    "archive"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::generate();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn step_id_roundtrip() {
        let id = StepId::generate();
        let s = id.to_string();
        let parsed: StepId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let id1 = ArtifactId::generate();
        let id2 = ArtifactId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<RunId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn created_at_is_recent() {
        let id = RunId::generate();
        let age = chrono::Utc::now() - id.created_at();
        assert!(age.num_seconds() < 10);
    }
}
