//! The conversion-operation seam.
//!
//! Format conversion itself (GDAL/OGR invocations, tile capture, geometry
//! handling) is an external concern. The orchestrator hands each operation
//! `{task_uid, stage_dir, upstream_result, config}` and expects
//! `{result_path, metadata}` back or a typed failure; failures are recorded
//! on the step record by the orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use datapack_core::StepId;

use crate::catalog::StepKind;
use crate::step::{FailureKind, FailureRecord};

/// Inputs handed to a conversion operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// The executing step.
    pub task_uid: StepId,
    /// Provider-scoped staging directory; the operation writes here.
    pub stage_dir: PathBuf,
    /// Path of the upstream step's output, when the step consumes one.
    pub upstream_result: Option<PathBuf>,
    /// Opaque provider configuration.
    pub config: serde_json::Value,
}

/// Output of a successful conversion operation.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    /// Path of the produced file, inside the staging directory.
    pub result_path: PathBuf,
    /// Operation-specific metadata (layer names, tile counts, ...).
    pub metadata: serde_json::Value,
}

/// A conversion operation.
///
/// Implementations block until the underlying work (typically a
/// subprocess) completes; cooperative cancellation reaches them through
/// process signals, not through this trait.
#[async_trait]
pub trait ExportOperation: Send + Sync {
    /// Executes the operation.
    ///
    /// # Errors
    ///
    /// Returns a structured failure record; the orchestrator attaches it to
    /// the step and fails the step.
    async fn execute(&self, ctx: &OperationContext) -> Result<OperationOutput, FailureRecord>;
}

/// Registry mapping step kinds to their operations.
///
/// Populated once at startup; the worker resolves operations from it per
/// dispatch. Finalize step kinds are orchestration-internal and never
/// appear here.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<StepKind, Arc<dyn ExportOperation>>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operation for a step kind, replacing any previous one.
    pub fn register(&mut self, kind: StepKind, operation: Arc<dyn ExportOperation>) {
        self.operations.insert(kind, operation);
    }

    /// Returns the operation for a step kind.
    #[must_use]
    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn ExportOperation>> {
        self.operations.get(&kind).cloned()
    }

    /// Returns the number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if no operations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("kinds", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Test operation that writes a small file into the staging directory and
/// returns it.
#[derive(Debug, Clone)]
pub struct FixtureOperation {
    /// Name of the file to produce.
    pub file_name: String,
    /// Bytes to write.
    pub contents: Vec<u8>,
}

impl FixtureOperation {
    /// Creates a fixture operation producing `file_name`.
    #[must_use]
    pub fn new(file_name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
impl ExportOperation for FixtureOperation {
    async fn execute(&self, ctx: &OperationContext) -> Result<OperationOutput, FailureRecord> {
        std::fs::create_dir_all(&ctx.stage_dir).map_err(|e| {
            FailureRecord::new(
                FailureKind::Infrastructure,
                format!("failed to create stage dir: {e}"),
            )
        })?;
        let result_path = ctx.stage_dir.join(&self.file_name);
        std::fs::write(&result_path, &self.contents).map_err(|e| {
            FailureRecord::new(
                FailureKind::Infrastructure,
                format!("failed to write fixture output: {e}"),
            )
        })?;
        Ok(OperationOutput {
            result_path,
            metadata: serde_json::Value::Null,
        })
    }
}

/// Test operation that always fails with a configured failure.
#[derive(Debug, Clone)]
pub struct FailingOperation {
    failure: FailureRecord,
}

impl FailingOperation {
    /// Creates a failing operation.
    #[must_use]
    pub fn new(failure: FailureRecord) -> Self {
        Self { failure }
    }
}

#[async_trait]
impl ExportOperation for FailingOperation {
    async fn execute(&self, _ctx: &OperationContext) -> Result<OperationOutput, FailureRecord> {
        Err(self.failure.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_operation_writes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let op = FixtureOperation::new("export.gpkg", b"gpkg bytes".to_vec());
        let ctx = OperationContext {
            task_uid: StepId::generate(),
            stage_dir: dir.path().join("osm"),
            upstream_result: None,
            config: serde_json::Value::Null,
        };

        let output = op.execute(&ctx).await.unwrap();
        assert!(output.result_path.exists());
        assert_eq!(std::fs::read(&output.result_path).unwrap(), b"gpkg bytes");
    }

    #[tokio::test]
    async fn failing_operation_returns_its_failure() {
        let op = FailingOperation::new(FailureRecord::new(
            FailureKind::Operation,
            "ogr2ogr exited with status 1",
        ));
        let ctx = OperationContext {
            task_uid: StepId::generate(),
            stage_dir: PathBuf::from("/nonexistent"),
            upstream_result: None,
            config: serde_json::Value::Null,
        };

        let failure = op.execute(&ctx).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Operation);
    }

    #[test]
    fn registry_resolves_by_kind() {
        let mut registry = OperationRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            StepKind::ConvertGpkg,
            Arc::new(FixtureOperation::new("out.gpkg", b"x".to_vec())),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get(StepKind::ConvertGpkg).is_some());
        assert!(registry.get(StepKind::ConvertShp).is_none());
    }
}
