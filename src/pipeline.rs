use crate::artifact::ArtifactStore;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::registry::TaxonRegistry;
use crate::stage::StageId;
use crate::tools::Toolset;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context passed to every stage handler. Everything in here is read-only
/// for the duration of the run; per-stage mutable state lives inside the
/// handler's own execution.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub config: Arc<PipelineConfig>,
    pub registry: Arc<TaxonRegistry>,
    pub tools: Arc<Toolset>,
    pub store: Arc<ArtifactStore>,
    pub cancel: CancellationToken,
}

/// Aggregated outcome of one stage, merged into the run summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub units_in: usize,
    pub units_out: usize,
    pub failures: usize,
    pub duration_ms: u64,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

impl StageReport {
    pub fn count(&mut self, key: &str, n: u64) {
        *self.counts.entry(key.to_string()).or_insert(0) += n;
    }
}

/// A pipeline stage. Handlers declare the artifacts they need (validated by
/// the orchestrator before dispatch), do their work, and write their stage
/// manifest before returning.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage_id(&self) -> StageId;

    /// Artifact paths that must already exist for this stage to run. Used
    /// by the orchestrator to validate resume points lazily.
    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf>;

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport>;
}
