use crate::artifact::ArtifactStore;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::registry::TaxonRegistry;
use crate::run::{PipelineRun, RunStateMachine};
use crate::stage::StageId;
use crate::stages::{
    AlignmentStage, BlockAnalysisStage, ClusteringStage, ModelSelectionStage, TaxaAnalysisStage,
    TranslationStage, TreeInferenceStage,
};
use crate::tools::Toolset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Final record of one run: the run state plus per-stage reports. Also
/// what gets written to `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    pub reports: Vec<StageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: StageId,
    pub report: StageReport,
}

/// Linear state machine over the seven stages. Stages before the configured
/// start point are skipped; their artifacts are validated lazily through
/// each stage's declared prerequisites. Every stage runs behind a barrier:
/// its manifest is written only after all its workers finished, and the next
/// stage starts only after that.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    registry: Arc<TaxonRegistry>,
    tools: Arc<Toolset>,
    store: Arc<ArtifactStore>,
    handlers: HashMap<StageId, Arc<dyn StageHandler>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: Arc<TaxonRegistry>,
        tools: Arc<Toolset>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            config,
            registry,
            tools,
            store,
            handlers: HashMap::new(),
        }
    }

    /// Orchestrator wired with the seven production stage handlers.
    pub fn with_default_handlers(
        config: Arc<PipelineConfig>,
        registry: Arc<TaxonRegistry>,
        tools: Arc<Toolset>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        let mut orchestrator = Self::new(config, registry, tools, store);
        orchestrator.register_handler(Arc::new(TranslationStage));
        orchestrator.register_handler(Arc::new(ClusteringStage));
        orchestrator.register_handler(Arc::new(AlignmentStage));
        orchestrator.register_handler(Arc::new(ModelSelectionStage));
        orchestrator.register_handler(Arc::new(TreeInferenceStage));
        orchestrator.register_handler(Arc::new(TaxaAnalysisStage));
        orchestrator.register_handler(Arc::new(BlockAnalysisStage));
        orchestrator
    }

    pub fn register_handler(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.stage_id(), handler);
    }

    fn execution_plan(&self) -> String {
        StageId::ORDER
            .iter()
            .map(|stage| {
                if stage.ordinal() < self.config.start_stage.ordinal() {
                    format!("{}. {} [skipped]", stage.ordinal() + 1, stage)
                } else {
                    format!("{}. {}", stage.ordinal() + 1, stage)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute all stages from the configured start point. Main entry point.
    pub async fn execute(&self) -> Result<PipelineOutcome> {
        let run = PipelineRun::new(self.config.reference_taxon.clone());
        let run_id = run.id;
        info!(
            "run {}: reference taxon '{}', starting at stage {}",
            run_id, self.config.reference_taxon, self.config.start_stage
        );
        info!("execution plan:\n{}", self.execution_plan());

        let mut state = RunStateMachine::new(run);
        state.start(self.config.start_stage)?;

        let ctx = StageContext {
            run_id,
            config: self.config.clone(),
            registry: self.registry.clone(),
            tools: self.tools.clone(),
            store: self.store.clone(),
            cancel: CancellationToken::new(),
        };

        let mut reports: Vec<StageEntry> = Vec::new();
        for &stage in StageId::sequence_from(self.config.start_stage) {
            let result = self.execute_stage(stage, &ctx, &mut state).await;
            match result {
                Ok(report) => {
                    info!(
                        "stage {} completed: {} of {} units in {}ms ({} failures)",
                        stage,
                        report.units_out,
                        report.units_in,
                        report.duration_ms,
                        report.failures
                    );
                    reports.push(StageEntry { stage, report });
                }
                Err(e) => {
                    error!("stage {} failed: {}", stage, e);
                    state.fail(e.to_string(), e.failure_kind(), stage)?;
                    let outcome = PipelineOutcome {
                        run: state.into_run(),
                        reports,
                    };
                    self.write_summary(&outcome)?;
                    return Err(e);
                }
            }
        }

        let families_analyzed = reports
            .iter()
            .find(|entry| entry.stage == StageId::TaxaAnalysis)
            .map(|entry| entry.report.units_out)
            .unwrap_or(0);
        state.complete(families_analyzed)?;

        let outcome = PipelineOutcome {
            run: state.into_run(),
            reports,
        };
        self.write_summary(&outcome)?;
        Ok(outcome)
    }

    async fn execute_stage(
        &self,
        stage: StageId,
        ctx: &StageContext,
        state: &mut RunStateMachine,
    ) -> Result<StageReport> {
        let handler = self.handlers.get(&stage).ok_or_else(|| {
            PipelineError::config(format!("no handler registered for stage {stage}"))
        })?;

        // Prerequisites are validated lazily, right before the stage runs:
        // a resume with missing prior artifacts fails here, naming the file.
        for path in handler.required_inputs(ctx) {
            if !path.exists() {
                return Err(PipelineError::MissingPrerequisite {
                    stage: stage.as_str().to_string(),
                    path,
                });
            }
        }

        state.advance(stage)?;
        info!("executing stage: {stage}");
        handler.execute(ctx).await
    }

    fn write_summary(&self, outcome: &PipelineOutcome) -> Result<()> {
        let file = BufWriter::new(File::create(self.store.run_path())?);
        serde_json::to_writer_pretty(file, outcome)?;
        Ok(())
    }
}
