use crate::artifact::{ArtifactStore, StageManifest};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::family::{FamilyFailure, GeneFamily};
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::process::{run_for_unit, ToolInvocation};
use crate::stage::StageId;
use crate::stages::elapsed_ms;
use crate::tools::{Tool, Toolset};
use crate::worker::run_pool;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stage 4: per-family substitution model selection. The tree tool runs in
/// model-finder-only mode; the best-fit model is read back from its report
/// and attached to the family.
pub struct ModelSelectionStage;

#[async_trait]
impl StageHandler for ModelSelectionStage {
    fn stage_id(&self) -> StageId {
        StageId::ModelSelection
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.store.manifest_path(StageId::Alignment)]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        let prior = ctx
            .store
            .require_manifest(StageId::ModelSelection, StageId::Alignment)?;

        let units: Vec<(String, GeneFamily)> = prior
            .families
            .iter()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();
        info!(
            "model selection: {} families, {} workers",
            units.len(),
            ctx.config.threads
        );

        let tools = ctx.tools.clone();
        let config = ctx.config.clone();
        let store = ctx.store.clone();
        let cancel = ctx.cancel.clone();
        let outcome = run_pool(
            units,
            ctx.config.threads,
            ctx.config.strict,
            ctx.cancel.clone(),
            move |family| {
                select_model(
                    family,
                    tools.clone(),
                    config.clone(),
                    store.clone(),
                    cancel.clone(),
                )
            },
        )
        .await?;

        let mut families = outcome.ok;
        families.sort_by(|a, b| a.id.cmp(&b.id));

        let mut manifest = StageManifest::new(StageId::ModelSelection);
        manifest.count("families_modeled", families.len() as u64);
        manifest.count("families_failed", outcome.failures.len() as u64);
        manifest.families = families;
        manifest.failures = outcome.failures;

        let report = StageReport {
            units_in: prior.families.len(),
            units_out: manifest.families.len(),
            failures: manifest.failures.len(),
            duration_ms: elapsed_ms(start),
            counts: manifest.counts.clone(),
        };
        ctx.store.write_manifest(&manifest)?;
        Ok(report)
    }
}

async fn select_model(
    mut family: GeneFamily,
    tools: Arc<Toolset>,
    config: Arc<PipelineConfig>,
    store: Arc<ArtifactStore>,
    cancel: CancellationToken,
) -> std::result::Result<GeneFamily, FamilyFailure> {
    let fail = |message: String| FamilyFailure {
        unit: family.id.clone(),
        tool: Tool::IqTree.name().to_string(),
        message,
        transient: false,
    };

    let alignment = match family.alignment.as_ref().filter(|p| p.exists()) {
        Some(path) => path.clone(),
        None => return Err(fail("filtered alignment missing on disk".to_string())),
    };
    let dir = store
        .ensure_family_dir(&family.id)
        .map_err(|e| fail(e.to_string()))?;
    let prefix = dir.join("model");

    let mut args = vec![
        "-s".to_string(),
        alignment.to_string_lossy().into_owned(),
        "-m".to_string(),
        "MF".to_string(),
        "-T".to_string(),
        "1".to_string(),
        "--prefix".to_string(),
        prefix.to_string_lossy().into_owned(),
        "--quiet".to_string(),
        "--redo".to_string(),
    ];
    if let Some(mset) = &config.model_set {
        args.push("--mset".to_string());
        args.push(mset.clone());
    }
    args.extend(config.passthrough.iqtree.iter().cloned());

    let inv = ToolInvocation::new(tools.path(Tool::IqTree), Tool::IqTree, args);
    run_for_unit(&inv, &family.id, config.tool_timeout, &cancel).await?;

    let report_path = dir.join("model.iqtree");
    let report = std::fs::read_to_string(&report_path)
        .map_err(|e| fail(format!("cannot read {}: {e}", report_path.display())))?;
    let model = parse_best_fit_model(&report)
        .ok_or_else(|| fail("no best-fit model line in report".to_string()))?;

    family.model = Some(model);
    Ok(family)
}

/// Extract the selected model from the tool report
/// (`Best-fit model according to BIC: LG+I+G4`).
pub(crate) fn parse_best_fit_model(report: &str) -> Option<String> {
    report
        .lines()
        .find(|line| line.starts_with("Best-fit model"))
        .and_then(|line| line.split(':').nth(1))
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
}
