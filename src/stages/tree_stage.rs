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

/// Stage 5: per-family ML tree inference with ultrafast bootstrap, using
/// the model selected in the previous stage.
pub struct TreeInferenceStage;

#[async_trait]
impl StageHandler for TreeInferenceStage {
    fn stage_id(&self) -> StageId {
        StageId::TreeInference
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.store.manifest_path(StageId::ModelSelection)]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        let prior = ctx
            .store
            .require_manifest(StageId::TreeInference, StageId::ModelSelection)?;

        let units: Vec<(String, GeneFamily)> = prior
            .families
            .iter()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();
        info!(
            "tree inference: {} families, {} workers, {} bootstrap replicates",
            units.len(),
            ctx.config.threads,
            ctx.config.bootstrap_replicates
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
                infer_tree(
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

        let mut manifest = StageManifest::new(StageId::TreeInference);
        manifest.count("trees_inferred", families.len() as u64);
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

async fn infer_tree(
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
    let model = match &family.model {
        Some(model) => model.clone(),
        None => return Err(fail("no substitution model recorded".to_string())),
    };
    let dir = store
        .ensure_family_dir(&family.id)
        .map_err(|e| fail(e.to_string()))?;
    let prefix = dir.join("tree");

    let mut args = vec![
        "-s".to_string(),
        alignment.to_string_lossy().into_owned(),
        "-m".to_string(),
        model,
        "-B".to_string(),
        config.bootstrap_replicates.to_string(),
        "-T".to_string(),
        "1".to_string(),
        "--prefix".to_string(),
        prefix.to_string_lossy().into_owned(),
        "--quiet".to_string(),
        "--redo".to_string(),
    ];
    args.extend(config.passthrough.iqtree.iter().cloned());

    let inv = ToolInvocation::new(tools.path(Tool::IqTree), Tool::IqTree, args);
    run_for_unit(&inv, &family.id, config.tool_timeout, &cancel).await?;

    let treefile = dir.join("tree.treefile");
    if !treefile.exists() {
        return Err(fail(format!(
            "expected tree file not produced: {}",
            treefile.display()
        )));
    }

    family.tree = Some(treefile);
    Ok(family)
}
