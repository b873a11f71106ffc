use crate::artifact::StageManifest;
use crate::error::{PipelineError, Result};
use crate::family::{FamilyFailure, GeneFamily};
use crate::infer::{infer_family, write_calls, NearestCall};
use crate::newick::PhyloTree;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::stage::StageId;
use crate::stages::elapsed_ms;
use async_trait::async_trait;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// Stage 6: walk every family tree and emit one nearest-relative call per
/// adequately supported target-taxon leaf. Pure CPU work, parallelized over
/// families with the same thread budget as the tool stages.
pub struct TaxaAnalysisStage;

#[async_trait]
impl StageHandler for TaxaAnalysisStage {
    fn stage_id(&self) -> StageId {
        StageId::TaxaAnalysis
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.store.manifest_path(StageId::TreeInference)]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        let prior = ctx
            .store
            .require_manifest(StageId::TaxaAnalysis, StageId::TreeInference)?;
        info!(
            "taxa analysis: {} trees, threshold {}",
            prior.families.len(),
            ctx.config.min_bootstrap
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.config.threads)
            .build()
            .map_err(|e| PipelineError::config(format!("cannot build analysis pool: {e}")))?;

        let registry = &ctx.registry;
        let target = &ctx.config.reference_taxon;
        let min_support = ctx.config.min_bootstrap as f64;
        let results: Vec<std::result::Result<(GeneFamily, Vec<NearestCall>, u64), FamilyFailure>> =
            pool.install(|| {
                prior
                    .families
                    .par_iter()
                    .map(|family| {
                        let treefile = family.tree.as_ref().filter(|p| p.exists()).ok_or_else(
                            || FamilyFailure {
                                unit: family.id.clone(),
                                tool: String::new(),
                                message: "tree file missing on disk".to_string(),
                                transient: false,
                            },
                        )?;
                        let tree =
                            PhyloTree::from_file(treefile).map_err(|e| FamilyFailure {
                                unit: family.id.clone(),
                                tool: String::new(),
                                message: format!("unreadable tree: {e}"),
                                transient: false,
                            })?;
                        let outcome =
                            infer_family(&tree, &family.id, registry, target, min_support);
                        Ok((family.clone(), outcome.calls, outcome.low_confidence))
                    })
                    .collect()
            });

        let mut families = Vec::new();
        let mut calls = Vec::new();
        let mut low_confidence = 0u64;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok((family, family_calls, excluded)) => {
                    families.push(family);
                    calls.extend(family_calls);
                    low_confidence += excluded;
                }
                Err(failure) => failures.push(failure),
            }
        }
        if ctx.config.strict {
            if let Some(first) = failures.first() {
                return Err(PipelineError::FamilyProcessing {
                    family: first.unit.clone(),
                    tool: first.tool.clone(),
                    message: first.message.clone(),
                    transient: first.transient,
                });
            }
        }

        calls.sort_by(|a, b| a.gene.cmp(&b.gene).then_with(|| a.family.cmp(&b.family)));
        let calls_path = ctx.store.calls_path();
        write_calls(&calls_path, &calls)?;
        info!(
            "taxa analysis: {} calls, {} low-confidence leaves excluded",
            calls.len(),
            low_confidence
        );

        let mut manifest = StageManifest::new(StageId::TaxaAnalysis);
        manifest.outputs.push(calls_path);
        manifest.count("calls_emitted", calls.len() as u64);
        manifest.count("low_confidence_excluded", low_confidence);
        manifest.count("families_failed", failures.len() as u64);
        manifest.families = families;
        manifest.failures = failures;

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
