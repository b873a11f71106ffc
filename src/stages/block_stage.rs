use crate::annotation::read_gene_annotation;
use crate::artifact::StageManifest;
use crate::blocks::{detect_blocks, write_annotated_genes, write_blocks};
use crate::error::{PipelineError, Result};
use crate::infer::read_calls;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::stage::StageId;
use crate::stages::elapsed_ms;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Stage 7 (terminal): join calls to the reference annotation, translate
/// renamed sequence ids back to source gene ids, and merge per-gene calls
/// into contiguous blocks.
pub struct BlockAnalysisStage;

#[async_trait]
impl StageHandler for BlockAnalysisStage {
    fn stage_id(&self) -> StageId {
        StageId::BlockAnalysis
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        let mut inputs = vec![
            ctx.store.manifest_path(StageId::TaxaAnalysis),
            ctx.store.calls_path(),
            ctx.config.annotation.clone(),
        ];
        for tag in ctx.registry.tags_for_species(&ctx.config.reference_taxon) {
            inputs.push(ctx.store.id_map_path(tag));
        }
        inputs
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        ctx.store
            .require_manifest(StageId::BlockAnalysis, StageId::TaxaAnalysis)?;

        let mut calls = read_calls(&ctx.store.calls_path())?;
        let genes = read_gene_annotation(&ctx.config.annotation)?;
        info!(
            "block analysis: {} calls, {} annotated genes, gap limit {}",
            calls.len(),
            genes.len(),
            ctx.config.max_gap_genes
        );

        // Calls carry renamed sequence ids; the annotation speaks in source
        // ids. Translate through the per-taxon id maps of the target.
        let mut id_map = HashMap::new();
        for tag in ctx.registry.tags_for_species(&ctx.config.reference_taxon) {
            let path = ctx.store.id_map_path(tag);
            if !path.exists() {
                return Err(PipelineError::MissingPrerequisite {
                    stage: StageId::BlockAnalysis.as_str().to_string(),
                    path,
                });
            }
            read_id_map(&path, &mut id_map)?;
        }
        let mut unmapped = 0u64;
        for call in &mut calls {
            match id_map.get(&call.gene) {
                Some(source_id) => call.gene = source_id.clone(),
                None => unmapped += 1,
            }
        }
        if unmapped > 0 {
            warn!("{unmapped} calls had no id-map entry and keep their internal ids");
        }

        let outcome = detect_blocks(
            &genes,
            &calls,
            ctx.config.block_granularity,
            ctx.config.max_gap_genes,
        );
        let annotated_path = ctx.store.annotated_genes_path();
        let blocks_path = ctx.store.blocks_path();
        write_annotated_genes(&annotated_path, &outcome.annotated)?;
        write_blocks(&blocks_path, &outcome.blocks)?;
        info!(
            "block analysis: {} blocks over {} called genes ({} uncalled)",
            outcome.blocks.len(),
            outcome.called_genes,
            outcome.uncalled_genes
        );

        let mut manifest = StageManifest::new(StageId::BlockAnalysis);
        manifest.outputs.push(annotated_path);
        manifest.outputs.push(blocks_path);
        manifest.count("blocks", outcome.blocks.len() as u64);
        manifest.count("called_genes", outcome.called_genes);
        manifest.count("uncalled_genes", outcome.uncalled_genes);
        manifest.count("unplaced_calls", outcome.unplaced_calls);
        manifest.count("unmapped_call_ids", unmapped);

        let report = StageReport {
            units_in: calls.len(),
            units_out: outcome.blocks.len(),
            failures: 0,
            duration_ms: elapsed_ms(start),
            counts: manifest.counts.clone(),
        };
        ctx.store.write_manifest(&manifest)?;
        Ok(report)
    }
}

fn read_id_map(path: &Path, map: &mut HashMap<String, String>) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;
    for record in reader.records() {
        let record = record?;
        if record.len() >= 2 {
            map.insert(record[0].to_string(), record[1].to_string());
        }
    }
    Ok(())
}
