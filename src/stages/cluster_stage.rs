use crate::artifact::StageManifest;
use crate::cluster::{build_families, filter_families, read_hits};
use crate::error::{PipelineError, Result};
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::process::{run_tool, ToolInvocation};
use crate::stage::StageId;
use crate::stages::elapsed_ms;
use crate::tools::Tool;
use async_trait::async_trait;
use bio::io::fasta;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// Stage 2: all-vs-all protein search via the external search tool, then
/// in-core graph clustering of the hits into gene families, taxa/clade
/// filtering, and one FASTA per surviving family.
pub struct ClusteringStage;

#[async_trait]
impl StageHandler for ClusteringStage {
    fn stage_id(&self) -> StageId {
        StageId::Clustering
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![
            ctx.store.manifest_path(StageId::Translation),
            ctx.store.all_proteins_path(),
        ]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        ctx.store
            .require_manifest(StageId::Clustering, StageId::Translation)?;
        std::fs::create_dir_all(ctx.store.cluster_dir())?;

        let all = ctx.store.all_proteins_path();
        let db = ctx.store.diamond_db_prefix();
        let hits_path = ctx.store.hits_path();
        let threads = ctx.config.threads.to_string();

        let makedb_args = vec![
            "makedb".to_string(),
            "--in".to_string(),
            all.to_string_lossy().into_owned(),
            "--db".to_string(),
            db.to_string_lossy().into_owned(),
            "--threads".to_string(),
            threads.clone(),
        ];
        let makedb = ToolInvocation::new(ctx.tools.path(Tool::Diamond), Tool::Diamond, makedb_args);
        run_tool(&makedb, ctx.config.tool_timeout, &ctx.cancel)
            .await
            .map_err(|f| f.into_error())?;

        let mut blastp_args = vec![
            "blastp".to_string(),
            "--query".to_string(),
            all.to_string_lossy().into_owned(),
            "--db".to_string(),
            db.to_string_lossy().into_owned(),
            "--out".to_string(),
            hits_path.to_string_lossy().into_owned(),
            "--outfmt".to_string(),
            "6".to_string(),
            "qseqid".to_string(),
            "sseqid".to_string(),
            "pident".to_string(),
            "bitscore".to_string(),
            "--threads".to_string(),
            threads,
            "--max-target-seqs".to_string(),
            "0".to_string(),
        ];
        blastp_args.extend(ctx.config.passthrough.diamond.iter().cloned());
        let blastp = ToolInvocation::new(ctx.tools.path(Tool::Diamond), Tool::Diamond, blastp_args);
        run_tool(&blastp, ctx.config.tool_timeout, &ctx.cancel)
            .await
            .map_err(|f| f.into_error())?;

        let hits = read_hits(&hits_path)?;
        let built = build_families(&hits, ctx.config.min_identity, ctx.config.min_bitscore);
        let built_count = built.len();
        info!(
            "clustering: {} hits, {} candidate families",
            hits.len(),
            built_count
        );

        let outcome = filter_families(
            built,
            &ctx.registry,
            ctx.config.taxa_bounds,
            ctx.config.clade_bounds,
        );

        let sequences = load_proteins(&all)?;
        let mut families = outcome.kept;
        let mut sequences_in_families = 0u64;
        for family in &mut families {
            let dir = ctx.store.ensure_family_dir(&family.id)?;
            let fasta_path = dir.join("family.faa");
            let mut writer = fasta::Writer::new(File::create(&fasta_path)?);
            for member in &family.members {
                let record = sequences.get(member).ok_or_else(|| {
                    PipelineError::parse(format!(
                        "family {} member '{}' not present in {}",
                        family.id,
                        member,
                        all.display()
                    ))
                })?;
                writer.write_record(record)?;
                sequences_in_families += 1;
            }
            family.fasta = Some(fasta_path);
        }

        let mut manifest = StageManifest::new(StageId::Clustering);
        manifest.outputs.push(hits_path);
        manifest.count("hits_total", hits.len() as u64);
        manifest.count("families_built", built_count as u64);
        manifest.count("families_kept", families.len() as u64);
        manifest.count("dropped_taxa_filter", outcome.dropped_taxa);
        manifest.count("dropped_clade_filter", outcome.dropped_clades);
        manifest.count("sequences_in_families", sequences_in_families);
        manifest.families = families;

        let report = StageReport {
            units_in: built_count,
            units_out: manifest.families.len(),
            failures: 0,
            duration_ms: elapsed_ms(start),
            counts: manifest.counts.clone(),
        };
        ctx.store.write_manifest(&manifest)?;
        Ok(report)
    }
}

fn load_proteins(path: &PathBuf) -> Result<HashMap<String, fasta::Record>> {
    let reader = fasta::Reader::new(File::open(path)?);
    let mut sequences = HashMap::new();
    for record in reader.records() {
        let record = record?;
        sequences.insert(record.id().to_string(), record);
    }
    Ok(sequences)
}
