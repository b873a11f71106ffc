use crate::artifact::{ArtifactStore, StageManifest};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::family::FamilyFailure;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::process::{run_for_unit, ToolInvocation};
use crate::registry::TaxonRecord;
use crate::stage::StageId;
use crate::tools::{Tool, Toolset};
use crate::worker::run_pool;
use crate::stages::elapsed_ms;
use async_trait::async_trait;
use bio::io::fasta;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stage 1: translate every source sequence file to protein, renaming
/// sequences to `{tag}_{ordinal}` so downstream stages can recover the
/// originating taxon from any sequence id. Writes one protein file and one
/// id-map per taxon plus the combined search input.
pub struct TranslationStage;

struct TranslatedTaxon {
    tag: String,
    proteins: PathBuf,
    id_map: PathBuf,
    sequences: u64,
}

#[async_trait]
impl StageHandler for TranslationStage {
    fn stage_id(&self) -> StageId {
        StageId::Translation
    }

    fn required_inputs(&self, _ctx: &StageContext) -> Vec<PathBuf> {
        // Source files were validated during manifest parse.
        vec![]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        std::fs::create_dir_all(ctx.store.proteins_dir())?;

        let records = ctx.registry.records().to_vec();
        let units: Vec<(String, TaxonRecord)> = records
            .iter()
            .map(|r| (r.tag.clone(), r.clone()))
            .collect();
        info!(
            "translation: {} source files, {} workers",
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
            move |record| {
                translate_taxon(
                    record,
                    tools.clone(),
                    config.clone(),
                    store.clone(),
                    cancel.clone(),
                )
            },
        )
        .await?;

        // Nothing downstream can succeed without the target taxon.
        let reference_tags = ctx.registry.tags_for_species(&ctx.config.reference_taxon);
        if !reference_tags
            .iter()
            .any(|tag| outcome.ok.iter().any(|t| t.tag == *tag))
        {
            return Err(PipelineError::config(format!(
                "translation failed for every source of reference taxon '{}'",
                ctx.config.reference_taxon
            )));
        }

        let all_path = ctx.store.all_proteins_path();
        let mut all = File::create(&all_path)?;
        for taxon in &outcome.ok {
            let mut part = File::open(&taxon.proteins)?;
            std::io::copy(&mut part, &mut all)?;
        }

        let mut manifest = StageManifest::new(StageId::Translation);
        manifest.outputs.push(all_path);
        for taxon in &outcome.ok {
            manifest.outputs.push(taxon.proteins.clone());
            manifest.outputs.push(taxon.id_map.clone());
            manifest.count("sequences_translated", taxon.sequences);
        }
        manifest.count("taxa_translated", outcome.ok.len() as u64);
        manifest.count("taxa_failed", outcome.failures.len() as u64);
        manifest.failures = outcome.failures;

        let report = StageReport {
            units_in: records.len(),
            units_out: outcome.ok.len(),
            failures: manifest.failures.len(),
            duration_ms: elapsed_ms(start),
            counts: manifest.counts.clone(),
        };
        ctx.store.write_manifest(&manifest)?;
        Ok(report)
    }
}

async fn translate_taxon(
    record: TaxonRecord,
    tools: Arc<Toolset>,
    config: Arc<PipelineConfig>,
    store: Arc<ArtifactStore>,
    cancel: CancellationToken,
) -> std::result::Result<TranslatedTaxon, FamilyFailure> {
    let fail = |message: String| FamilyFailure {
        unit: record.tag.clone(),
        tool: Tool::SeqKit.name().to_string(),
        message,
        transient: false,
    };

    let raw = store
        .proteins_dir()
        .join(format!("{}.seqkit.faa", record.tag));
    let mut args = vec![
        "translate".to_string(),
        "--transl-table".to_string(),
        config.genetic_code.to_string(),
        "--trim".to_string(),
        "-o".to_string(),
        raw.to_string_lossy().into_owned(),
    ];
    args.extend(config.passthrough.seqkit.iter().cloned());
    args.push(record.source.to_string_lossy().into_owned());

    let inv = ToolInvocation::new(tools.path(Tool::SeqKit), Tool::SeqKit, args);
    run_for_unit(&inv, &record.tag, config.tool_timeout, &cancel).await?;

    let proteins = store.protein_path(&record.tag);
    let id_map = store.id_map_path(&record.tag);
    let sequences = rewrite_sequence_ids(&record.tag, &raw, &proteins, &id_map)
        .map_err(|e| fail(format!("renaming translated sequences: {e}")))?;
    let _ = std::fs::remove_file(&raw);

    if sequences == 0 {
        return Err(fail("translation produced no sequences".to_string()));
    }

    Ok(TranslatedTaxon {
        tag: record.tag.clone(),
        proteins,
        id_map,
        sequences,
    })
}

/// Rewrite translated sequence ids to `{tag}_{ordinal}` (original id kept
/// as the description) and record the mapping back to source ids.
fn rewrite_sequence_ids(
    tag: &str,
    input: &PathBuf,
    output: &PathBuf,
    id_map: &PathBuf,
) -> Result<u64> {
    let reader = fasta::Reader::new(File::open(input)?);
    let mut writer = fasta::Writer::new(File::create(output)?);
    let mut map = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(id_map)?;

    let mut count = 0u64;
    for record in reader.records() {
        let record = record?;
        count += 1;
        let new_id = format!("{tag}_{count:06}");
        writer.write(&new_id, Some(record.id()), record.seq())?;
        map.write_record([new_id.as_str(), record.id()])?;
    }
    map.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_sequence_ids() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.faa");
        let output = dir.path().join("out.faa");
        let id_map = dir.path().join("map.tsv");
        std::fs::write(&input, ">AT1G01010.1 some desc\nMKLV\n>AT1G01020.1\nMQQR\n").unwrap();

        let count = rewrite_sequence_ids("ATH1", &input, &output, &id_map).unwrap();
        assert_eq!(count, 2);

        let reader = fasta::Reader::new(File::open(&output).unwrap());
        let records: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records[0].id(), "ATH1_000001");
        assert_eq!(records[0].desc(), Some("AT1G01010.1"));
        assert_eq!(records[1].id(), "ATH1_000002");

        let map = std::fs::read_to_string(&id_map).unwrap();
        assert!(map.contains("ATH1_000001\tAT1G01010.1"));
        assert!(map.contains("ATH1_000002\tAT1G01020.1"));
    }
}
