use crate::artifact::{ArtifactStore, StageManifest};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::family::{FamilyFailure, GeneFamily};
use crate::filter::filter_alignment;
use crate::pipeline::{StageContext, StageHandler, StageReport};
use crate::process::{run_for_unit, ToolInvocation};
use crate::stage::StageId;
use crate::stages::elapsed_ms;
use crate::tools::{Tool, Toolset};
use crate::worker::run_pool;
use async_trait::async_trait;
use bio::io::fasta;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stage 3: align each family with the external aligner (stdout captured),
/// then apply the configured in-core column filter. Families whose filtered
/// alignment degenerates are excluded, counted, and not treated as failures.
pub struct AlignmentStage;

#[async_trait]
impl StageHandler for AlignmentStage {
    fn stage_id(&self) -> StageId {
        StageId::Alignment
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.store.manifest_path(StageId::Clustering)]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageReport> {
        let start = Instant::now();
        let prior = ctx
            .store
            .require_manifest(StageId::Alignment, StageId::Clustering)?;

        let units: Vec<(String, GeneFamily)> = prior
            .families
            .iter()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();
        info!(
            "alignment: {} families, {} workers, filter mode {}",
            units.len(),
            ctx.config.threads,
            ctx.config.filter_mode
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
                align_family(
                    family,
                    tools.clone(),
                    config.clone(),
                    store.clone(),
                    cancel.clone(),
                )
            },
        )
        .await?;

        let mut families = Vec::new();
        let mut degenerate = 0u64;
        for aligned in outcome.ok {
            match aligned {
                Some(family) => families.push(family),
                None => degenerate += 1,
            }
        }
        families.sort_by(|a, b| a.id.cmp(&b.id));

        let mut manifest = StageManifest::new(StageId::Alignment);
        manifest.count("families_aligned", families.len() as u64);
        manifest.count("families_degenerate", degenerate);
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

async fn align_family(
    mut family: GeneFamily,
    tools: Arc<Toolset>,
    config: Arc<PipelineConfig>,
    store: Arc<ArtifactStore>,
    cancel: CancellationToken,
) -> std::result::Result<Option<GeneFamily>, FamilyFailure> {
    let fail = |message: String| FamilyFailure {
        unit: family.id.clone(),
        tool: Tool::Mafft.name().to_string(),
        message,
        transient: false,
    };

    let input = match family.fasta.as_ref().filter(|p| p.exists()) {
        Some(path) => path.clone(),
        None => return Err(fail("family FASTA missing on disk".to_string())),
    };
    let dir = store
        .ensure_family_dir(&family.id)
        .map_err(|e| fail(e.to_string()))?;
    let aligned = dir.join("aligned.faa");

    let mut args = vec![
        "--auto".to_string(),
        "--thread".to_string(),
        "1".to_string(),
        "--quiet".to_string(),
    ];
    args.extend(config.passthrough.mafft.iter().cloned());
    args.push(input.to_string_lossy().into_owned());

    let inv = ToolInvocation::new(tools.path(Tool::Mafft), Tool::Mafft, args)
        .stdout_to(&aligned)
        .stderr_to(dir.join("mafft.log"));
    run_for_unit(&inv, &family.id, config.tool_timeout, &cancel).await?;

    let records = read_alignment(&aligned).map_err(|e| fail(e.to_string()))?;
    let filtered =
        filter_alignment(&records, config.filter_mode).map_err(|e| fail(e.to_string()))?;
    if filtered.is_degenerate() {
        return Ok(None);
    }

    let trimmed = dir.join("trimmed.faa");
    let mut writer =
        fasta::Writer::new(File::create(&trimmed).map_err(|e| fail(e.to_string()))?);
    for (id, seq) in &filtered.records {
        writer
            .write(id, None, seq)
            .map_err(|e| fail(e.to_string()))?;
    }
    drop(writer);

    family.alignment = Some(trimmed);
    Ok(Some(family))
}

fn read_alignment(path: &PathBuf) -> Result<Vec<(String, Vec<u8>)>> {
    let reader = fasta::Reader::new(File::open(path)?);
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        records.push((record.id().to_string(), record.seq().to_vec()));
    }
    Ok(records)
}
