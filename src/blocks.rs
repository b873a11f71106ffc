use crate::annotation::GeneRecord;
use crate::config::BlockGranularity;
use crate::error::Result;
use crate::infer::NearestCall;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// A contiguous genome region where consecutive called genes agree on the
/// nearest relative. Immutable once closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeBlock {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub call: String,
    /// Called member genes, ordered by coordinate.
    pub genes: Vec<String>,
}

/// Annotated copy of one reference gene record with its call attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedGene {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub gene: String,
    pub call: Option<String>,
    pub species: Option<String>,
    pub support: Option<f64>,
}

#[derive(Debug, Default)]
pub struct BlockOutcome {
    pub blocks: Vec<GenomeBlock>,
    pub annotated: Vec<AnnotatedGene>,
    pub called_genes: u64,
    pub uncalled_genes: u64,
    /// Calls whose gene id is absent from the annotation.
    pub unplaced_calls: u64,
}

struct OpenBlock {
    chrom: String,
    call: String,
    start: u64,
    end: u64,
    genes: Vec<String>,
    gap: usize,
}

/// Project calls onto genome coordinates and merge them into blocks.
///
/// Genes are scanned in (chromosome, start) order. A called gene extends the
/// open block when its call matches and at most `max_gap_genes` uncalled
/// genes intervened since the last member; a differing call or a chromosome
/// change always closes the block. Genes with more than one call (multiple
/// families) take the highest-support call, ties broken by call label then
/// family id.
pub fn detect_blocks(
    genes: &[GeneRecord],
    calls: &[NearestCall],
    granularity: BlockGranularity,
    max_gap_genes: usize,
) -> BlockOutcome {
    let annotated_ids: HashSet<&str> = genes.iter().map(|g| g.gene.as_str()).collect();

    // Best call per gene.
    let mut best: HashMap<&str, &NearestCall> = HashMap::new();
    let mut unplaced = 0u64;
    for call in calls {
        if !annotated_ids.contains(call.gene.as_str()) {
            unplaced += 1;
            continue;
        }
        best.entry(call.gene.as_str())
            .and_modify(|cur| {
                if prefer(call, cur, granularity) {
                    *cur = call;
                }
            })
            .or_insert(call);
    }
    if unplaced > 0 {
        warn!("{unplaced} calls reference genes absent from the annotation");
    }

    let ordered_genes: Vec<&GeneRecord> = genes
        .iter()
        .sorted_by(|a, b| {
            a.chrom
                .cmp(&b.chrom)
                .then(a.start.cmp(&b.start))
                .then(a.end.cmp(&b.end))
                .then(a.gene.cmp(&b.gene))
        })
        .collect();

    let mut outcome = BlockOutcome {
        unplaced_calls: unplaced,
        ..Default::default()
    };
    let mut open: Option<OpenBlock> = None;

    for gene in ordered_genes {
        let call = best.get(gene.gene.as_str()).copied();

        if let Some(block) = &open {
            if block.chrom != gene.chrom {
                outcome.blocks.push(close(open.take().unwrap()));
            }
        }

        match call {
            Some(call) => {
                outcome.called_genes += 1;
                let label = call_label(call, granularity);
                let extend = open
                    .as_ref()
                    .map_or(false, |b| b.call == label && b.gap <= max_gap_genes);
                if extend {
                    let block = open.as_mut().unwrap();
                    block.end = block.end.max(gene.end);
                    block.genes.push(gene.gene.clone());
                    block.gap = 0;
                } else {
                    if let Some(block) = open.take() {
                        outcome.blocks.push(close(block));
                    }
                    open = Some(OpenBlock {
                        chrom: gene.chrom.clone(),
                        call: label.to_string(),
                        start: gene.start,
                        end: gene.end,
                        genes: vec![gene.gene.clone()],
                        gap: 0,
                    });
                }
                outcome.annotated.push(AnnotatedGene {
                    chrom: gene.chrom.clone(),
                    start: gene.start,
                    end: gene.end,
                    gene: gene.gene.clone(),
                    call: Some(label.to_string()),
                    species: Some(call.species.clone()),
                    support: Some(call.support),
                });
            }
            None => {
                outcome.uncalled_genes += 1;
                if let Some(block) = open.as_mut() {
                    block.gap += 1;
                    if block.gap > max_gap_genes {
                        outcome.blocks.push(close(open.take().unwrap()));
                    }
                }
                outcome.annotated.push(AnnotatedGene {
                    chrom: gene.chrom.clone(),
                    start: gene.start,
                    end: gene.end,
                    gene: gene.gene.clone(),
                    call: None,
                    species: None,
                    support: None,
                });
            }
        }
    }
    if let Some(block) = open.take() {
        outcome.blocks.push(close(block));
    }
    outcome
}

fn close(block: OpenBlock) -> GenomeBlock {
    GenomeBlock {
        chrom: block.chrom,
        start: block.start,
        end: block.end,
        call: block.call,
        genes: block.genes,
    }
}

fn call_label(call: &NearestCall, granularity: BlockGranularity) -> &str {
    match granularity {
        BlockGranularity::Clade => &call.clade,
        BlockGranularity::Species => &call.species,
    }
}

/// Deterministic conflict resolution for genes with calls from several
/// families: higher support wins, ties break on call label then family id.
fn prefer(candidate: &NearestCall, current: &NearestCall, granularity: BlockGranularity) -> bool {
    match candidate.support.partial_cmp(&current.support) {
        Some(std::cmp::Ordering::Greater) => true,
        Some(std::cmp::Ordering::Less) => false,
        _ => {
            (call_label(candidate, granularity), candidate.family.as_str())
                < (call_label(current, granularity), current.family.as_str())
        }
    }
}

pub fn write_blocks(path: &Path, blocks: &[GenomeBlock]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(["chrom", "start", "end", "call", "n_genes", "genes"])?;
    for block in blocks {
        writer.write_record([
            block.chrom.clone(),
            block.start.to_string(),
            block.end.to_string(),
            block.call.clone(),
            block.genes.len().to_string(),
            block.genes.iter().join(","),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_annotated_genes(path: &Path, genes: &[AnnotatedGene]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(["chrom", "start", "end", "gene", "call", "species", "support"])?;
    for gene in genes {
        writer.write_record([
            gene.chrom.clone(),
            gene.start.to_string(),
            gene.end.to_string(),
            gene.gene.clone(),
            gene.call.clone().unwrap_or_else(|| "NA".to_string()),
            gene.species.clone().unwrap_or_else(|| "NA".to_string()),
            gene.support
                .map(|s| s.to_string())
                .unwrap_or_else(|| "NA".to_string()),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
