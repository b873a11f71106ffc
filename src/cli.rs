use crate::config::{BlockGranularity, CountBounds, FilterMode, PipelineConfig, ToolPassthrough};
use crate::error::{PipelineError, Result};
use crate::stage::StageId;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Paint genome blocks by nearest phylogenetic relative: build gene
/// families across the manifest genomes, infer per-family trees, call the
/// closest species/clade for every target gene, and merge the calls into
/// annotated blocks.
#[derive(Debug, Parser)]
#[command(name = "cladepaint", version, about)]
pub struct Cli {
    /// Tab-separated manifest of input genomes: 5 columns
    /// (tag, species, ploidy, clade, path) or 3 columns (species, clade, path)
    #[arg(short = 'i', long)]
    pub manifest: PathBuf,

    /// Species name of the target genome; must appear in the manifest
    #[arg(short = 'r', long)]
    pub reference: String,

    /// GFF3 gene annotation of the target genome
    #[arg(short = 'a', long)]
    pub annotation: PathBuf,

    /// Output directory for all stage artifacts
    #[arg(short = 'o', long, default_value = "cladepaint_out")]
    pub out_dir: PathBuf,

    /// Worker pool size for per-family stages; 0 means all CPUs
    #[arg(short = 't', long, default_value_t = 0)]
    pub threads: usize,

    /// Stage to start from; earlier stages must have their artifacts on disk
    #[arg(long, value_name = "STAGE", default_value = "translation")]
    pub start_stage: StageId,

    /// Minimum bootstrap support for accepting a nearest-relative call
    #[arg(long, default_value_t = 80)]
    pub min_bootstrap: u32,

    /// Ultrafast bootstrap replicates for tree inference
    #[arg(long, default_value_t = 1000)]
    pub bootstrap_replicates: u32,

    /// Minimum percent identity for a similarity hit to become an edge
    #[arg(long, default_value_t = 30.0)]
    pub min_identity: f64,

    /// Minimum bitscore for a similarity hit to become an edge
    #[arg(long, default_value_t = 50.0)]
    pub min_bitscore: f64,

    /// Minimum distinct species per family
    #[arg(long, default_value_t = 3)]
    pub min_taxa: usize,

    /// Maximum distinct species per family
    #[arg(long)]
    pub max_taxa: Option<usize>,

    /// Minimum distinct clades per family
    #[arg(long, default_value_t = 2)]
    pub min_clades: usize,

    /// Maximum distinct clades per family
    #[arg(long)]
    pub max_clades: Option<usize>,

    /// Alignment column filtering mode: none, relaxed or strict
    #[arg(long, default_value = "relaxed")]
    pub filter: FilterMode,

    /// Merge blocks at clade or species granularity
    #[arg(long, default_value = "clade")]
    pub block_level: BlockGranularity,

    /// Maximum uncalled genes tolerated inside a block
    #[arg(long, default_value_t = 0)]
    pub max_gap_genes: usize,

    /// Abort a stage on the first family failure instead of excluding the
    /// family
    #[arg(long)]
    pub strict: bool,

    /// Per-invocation timeout for external tools, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub tool_timeout: Option<u64>,

    /// NCBI genetic code table used for translation
    #[arg(long, default_value_t = 1)]
    pub genetic_code: u32,

    /// Restrict the substitution model search space (forwarded as --mset)
    #[arg(long)]
    pub model_set: Option<String>,

    /// Extra arguments appended to every translation tool invocation
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub seqkit_args: Option<String>,

    /// Extra arguments appended to every similarity search invocation
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub diamond_args: Option<String>,

    /// Extra arguments appended to every aligner invocation
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub mafft_args: Option<String>,

    /// Extra arguments appended to every model/tree tool invocation
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub iqtree_args: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

fn split_args(args: Option<String>) -> Vec<String> {
    args.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

impl Cli {
    pub fn into_config(self) -> Result<PipelineConfig> {
        if self.reference.trim().is_empty() || self.reference.contains(char::is_whitespace) {
            return Err(PipelineError::config(format!(
                "reference taxon '{}' must be non-empty and contain no whitespace \
                 (use underscores as in the manifest)",
                self.reference
            )));
        }
        if !self.manifest.exists() {
            return Err(PipelineError::config(format!(
                "manifest file does not exist: {}",
                self.manifest.display()
            )));
        }
        if !self.annotation.exists() {
            return Err(PipelineError::config(format!(
                "annotation file does not exist: {}",
                self.annotation.display()
            )));
        }
        if self.max_taxa.map_or(false, |max| max < self.min_taxa) {
            return Err(PipelineError::config(format!(
                "--max-taxa {} is below --min-taxa {}",
                self.max_taxa.unwrap(),
                self.min_taxa
            )));
        }
        if self.max_clades.map_or(false, |max| max < self.min_clades) {
            return Err(PipelineError::config(format!(
                "--max-clades {} is below --min-clades {}",
                self.max_clades.unwrap(),
                self.min_clades
            )));
        }

        let mut bootstrap_replicates = self.bootstrap_replicates;
        if bootstrap_replicates < 1000 {
            warn!(
                "ultrafast bootstrap requires at least 1000 replicates; raising {} to 1000",
                bootstrap_replicates
            );
            bootstrap_replicates = 1000;
        }

        Ok(PipelineConfig {
            manifest: self.manifest,
            reference_taxon: self.reference,
            annotation: self.annotation,
            out_dir: self.out_dir,
            threads: PipelineConfig::effective_threads(self.threads),
            start_stage: self.start_stage,
            min_bootstrap: self.min_bootstrap,
            bootstrap_replicates,
            min_identity: self.min_identity,
            min_bitscore: self.min_bitscore,
            taxa_bounds: CountBounds::new(Some(self.min_taxa), self.max_taxa),
            clade_bounds: CountBounds::new(Some(self.min_clades), self.max_clades),
            filter_mode: self.filter,
            block_granularity: self.block_level,
            max_gap_genes: self.max_gap_genes,
            strict: self.strict,
            tool_timeout: self.tool_timeout.map(Duration::from_secs),
            genetic_code: self.genetic_code,
            model_set: self.model_set,
            passthrough: ToolPassthrough {
                seqkit: split_args(self.seqkit_args),
                diamond: split_args(self.diamond_args),
                mafft: split_args(self.mafft_args),
                iqtree: split_args(self.iqtree_args),
            },
        })
    }
}
