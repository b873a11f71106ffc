use crate::error::{PipelineError, Result};
use crate::stage::StageId;
use std::path::PathBuf;
use std::time::Duration;

/// Inclusive bounds on a per-family count (distinct taxa or clades).
/// `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountBounds {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

impl CountBounds {
    pub fn new(min: Option<usize>, max: Option<usize>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, n: usize) -> bool {
        self.min.map_or(true, |m| n >= m) && self.max.map_or(true, |m| n <= m)
    }
}

/// Alignment column filtering applied between alignment and model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Keep the alignment as produced.
    None,
    /// Drop columns with more than 80% gaps.
    Relaxed,
    /// Drop columns with more than 50% gaps, then sequences left with more
    /// than 70% gaps.
    Strict,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::None => "none",
            FilterMode::Relaxed => "relaxed",
            FilterMode::Strict => "strict",
        }
    }
}

impl std::str::FromStr for FilterMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(FilterMode::None),
            "relaxed" => Ok(FilterMode::Relaxed),
            "strict" => Ok(FilterMode::Strict),
            _ => Err(PipelineError::config(format!(
                "unknown filter mode '{s}'; expected none, relaxed or strict"
            ))),
        }
    }
}

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Granularity at which nearest-relative calls are merged into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockGranularity {
    Clade,
    Species,
}

impl BlockGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockGranularity::Clade => "clade",
            BlockGranularity::Species => "species",
        }
    }
}

impl std::str::FromStr for BlockGranularity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clade" => Ok(BlockGranularity::Clade),
            "species" => Ok(BlockGranularity::Species),
            _ => Err(PipelineError::config(format!(
                "unknown block granularity '{s}'; expected clade or species"
            ))),
        }
    }
}

impl std::fmt::Display for BlockGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque per-tool argument lists appended verbatim to every invocation of
/// that tool. The core forwards them without interpretation.
#[derive(Debug, Clone, Default)]
pub struct ToolPassthrough {
    pub seqkit: Vec<String>,
    pub diamond: Vec<String>,
    pub mafft: Vec<String>,
    pub iqtree: Vec<String>,
}

/// Immutable run configuration, built once by the CLI and shared by every
/// stage handler.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub manifest: PathBuf,
    pub reference_taxon: String,
    pub annotation: PathBuf,
    pub out_dir: PathBuf,
    /// Worker pool size for per-family stages, capped at host CPU count.
    pub threads: usize,
    pub start_stage: StageId,
    /// Minimum bootstrap support for a node to anchor a nearest-relative call.
    pub min_bootstrap: u32,
    /// Ultrafast bootstrap replicates for tree inference (tool minimum 1000).
    pub bootstrap_replicates: u32,
    /// Similarity hit thresholds for family building.
    pub min_identity: f64,
    pub min_bitscore: f64,
    pub taxa_bounds: CountBounds,
    pub clade_bounds: CountBounds,
    pub filter_mode: FilterMode,
    pub block_granularity: BlockGranularity,
    /// Maximum uncalled genes tolerated inside a block.
    pub max_gap_genes: usize,
    /// Abort a stage on the first family failure instead of excluding the
    /// family.
    pub strict: bool,
    pub tool_timeout: Option<Duration>,
    /// NCBI translation table forwarded to the translation tool.
    pub genetic_code: u32,
    /// Substitution model search space (forwarded to model selection).
    pub model_set: Option<String>,
    pub passthrough: ToolPassthrough,
}

impl PipelineConfig {
    /// Clamp a requested worker count to [1, host CPUs]. A request of 0
    /// means "all CPUs".
    pub fn effective_threads(requested: usize) -> usize {
        let cpus = num_cpus::get().max(1);
        if requested == 0 {
            cpus
        } else {
            requested.min(cpus)
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("manifest.tsv"),
            reference_taxon: String::new(),
            annotation: PathBuf::from("annotation.gff3"),
            out_dir: PathBuf::from("cladepaint_out"),
            threads: Self::effective_threads(0),
            start_stage: StageId::Translation,
            min_bootstrap: 80,
            bootstrap_replicates: 1000,
            min_identity: 30.0,
            min_bitscore: 50.0,
            taxa_bounds: CountBounds::new(Some(3), None),
            clade_bounds: CountBounds::new(Some(2), None),
            filter_mode: FilterMode::Relaxed,
            block_granularity: BlockGranularity::Clade,
            max_gap_genes: 0,
            strict: false,
            tool_timeout: None,
            genetic_code: 1,
            model_set: None,
            passthrough: ToolPassthrough::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_count_bounds() {
        let bounds = CountBounds::new(Some(3), Some(10));
        assert!(!bounds.contains(2));
        assert!(bounds.contains(3));
        assert!(bounds.contains(10));
        assert!(!bounds.contains(11));

        let unbounded = CountBounds::default();
        assert!(unbounded.contains(0));
        assert!(unbounded.contains(usize::MAX));
    }

    #[test]
    fn test_effective_threads() {
        assert!(PipelineConfig::effective_threads(0) >= 1);
        assert_eq!(PipelineConfig::effective_threads(1), 1);
        assert!(PipelineConfig::effective_threads(usize::MAX) <= num_cpus::get());
    }

    #[test]
    fn test_filter_mode_roundtrip() {
        for mode in [FilterMode::None, FilterMode::Relaxed, FilterMode::Strict] {
            assert_eq!(FilterMode::from_str(mode.as_str()).unwrap(), mode);
        }
        assert!(FilterMode::from_str("aggressive").is_err());
    }

    #[test]
    fn test_block_granularity_roundtrip() {
        for g in [BlockGranularity::Clade, BlockGranularity::Species] {
            assert_eq!(BlockGranularity::from_str(g.as_str()).unwrap(), g);
        }
        assert!(BlockGranularity::from_str("genus").is_err());
    }
}
