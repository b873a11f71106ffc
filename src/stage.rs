use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// The seven pipeline stages, in execution order. A run may start at any
/// stage; everything before the start point is assumed complete on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Translation,
    Clustering,
    Alignment,
    ModelSelection,
    TreeInference,
    TaxaAnalysis,
    BlockAnalysis,
}

impl StageId {
    pub const ORDER: [StageId; 7] = [
        StageId::Translation,
        StageId::Clustering,
        StageId::Alignment,
        StageId::ModelSelection,
        StageId::TreeInference,
        StageId::TaxaAnalysis,
        StageId::BlockAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Translation => "translation",
            StageId::Clustering => "clustering",
            StageId::Alignment => "alignment",
            StageId::ModelSelection => "model-selection",
            StageId::TreeInference => "tree-inference",
            StageId::TaxaAnalysis => "taxa-analysis",
            StageId::BlockAnalysis => "block-analysis",
        }
    }

    /// Position in the execution order, 0-based.
    pub fn ordinal(&self) -> usize {
        Self::ORDER.iter().position(|s| s == self).unwrap()
    }

    pub fn previous(&self) -> Option<StageId> {
        self.ordinal().checked_sub(1).map(|i| Self::ORDER[i])
    }

    /// The suffix of the execution order starting at `start`.
    pub fn sequence_from(start: StageId) -> &'static [StageId] {
        &Self::ORDER[start.ordinal()..]
    }

    /// File name of the manifest this stage writes on completion.
    pub fn manifest_name(&self) -> String {
        format!("{}.manifest.json", self.as_str())
    }

    /// True for stages that fan work out per gene family (or per taxon).
    pub fn is_per_family(&self) -> bool {
        !matches!(self, StageId::Clustering | StageId::BlockAnalysis)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        StageId::ORDER
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "unknown stage '{}'; expected one of: {}",
                    s,
                    StageId::ORDER
                        .iter()
                        .map(|st| st.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}
