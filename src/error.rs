use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("manifest line {line}: expected {expected} tab-separated columns (5-column tagged or 3-column untagged schema), found {found}")]
    Schema {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("duplicate tag '{0}' in manifest; tags must be globally unique")]
    DuplicateTag(String),

    #[error("invalid tag '{0}'; tags must be 1-8 alphanumeric characters")]
    TagFormat(String),

    #[error("source file for tag '{tag}' does not exist: {path}")]
    MissingFile { tag: String, path: PathBuf },

    #[error("species '{species}' re-declared with conflicting {field}: '{first}' vs '{second}'")]
    SpeciesMetadataConflict {
        species: String,
        field: &'static str,
        first: String,
        second: String,
    },

    #[error("reference taxon '{0}' does not match any species in the manifest")]
    UnknownReferenceTaxon(String),

    #[error("required executable '{executable}' for {tool} not found; set {env_var} to its directory or add it to PATH")]
    ExecutableNotFound {
        tool: String,
        executable: String,
        env_var: String,
    },

    #[error("stage {stage} requires missing artifact: {path}")]
    MissingPrerequisite { stage: String, path: PathBuf },

    #[error("family {family}: {tool} failed: {message}")]
    FamilyProcessing {
        family: String,
        tool: String,
        message: String,
        transient: bool,
    },

    #[error("{tool} failed: {message}")]
    External { tool: String, message: String },

    #[error("invalid run state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Classification used by the orchestrator when recording a failed run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::FamilyProcessing { transient: true, .. } => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }
}

/// Failure category for per-family retry decisions: a transient failure is
/// retried once, a fatal one is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
