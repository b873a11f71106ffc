//! Staged phylogenomic pipeline: build gene families across genomes, infer
//! per-family trees through external tools, call the nearest species/clade
//! for every target-genome gene, and paint the calls onto genome coordinates
//! as merged blocks.
//!
//! The seven stages (translation, clustering, alignment, model selection,
//! tree inference, taxa analysis, block analysis) communicate exclusively
//! through flat-file artifacts in the output directory, so a run can resume
//! at any stage boundary.

pub mod annotation;
pub mod artifact;
pub mod blocks;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod family;
pub mod filter;
pub mod infer;
pub mod newick;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod run;
pub mod stage;
pub mod stages;
pub mod tools;
pub mod worker;

pub use annotation::GeneRecord;
pub use artifact::{ArtifactStore, StageManifest};
pub use blocks::{detect_blocks, AnnotatedGene, GenomeBlock};
pub use config::{BlockGranularity, CountBounds, FilterMode, PipelineConfig};
pub use error::{FailureKind, PipelineError, Result};
pub use family::{FamilyFailure, GeneFamily};
pub use infer::{infer_family, NearestCall};
pub use newick::PhyloTree;
pub use orchestrator::{PipelineOrchestrator, PipelineOutcome};
pub use pipeline::{StageContext, StageHandler, StageReport};
pub use registry::{TaxonRecord, TaxonRegistry};
pub use run::{PipelineRun, RunState, RunStateMachine};
pub use stage::StageId;
pub use tools::{Tool, Toolset};
