mod align_stage;
mod block_stage;
mod cluster_stage;
mod model_stage;
mod taxa_stage;
mod translate_stage;
mod tree_stage;

pub use align_stage::AlignmentStage;
pub use block_stage::BlockAnalysisStage;
pub use cluster_stage::ClusteringStage;
pub use model_stage::ModelSelectionStage;
pub use taxa_stage::TaxaAnalysisStage;
pub use translate_stage::TranslationStage;
pub use tree_stage::TreeInferenceStage;

pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
