use crate::error::{PipelineError, Result};
use crate::family::{FamilyFailure, GeneFamily};
use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Artifact written by every completed stage: the stage boundary contract.
/// The next stage consumes only this file (and the artifacts it names), which
/// is what makes resuming at any stage possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: StageId,
    pub written_at: DateTime<Utc>,
    /// Stage-level output files (combined FASTA, hit table, call table, ...).
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Surviving families with their accumulated artifact handles.
    #[serde(default)]
    pub families: Vec<GeneFamily>,
    /// Per-unit failures recorded (not fatal in non-strict mode).
    #[serde(default)]
    pub failures: Vec<FamilyFailure>,
    /// Stage counters: drops, exclusions, totals.
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

impl StageManifest {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            written_at: Utc::now(),
            outputs: Vec::new(),
            families: Vec::new(),
            failures: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn count(&mut self, key: &str, n: u64) {
        *self.counts.entry(key.to_string()).or_insert(0) += n;
    }
}

/// Path-addressed store for everything the pipeline writes under the output
/// directory. All layout decisions live here so stages agree on where
/// artifacts go.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn proteins_dir(&self) -> PathBuf {
        self.root.join("proteins")
    }

    pub fn protein_path(&self, tag: &str) -> PathBuf {
        self.proteins_dir().join(format!("{tag}.faa"))
    }

    /// Mapping from renamed sequence ids back to the source ids, one file
    /// per taxon tag.
    pub fn id_map_path(&self, tag: &str) -> PathBuf {
        self.proteins_dir().join(format!("{tag}.map.tsv"))
    }

    pub fn all_proteins_path(&self) -> PathBuf {
        self.proteins_dir().join("all.faa")
    }

    pub fn cluster_dir(&self) -> PathBuf {
        self.root.join("cluster")
    }

    pub fn diamond_db_prefix(&self) -> PathBuf {
        self.cluster_dir().join("proteins")
    }

    pub fn hits_path(&self) -> PathBuf {
        self.cluster_dir().join("hits.tsv")
    }

    pub fn family_dir(&self, family_id: &str) -> PathBuf {
        self.root.join("families").join(family_id)
    }

    pub fn ensure_family_dir(&self, family_id: &str) -> Result<PathBuf> {
        let dir = self.family_dir(family_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn calls_path(&self) -> PathBuf {
        self.root.join("calls.tsv")
    }

    pub fn annotated_genes_path(&self) -> PathBuf {
        self.root.join("genes_annotated.tsv")
    }

    pub fn blocks_path(&self) -> PathBuf {
        self.root.join("blocks.tsv")
    }

    pub fn run_path(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn manifest_path(&self, stage: StageId) -> PathBuf {
        self.root.join(stage.manifest_name())
    }

    pub fn write_manifest(&self, manifest: &StageManifest) -> Result<PathBuf> {
        let path = self.manifest_path(manifest.stage);
        let file = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(file, manifest)?;
        Ok(path)
    }

    pub fn load_manifest(&self, stage: StageId) -> Result<StageManifest> {
        let path = self.manifest_path(stage);
        let file = BufReader::new(File::open(&path)?);
        Ok(serde_json::from_reader(file)?)
    }

    /// Load the manifest `produced_by` wrote, failing with a prerequisite
    /// error naming the expected file when it is absent (resume with missing
    /// prior artifacts).
    pub fn require_manifest(
        &self,
        requesting: StageId,
        produced_by: StageId,
    ) -> Result<StageManifest> {
        let path = self.manifest_path(produced_by);
        if !path.exists() {
            return Err(PipelineError::MissingPrerequisite {
                stage: requesting.as_str().to_string(),
                path,
            });
        }
        self.load_manifest(produced_by)
    }
}
