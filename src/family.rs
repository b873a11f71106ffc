use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::registry::TaxonRegistry;

/// A cluster of homologous sequences across taxa: the unit of per-family
/// work. Downstream stages append one artifact handle each; members are
/// fixed at clustering time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneFamily {
    pub id: String,
    /// Member sequence ids, sorted. Each id encodes its taxon tag as the
    /// prefix before the first underscore.
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fasta: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<PathBuf>,
}

impl GeneFamily {
    pub fn new(id: impl Into<String>, mut members: Vec<String>) -> Self {
        members.sort();
        Self {
            id: id.into(),
            members,
            fasta: None,
            alignment: None,
            model: None,
            tree: None,
        }
    }

    /// Distinct taxon tags among the members.
    pub fn tags(&self) -> BTreeSet<&str> {
        self.members.iter().map(|m| member_tag(m)).collect()
    }

    /// Distinct species represented, resolved through the registry. Tags the
    /// registry does not know are counted as themselves.
    pub fn species<'r>(&'r self, registry: &'r TaxonRegistry) -> BTreeSet<&'r str> {
        self.members
            .iter()
            .map(|m| {
                let tag = member_tag(m);
                registry.species_of_tag(tag).unwrap_or(tag)
            })
            .collect()
    }

    /// Distinct clades represented, resolved through the registry.
    pub fn clades<'r>(&'r self, registry: &'r TaxonRegistry) -> BTreeSet<&'r str> {
        self.species(registry)
            .into_iter()
            .filter_map(|sp| registry.clade_of(sp))
            .collect()
    }
}

/// The taxon tag encoded in a sequence id (`{tag}_{ordinal}`).
pub fn member_tag(sequence_id: &str) -> &str {
    sequence_id.split('_').next().unwrap_or(sequence_id)
}

/// One recorded per-unit failure in a fan-out stage. Non-fatal in
/// non-strict mode: the unit is excluded downstream and the run continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyFailure {
    /// Family id, or taxon tag for the translation stage.
    pub unit: String,
    pub tool: String,
    pub message: String,
    pub transient: bool,
}
