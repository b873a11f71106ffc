use crate::config::CountBounds;
use crate::error::Result;
use crate::family::GeneFamily;
use crate::registry::TaxonRegistry;
use itertools::Itertools;
use petgraph::unionfind::UnionFind;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// One pairwise similarity hit from the all-vs-all search (tabular output,
/// columns as requested from the search tool: query, subject, identity,
/// bitscore).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimilarityHit {
    pub query: String,
    pub subject: String,
    pub identity: f64,
    pub bitscore: f64,
}

pub fn read_hits(path: &Path) -> Result<Vec<SimilarityHit>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;
    let mut hits = Vec::new();
    for record in reader.deserialize() {
        hits.push(record?);
    }
    Ok(hits)
}

/// Cluster sequences into families: hits at or above both thresholds are
/// edges of an undirected graph over sequence ids; families are its
/// connected components.
///
/// Membership is a pure function of the hit set and thresholds. Everything
/// order-dependent is normalized before returning: members are sorted,
/// components are ordered by their smallest member, and ids are assigned in
/// that order.
pub fn build_families(
    hits: &[SimilarityHit],
    min_identity: f64,
    min_bitscore: f64,
) -> Vec<GeneFamily> {
    let mut edges = Vec::new();
    let mut ids = BTreeSet::new();
    for hit in hits {
        if hit.query == hit.subject {
            continue;
        }
        if hit.identity < min_identity || hit.bitscore < min_bitscore {
            continue;
        }
        ids.insert(hit.query.clone());
        ids.insert(hit.subject.clone());
        edges.push((hit.query.clone(), hit.subject.clone()));
    }

    let index: BTreeMap<&String, usize> =
        ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut components: UnionFind<usize> = UnionFind::new(ids.len());
    for (query, subject) in &edges {
        components.union(index[query], index[subject]);
    }

    let mut members: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (id, &i) in &index {
        members
            .entry(components.find(i))
            .or_default()
            .push((*id).clone());
    }

    members
        .into_values()
        .map(|mut m| {
            m.sort();
            m
        })
        .sorted_by(|a, b| a[0].cmp(&b[0]))
        .enumerate()
        .map(|(i, m)| GeneFamily::new(format!("FAM{:06}", i + 1), m))
        .collect()
}

/// Outcome of the taxa/clade-count filter.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<GeneFamily>,
    pub dropped_taxa: u64,
    pub dropped_clades: u64,
}

/// Drop families whose distinct-species or distinct-clade counts fall
/// outside the configured bounds.
pub fn filter_families(
    families: Vec<GeneFamily>,
    registry: &TaxonRegistry,
    taxa_bounds: CountBounds,
    clade_bounds: CountBounds,
) -> FilterOutcome {
    let total = families.len();
    let mut outcome = FilterOutcome::default();
    for family in families {
        if !taxa_bounds.contains(family.species(registry).len()) {
            outcome.dropped_taxa += 1;
            continue;
        }
        if !clade_bounds.contains(family.clades(registry).len()) {
            outcome.dropped_clades += 1;
            continue;
        }
        outcome.kept.push(family);
    }
    info!(
        "family filter: {} kept of {} ({} outside taxa bounds, {} outside clade bounds)",
        outcome.kept.len(),
        total,
        outcome.dropped_taxa,
        outcome.dropped_clades
    );
    outcome
}
