use crate::error::Result;
use crate::family::member_tag;
use crate::newick::PhyloTree;
use crate::registry::TaxonRegistry;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One accepted nearest-relative call for a target-taxon gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestCall {
    pub gene: String,
    pub family: String,
    pub species: String,
    pub clade: String,
    pub support: f64,
}

/// Per-family inference outcome: accepted calls plus the number of target
/// leaves excluded for lack of support.
#[derive(Debug, Default)]
pub struct InferenceOutcome {
    pub calls: Vec<NearestCall>,
    pub low_confidence: u64,
}

/// Infer the nearest species/clade for every target-taxon leaf of one
/// family tree.
///
/// For each target leaf: walk toward the root; the first ancestor whose
/// support meets the threshold and whose subtree holds at least one
/// non-target leaf defines the comparison group (its leaves minus all
/// target-taxon leaves). Within the group, the leaf at minimal branch-length
/// distance wins; ties break on species name, then leaf label. Reaching the
/// root without a qualifying ancestor excludes the leaf, counted as low
/// confidence.
pub fn infer_family(
    tree: &PhyloTree,
    family_id: &str,
    registry: &TaxonRegistry,
    target_species: &str,
    min_support: f64,
) -> InferenceOutcome {
    let species_of_leaf = |leaf: usize| -> String {
        let label = tree.node(leaf).label.as_deref().unwrap_or_default();
        let tag = member_tag(label);
        registry
            .species_of_tag(tag)
            .unwrap_or(tag)
            .to_string()
    };

    let mut outcome = InferenceOutcome::default();
    for leaf in tree.leaves() {
        if species_of_leaf(leaf) != target_species {
            continue;
        }

        let mut call = None;
        for ancestor in tree.ancestors(leaf) {
            let support = match tree.node(ancestor).support {
                Some(s) if s >= min_support => s,
                _ => continue,
            };
            let group: Vec<usize> = tree
                .leaves_under(ancestor)
                .into_iter()
                .filter(|&l| species_of_leaf(l) != target_species)
                .collect();
            if group.is_empty() {
                continue;
            }

            let nearest = group
                .into_iter()
                .map(|l| {
                    (
                        tree.distance_between(leaf, l),
                        species_of_leaf(l),
                        tree.node(l).label.clone().unwrap_or_default(),
                    )
                })
                .min_by(|a, b| {
                    a.0.partial_cmp(&b.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.cmp(&b.1))
                        .then_with(|| a.2.cmp(&b.2))
                })
                .expect("group is non-empty");

            let clade = registry.clade_of(&nearest.1).unwrap_or("").to_string();
            call = Some(NearestCall {
                gene: tree.node(leaf).label.clone().unwrap_or_default(),
                family: family_id.to_string(),
                species: nearest.1,
                clade,
                support,
            });
            break;
        }

        match call {
            Some(c) => outcome.calls.push(c),
            None => outcome.low_confidence += 1,
        }
    }
    outcome
}

pub fn write_calls(path: &Path, calls: &[NearestCall]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    for call in calls {
        writer.serialize(call)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_calls(path: &Path) -> Result<Vec<NearestCall>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    let mut calls = Vec::new();
    for record in reader.deserialize() {
        calls.push(record?);
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaxonRecord;

    fn registry() -> TaxonRegistry {
        let rec = |tag: &str, species: &str, clade: &str| TaxonRecord {
            tag: tag.into(),
            species: species.into(),
            ploidy: 2,
            clade: clade.into(),
            source: "x.fna".into(),
        };
        TaxonRegistry::from_records(vec![
            rec("AAA1", "Aegilops tauschii", "CladeX"),
            rec("BBB1", "Brachypodium distachyon", "CladeX"),
            rec("CCC1", "Cenchrus americanus", "CladeY"),
        ])
        .unwrap()
    }

    const CHERRY: &str = "((AAA1_000001:0.1,BBB1_000001:0.1)95:0.05,CCC1_000001:0.2);";

    #[test]
    fn test_supported_sibling_is_called() {
        let tree = PhyloTree::parse(CHERRY).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 90.0);
        assert_eq!(outcome.low_confidence, 0);
        assert_eq!(outcome.calls.len(), 1);
        let call = &outcome.calls[0];
        assert_eq!(call.gene, "AAA1_000001");
        assert_eq!(call.species, "Brachypodium distachyon");
        assert_eq!(call.clade, "CladeX");
        assert!((call.support - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_above_support_excludes_leaf() {
        let tree = PhyloTree::parse(CHERRY).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 97.0);
        assert!(outcome.calls.is_empty());
        assert_eq!(outcome.low_confidence, 1);
    }

    #[test]
    fn test_lowering_threshold_never_moves_call_rootward() {
        let tree = PhyloTree::parse(CHERRY).unwrap();
        let strict = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 95.0);
        let loose = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 10.0);
        assert_eq!(strict.calls, loose.calls);
    }

    #[test]
    fn test_climbs_past_unsupported_nodes() {
        // The cherry has support 40, below threshold; the next ancestor has
        // 90 and its group contains both B and C; B is nearer.
        let text = "(((AAA1_000001:0.1,BBB1_000001:0.1)40:0.05,CCC1_000001:0.2)90:0.1,CCC1_000002:0.5);";
        let tree = PhyloTree::parse(text).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 80.0);
        assert_eq!(outcome.calls.len(), 1);
        assert_eq!(outcome.calls[0].species, "Brachypodium distachyon");
        assert!((outcome.calls[0].support - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_excludes_all_target_leaves() {
        // The supported ancestor holds only target-taxon leaves: it cannot
        // anchor a call, the walk continues to the next supported ancestor.
        let text = "(((AAA1_000001:0.1,AAA1_000002:0.1)99:0.05,BBB1_000001:0.2)95:0.1,CCC1_000001:0.4);";
        let tree = PhyloTree::parse(text).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 90.0);
        assert_eq!(outcome.calls.len(), 2);
        for call in &outcome.calls {
            assert_eq!(call.species, "Brachypodium distachyon");
            assert!((call.support - 95.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_equidistant_tie_breaks_alphabetically() {
        // B and C are equidistant from A under the supported root.
        let text = "((AAA1_000001:0.1,BBB1_000001:0.2)90:0.1,CCC1_000001:0.3)99;";
        let tree = PhyloTree::parse(text).unwrap();
        // Supported cherry first: call is B regardless of the tie at the root.
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 95.0);
        // Root support 99 qualifies; distances: B = 0.3, C = 0.1 + 0.1 + 0.3 = 0.5.
        assert_eq!(outcome.calls[0].species, "Brachypodium distachyon");

        let text = "(AAA1_000001:0.1,BBB1_000001:0.2,CCC1_000001:0.2)90;";
        let tree = PhyloTree::parse(text).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 80.0);
        assert_eq!(outcome.calls[0].species, "Brachypodium distachyon");
    }

    #[test]
    fn test_multiple_target_leaves_yield_multiple_calls() {
        let text = "((AAA1_000001:0.1,BBB1_000001:0.1)95:0.05,(AAA1_000002:0.1,CCC1_000001:0.1)92:0.05);";
        let tree = PhyloTree::parse(text).unwrap();
        let outcome = infer_family(&tree, "FAM000001", &registry(), "Aegilops tauschii", 90.0);
        assert_eq!(outcome.calls.len(), 2);
        let species: Vec<&str> = outcome.calls.iter().map(|c| c.species.as_str()).collect();
        assert!(species.contains(&"Brachypodium distachyon"));
        assert!(species.contains(&"Cenchrus americanus"));
    }

    #[test]
    fn test_calls_roundtrip_through_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.tsv");
        let calls = vec![NearestCall {
            gene: "AAA1_000001".into(),
            family: "FAM000001".into(),
            species: "Brachypodium distachyon".into(),
            clade: "CladeX".into(),
            support: 95.0,
        }];
        write_calls(&path, &calls).unwrap();
        assert_eq!(read_calls(&path).unwrap(), calls);
    }
}
