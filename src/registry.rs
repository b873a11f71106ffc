use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

const MAX_TAG_LEN: usize = 8;

/// One input sequence source from the manifest. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonRecord {
    pub tag: String,
    pub species: String,
    pub ploidy: u32,
    pub clade: String,
    pub source: PathBuf,
}

/// Taxonomy tables built once from the input manifest and treated as
/// read-only for the rest of the run. Lookups are by tag (one per source
/// file) or by species; the clade index maps each clade to its ordered set
/// of species names.
#[derive(Debug, Clone, Default)]
pub struct TaxonRegistry {
    records: Vec<TaxonRecord>,
    by_tag: HashMap<String, usize>,
    species_clade: HashMap<String, String>,
    species_ploidy: HashMap<String, u32>,
    clade_index: BTreeMap<String, BTreeSet<String>>,
}

impl TaxonRegistry {
    /// Parse a tab-separated manifest. Rows are either 5 columns
    /// (tag, species, ploidy, clade, path) or 3 columns (species, clade,
    /// path); the first row fixes the schema for the whole file. In the
    /// 3-column form tags are derived from the species name.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_path(path)?;

        let mut expected_cols: Option<usize> = None;
        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 1);
            let found = record.len();
            if found == 1 && record.get(0).map(str::trim) == Some("") {
                continue;
            }
            let expected = *expected_cols.get_or_insert(found);
            if found != expected || !(expected == 3 || expected == 5) {
                return Err(PipelineError::Schema {
                    line,
                    expected: if expected == 3 || expected == 5 {
                        expected
                    } else {
                        5
                    },
                    found,
                });
            }
            rows.push((line, record));
        }

        let mut registry = TaxonRegistry::default();
        let tagged = expected_cols == Some(5);
        for (line, record) in rows {
            let rec = if tagged {
                let ploidy: u32 = record[2].trim().parse().map_err(|_| {
                    PipelineError::parse(format!(
                        "manifest line {}: invalid ploidy '{}'",
                        line,
                        record[2].trim()
                    ))
                })?;
                TaxonRecord {
                    tag: record[0].trim().to_string(),
                    species: record[1].trim().to_string(),
                    ploidy,
                    clade: record[3].trim().to_string(),
                    source: PathBuf::from(record[4].trim()),
                }
            } else {
                let species = record[0].trim().to_string();
                TaxonRecord {
                    tag: registry.derive_tag(&species),
                    species,
                    ploidy: 2,
                    clade: record[1].trim().to_string(),
                    source: PathBuf::from(record[2].trim()),
                }
            };
            if !rec.source.exists() {
                return Err(PipelineError::MissingFile {
                    tag: rec.tag,
                    path: rec.source,
                });
            }
            registry.insert(rec)?;
        }

        info!(
            "registry: {} tags, {} species, {} clades",
            registry.tag_count(),
            registry.species_count(),
            registry.clade_count()
        );
        Ok(registry)
    }

    /// Build a registry from pre-validated records. Source file existence is
    /// not checked here; `from_manifest` is the checked entry point.
    pub fn from_records(records: Vec<TaxonRecord>) -> Result<Self> {
        let mut registry = TaxonRegistry::default();
        for rec in records {
            registry.insert(rec)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, rec: TaxonRecord) -> Result<()> {
        validate_tag(&rec.tag)?;
        if self.by_tag.contains_key(&rec.tag) {
            return Err(PipelineError::DuplicateTag(rec.tag));
        }
        if let Some(clade) = self.species_clade.get(&rec.species) {
            if *clade != rec.clade {
                return Err(PipelineError::SpeciesMetadataConflict {
                    species: rec.species,
                    field: "clade",
                    first: clade.clone(),
                    second: rec.clade,
                });
            }
        }
        if let Some(ploidy) = self.species_ploidy.get(&rec.species) {
            if *ploidy != rec.ploidy {
                return Err(PipelineError::SpeciesMetadataConflict {
                    species: rec.species,
                    field: "ploidy",
                    first: ploidy.to_string(),
                    second: rec.ploidy.to_string(),
                });
            }
        }

        self.species_clade
            .insert(rec.species.clone(), rec.clade.clone());
        self.species_ploidy.insert(rec.species.clone(), rec.ploidy);
        self.clade_index
            .entry(rec.clade.clone())
            .or_default()
            .insert(rec.species.clone());
        self.by_tag.insert(rec.tag.clone(), self.records.len());
        self.records.push(rec);
        Ok(())
    }

    /// Derive a unique tag from a species name (3-column schema).
    fn derive_tag(&self, species: &str) -> String {
        let mut base: String = species
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(MAX_TAG_LEN)
            .collect();
        if base.is_empty() {
            base = "TAXON".to_string();
        }
        if !self.by_tag.contains_key(&base) {
            return base;
        }
        for n in 2u32.. {
            let suffix = n.to_string();
            let mut candidate: String = base
                .chars()
                .take(MAX_TAG_LEN - suffix.len())
                .collect();
            candidate.push_str(&suffix);
            if !self.by_tag.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!()
    }

    pub fn records(&self) -> &[TaxonRecord] {
        &self.records
    }

    pub fn by_tag(&self, tag: &str) -> Option<&TaxonRecord> {
        self.by_tag.get(tag).map(|&i| &self.records[i])
    }

    pub fn species_of_tag(&self, tag: &str) -> Option<&str> {
        self.by_tag(tag).map(|r| r.species.as_str())
    }

    pub fn clade_of(&self, species: &str) -> Option<&str> {
        self.species_clade.get(species).map(String::as_str)
    }

    pub fn contains_species(&self, species: &str) -> bool {
        self.species_clade.contains_key(species)
    }

    pub fn tags_for_species(&self, species: &str) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.species == species)
            .map(|r| r.tag.as_str())
            .collect()
    }

    pub fn clade_index(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.clade_index
    }

    pub fn tag_count(&self) -> usize {
        self.records.len()
    }

    pub fn species_count(&self) -> usize {
        self.species_clade.len()
    }

    pub fn clade_count(&self) -> usize {
        self.clade_index.len()
    }

    /// The reference/target taxon must be one of the manifest species.
    pub fn validate_reference(&self, taxon: &str) -> Result<()> {
        if self.contains_species(taxon) {
            Ok(())
        } else {
            Err(PipelineError::UnknownReferenceTaxon(taxon.to_string()))
        }
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty()
        || tag.len() > MAX_TAG_LEN
        || !tag.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(PipelineError::TagFormat(tag.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(tag: &str, species: &str, ploidy: u32, clade: &str) -> TaxonRecord {
        TaxonRecord {
            tag: tag.to_string(),
            species: species.to_string(),
            ploidy,
            clade: clade.to_string(),
            source: PathBuf::from(format!("{tag}.fna")),
        }
    }

    fn write_manifest(dir: &Path, rows: &[&str]) -> PathBuf {
        let path = dir.join("manifest.tsv");
        fs::write(&path, rows.join("\n")).unwrap();
        path
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, ">g1\nATGATG\n").unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_parse_five_column_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fna");
        let b = touch(dir.path(), "b.fna");
        let manifest = write_manifest(
            dir.path(),
            &[
                &format!("ATH1\tArabidopsis thaliana\t2\tBrassicaceae\t{a}"),
                &format!("BRP1\tBrassica rapa\t2\tBrassicaceae\t{b}"),
            ],
        );

        let registry = TaxonRegistry::from_manifest(&manifest).unwrap();
        assert_eq!(registry.tag_count(), 2);
        assert_eq!(registry.species_count(), 2);
        assert_eq!(registry.clade_count(), 1);
        assert_eq!(
            registry.species_of_tag("ATH1"),
            Some("Arabidopsis thaliana")
        );
        assert_eq!(registry.clade_of("Brassica rapa"), Some("Brassicaceae"));
    }

    #[test]
    fn test_parse_three_column_manifest_derives_tags() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fna");
        let b = touch(dir.path(), "b.fna");
        let manifest = write_manifest(
            dir.path(),
            &[
                &format!("Arabidopsis thaliana\tBrassicaceae\t{a}"),
                &format!("Arabidopsis thaliana\tBrassicaceae\t{b}"),
            ],
        );

        let registry = TaxonRegistry::from_manifest(&manifest).unwrap();
        assert_eq!(registry.tag_count(), 2);
        let tags: Vec<_> = registry.records().iter().map(|r| r.tag.clone()).collect();
        assert_eq!(tags[0], "Arabidop");
        assert_eq!(tags[1], "Arabido2");
        for tag in tags {
            assert!(tag.len() <= MAX_TAG_LEN);
            assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_schema_mismatch_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fna");
        let manifest = write_manifest(
            dir.path(),
            &[
                &format!("ATH1\tArabidopsis thaliana\t2\tBrassicaceae\t{a}"),
                "BRP1\tBrassica rapa\tBrassicaceae",
            ],
        );

        match TaxonRegistry::from_manifest(&manifest) {
            Err(PipelineError::Schema {
                line,
                expected,
                found,
            }) => {
                assert_eq!(line, 2);
                assert_eq!(expected, 5);
                assert_eq!(found, 3);
            }
            other => panic!("expected SchemaError, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let err = TaxonRegistry::from_records(vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("ATH1", "Arabidopsis lyrata", 2, "Brassicaceae"),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateTag(tag) if tag == "ATH1"));
    }

    #[test]
    fn test_tag_format_rejected_regardless_of_other_rows() {
        let err = TaxonRegistry::from_records(vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("toolongtag", "Brassica rapa", 2, "Brassicaceae"),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::TagFormat(_)));

        let err =
            TaxonRegistry::from_records(vec![record("AT-1", "X", 2, "C")]).unwrap_err();
        assert!(matches!(err, PipelineError::TagFormat(_)));
    }

    #[test]
    fn test_missing_source_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            &["ATH1\tArabidopsis thaliana\t2\tBrassicaceae\t/no/such/file.fna"],
        );
        let err = TaxonRegistry::from_manifest(&manifest).unwrap_err();
        assert!(matches!(err, PipelineError::MissingFile { tag, .. } if tag == "ATH1"));
    }

    #[test]
    fn test_species_conflict_is_an_error() {
        let err = TaxonRegistry::from_records(vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("ATH2", "Arabidopsis thaliana", 2, "Rosaceae"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SpeciesMetadataConflict { field: "clade", .. }
        ));

        let err = TaxonRegistry::from_records(vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("ATH2", "Arabidopsis thaliana", 4, "Brassicaceae"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SpeciesMetadataConflict {
                field: "ploidy",
                ..
            }
        ));
    }

    #[test]
    fn test_consistent_species_repetition_allowed() {
        let registry = TaxonRegistry::from_records(vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("ATH2", "Arabidopsis thaliana", 2, "Brassicaceae"),
        ])
        .unwrap();
        assert_eq!(registry.tag_count(), 2);
        assert_eq!(registry.species_count(), 1);
        assert_eq!(registry.tags_for_species("Arabidopsis thaliana").len(), 2);
    }

    #[test]
    fn test_registry_is_row_order_independent() {
        let rows = vec![
            record("ATH1", "Arabidopsis thaliana", 2, "Brassicaceae"),
            record("BRP1", "Brassica rapa", 2, "Brassicaceae"),
            record("OSA1", "Oryza sativa", 2, "Poaceae"),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();

        let a = TaxonRegistry::from_records(rows).unwrap();
        let b = TaxonRegistry::from_records(reversed).unwrap();
        assert_eq!(a.clade_index(), b.clade_index());
        assert_eq!(a.species_count(), b.species_count());
        assert_eq!(a.tag_count(), b.tag_count());
    }

    #[test]
    fn test_reparse_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.fna");
        let b = touch(dir.path(), "b.fna");
        let manifest = write_manifest(
            dir.path(),
            &[
                &format!("ATH1\tArabidopsis thaliana\t2\tBrassicaceae\t{a}"),
                &format!("OSA1\tOryza sativa\t2\tPoaceae\t{b}"),
            ],
        );

        let first = TaxonRegistry::from_manifest(&manifest).unwrap();
        let second = TaxonRegistry::from_manifest(&manifest).unwrap();
        assert_eq!(first.records(), second.records());
        assert_eq!(first.clade_index(), second.clade_index());
    }

    #[test]
    fn test_reference_taxon_validation() {
        let registry = TaxonRegistry::from_records(vec![record(
            "ATH1",
            "Arabidopsis thaliana",
            2,
            "Brassicaceae",
        )])
        .unwrap();
        assert!(registry.validate_reference("Arabidopsis thaliana").is_ok());
        let err = registry.validate_reference("Zea mays").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownReferenceTaxon(t) if t == "Zea mays"));
    }
}
