use crate::error::Result;
use bio::io::gff;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::warn;

/// One gene record from the reference annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneRecord {
    pub gene: String,
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

/// Read gene features from a GFF3 annotation. The gene identifier is the
/// `ID` attribute, falling back to `Name`; records with neither are skipped
/// with a warning. Returned in file order.
pub fn read_gene_annotation(path: &Path) -> Result<Vec<GeneRecord>> {
    let mut reader = gff::Reader::new(File::open(path)?, gff::GffType::GFF3);
    let mut genes = Vec::new();
    let mut skipped = 0u64;
    for record in reader.records() {
        let record = record?;
        if !record.feature_type().eq_ignore_ascii_case("gene") {
            continue;
        }
        let id = record
            .attributes()
            .get("ID")
            .or_else(|| record.attributes().get("Name"));
        match id {
            Some(id) => genes.push(GeneRecord {
                gene: id.clone(),
                chrom: record.seqname().to_string(),
                start: *record.start(),
                end: *record.end(),
            }),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            "annotation {}: skipped {} gene records without ID/Name",
            path.display(),
            skipped
        );
    }
    Ok(genes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GFF: &str = "\
##gff-version 3
1\ttest\tgene\t100\t200\t.\t+\t.\tID=GeneA;Name=geneA
1\ttest\tmRNA\t100\t200\t.\t+\t.\tID=GeneA.1;Parent=GeneA
1\ttest\tgene\t250\t300\t.\t-\t.\tID=GeneB
2\ttest\tgene\t10\t90\t.\t+\t.\tName=GeneC
";

    #[test]
    fn test_reads_gene_features_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.gff3");
        std::fs::write(&path, GFF).unwrap();

        let genes = read_gene_annotation(&path).unwrap();
        assert_eq!(genes.len(), 3);
        assert_eq!(
            genes[0],
            GeneRecord {
                gene: "GeneA".into(),
                chrom: "1".into(),
                start: 100,
                end: 200,
            }
        );
        assert_eq!(genes[1].gene, "GeneB");
        // Name fallback when ID is absent.
        assert_eq!(genes[2].gene, "GeneC");
        assert_eq!(genes[2].chrom, "2");
    }
}
