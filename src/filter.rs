use crate::config::FilterMode;
use crate::error::{PipelineError, Result};

const GAP_CHARS: [u8; 2] = [b'-', b'.'];

/// Column fraction above which a column is dropped, per mode.
const RELAXED_COLUMN_GAP: f64 = 0.8;
const STRICT_COLUMN_GAP: f64 = 0.5;
/// Sequence gap fraction above which a sequence is dropped (strict mode).
const STRICT_SEQUENCE_GAP: f64 = 0.7;

/// A filtered alignment plus what the filter removed.
#[derive(Debug)]
pub struct FilteredAlignment {
    /// (sequence id, residues) pairs, input order preserved.
    pub records: Vec<(String, Vec<u8>)>,
    pub columns_total: usize,
    pub columns_kept: usize,
    pub sequences_dropped: usize,
}

impl FilteredAlignment {
    /// An alignment too degenerate to carry into model selection.
    pub fn is_degenerate(&self) -> bool {
        self.records.len() < 2 || self.columns_kept == 0
    }
}

fn is_gap(c: u8) -> bool {
    GAP_CHARS.contains(&c)
}

/// Remove poorly aligned columns (and, in strict mode, sequences) from an
/// alignment. All sequences must have equal length.
pub fn filter_alignment(
    records: &[(String, Vec<u8>)],
    mode: FilterMode,
) -> Result<FilteredAlignment> {
    let columns_total = records.first().map_or(0, |(_, seq)| seq.len());
    for (id, seq) in records {
        if seq.len() != columns_total {
            return Err(PipelineError::parse(format!(
                "alignment is ragged: sequence '{}' has {} columns, expected {}",
                id,
                seq.len(),
                columns_total
            )));
        }
    }

    let column_gap_limit = match mode {
        FilterMode::None => {
            return Ok(FilteredAlignment {
                records: records.to_vec(),
                columns_total,
                columns_kept: columns_total,
                sequences_dropped: 0,
            })
        }
        FilterMode::Relaxed => RELAXED_COLUMN_GAP,
        FilterMode::Strict => STRICT_COLUMN_GAP,
    };

    let n = records.len() as f64;
    let kept_columns: Vec<usize> = (0..columns_total)
        .filter(|&col| {
            let gaps = records.iter().filter(|(_, seq)| is_gap(seq[col])).count();
            (gaps as f64) / n <= column_gap_limit
        })
        .collect();

    let mut filtered: Vec<(String, Vec<u8>)> = records
        .iter()
        .map(|(id, seq)| {
            (
                id.clone(),
                kept_columns.iter().map(|&c| seq[c]).collect::<Vec<u8>>(),
            )
        })
        .collect();

    let mut sequences_dropped = 0;
    if mode == FilterMode::Strict && !kept_columns.is_empty() {
        let before = filtered.len();
        filtered.retain(|(_, seq)| {
            let gaps = seq.iter().filter(|&&c| is_gap(c)).count();
            (gaps as f64) / (seq.len() as f64) <= STRICT_SEQUENCE_GAP
        });
        sequences_dropped = before - filtered.len();
    }

    Ok(FilteredAlignment {
        records: filtered,
        columns_total,
        columns_kept: kept_columns.len(),
        sequences_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(rows: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        rows.iter()
            .map(|(id, seq)| (id.to_string(), seq.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_none_mode_is_identity() {
        let aln = records(&[("a", "MK-L"), ("b", "MKQL")]);
        let filtered = filter_alignment(&aln, FilterMode::None).unwrap();
        assert_eq!(filtered.records, aln);
        assert_eq!(filtered.columns_kept, 4);
    }

    #[test]
    fn test_relaxed_drops_mostly_gap_columns() {
        // Column 2 is gap in 3 of 4 sequences (75%): kept under relaxed.
        // Column 3 is gap in all 4 (100%): dropped.
        let aln = records(&[
            ("a", "MK-L-"),
            ("b", "MK-L-"),
            ("c", "MK-L-"),
            ("d", "MKQL-"),
        ]);
        let filtered = filter_alignment(&aln, FilterMode::Relaxed).unwrap();
        assert_eq!(filtered.columns_kept, 4);
        assert_eq!(filtered.records[0].1, b"MK-L".to_vec());
    }

    #[test]
    fn test_strict_drops_columns_and_sequences() {
        let aln = records(&[
            ("a", "MKLVQ"),
            ("b", "MKLVQ"),
            ("c", "----Q"),
            ("d", "MKLVQ"),
        ]);
        let filtered = filter_alignment(&aln, FilterMode::Strict).unwrap();
        // No column exceeds 50% gaps, but 'c' is 80% gap and is dropped.
        assert_eq!(filtered.columns_kept, 5);
        assert_eq!(filtered.records.len(), 3);
        assert_eq!(filtered.sequences_dropped, 1);
    }

    #[test]
    fn test_ragged_alignment_rejected() {
        let aln = records(&[("a", "MKL"), ("b", "MK")]);
        assert!(filter_alignment(&aln, FilterMode::Relaxed).is_err());
    }

    #[test]
    fn test_degenerate_detection() {
        let aln = records(&[("a", "--"), ("b", "--")]);
        let filtered = filter_alignment(&aln, FilterMode::Relaxed).unwrap();
        assert_eq!(filtered.columns_kept, 0);
        assert!(filtered.is_degenerate());
    }
}
