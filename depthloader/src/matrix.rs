use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use depthstore::models::{GeneRecord, Normalization, SampleClass};
use flate2::read::GzDecoder;
use ndarray::Array2;

use crate::error::{LoaderError, Result};

const GENE_ID_COLUMN: &str = "gene_id";
const GENE_SYMBOL_COLUMN: &str = "gene_name";

/// Open a data file, transparently decompressing `.gz` inputs.
pub fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => LoaderError::MissingInput(path.to_path_buf()),
        _ => LoaderError::Io(err),
    })?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// A genes × samples expression matrix in wide format. Missing or
/// non-numeric cells are carried as NaN.
#[derive(Debug, Clone)]
pub struct WideMatrix {
    pub genes: Vec<String>,
    pub samples: Vec<String>,
    pub values: Array2<f64>,
}

impl WideMatrix {
    /// Read a wide matrix from CSV. The gene-identifier column is the row
    /// key; an optional display-symbol column is dropped; every remaining
    /// column is a sample barcode.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let reader = open_maybe_gzip(path)?;
        let mut csv_reader = csv::ReaderBuilder::new().from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let gene_idx = headers
            .iter()
            .position(|h| h == GENE_ID_COLUMN)
            .ok_or_else(|| LoaderError::MissingColumn {
                file: path.to_path_buf(),
                column: GENE_ID_COLUMN,
            })?;
        let symbol_idx = headers.iter().position(|h| h == GENE_SYMBOL_COLUMN);

        let mut sample_indices = Vec::new();
        let mut samples = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            if idx == gene_idx || Some(idx) == symbol_idx {
                continue;
            }
            sample_indices.push(idx);
            samples.push(name.to_string());
        }

        let mut genes = Vec::new();
        let mut data = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let gene = record.get(gene_idx).unwrap_or_default().trim();
            if gene.is_empty() {
                continue;
            }
            genes.push(gene.to_string());
            for &idx in &sample_indices {
                data.push(parse_cell(record.get(idx)));
            }
        }

        let values = Array2::from_shape_vec((genes.len(), samples.len()), data)?;
        Ok(Self {
            genes,
            samples,
            values,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty() || self.samples.is_empty()
    }

    /// The log2(x + 1) transform applied ahead of heterogeneity scoring.
    pub fn log2_plus_one(&self) -> WideMatrix {
        WideMatrix {
            genes: self.genes.clone(),
            samples: self.samples.clone(),
            values: self.values.mapv(|v| (v + 1.0).log2()),
        }
    }

    fn gene_index(&self) -> HashMap<&str, usize> {
        self.genes
            .iter()
            .enumerate()
            .map(|(idx, gene)| (gene.as_str(), idx))
            .collect()
    }

    fn sample_index(&self) -> HashMap<&str, usize> {
        self.samples
            .iter()
            .enumerate()
            .map(|(idx, barcode)| (barcode.as_str(), idx))
            .collect()
    }
}

/// Read the distinct (gene identifier, display symbol) pairs of a matrix
/// without materializing its values.
pub fn read_gene_annotations(path: &Path) -> Result<Vec<GeneRecord>> {
    let reader = open_maybe_gzip(path)?;
    let mut csv_reader = csv::ReaderBuilder::new().from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let gene_idx = headers
        .iter()
        .position(|h| h == GENE_ID_COLUMN)
        .ok_or_else(|| LoaderError::MissingColumn {
            file: path.to_path_buf(),
            column: GENE_ID_COLUMN,
        })?;
    let symbol_idx = headers.iter().position(|h| h == GENE_SYMBOL_COLUMN);

    let mut seen = std::collections::BTreeMap::new();
    for record in csv_reader.records() {
        let record = record?;
        let gene = record.get(gene_idx).unwrap_or_default().trim();
        if gene.is_empty() {
            continue;
        }
        let symbol = symbol_idx
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(str::to_string);
        seen.insert(gene.to_string(), symbol);
    }

    Ok(seen
        .into_iter()
        .map(|(ensembl_id, symbol)| GeneRecord { ensembl_id, symbol })
        .collect())
}

/// One long-format row after the three-way merge, still keyed by natural
/// identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub ensembl_id: String,
    pub barcode: String,
    pub tpm: Option<f64>,
    pub fpkm: Option<f64>,
    pub fpkm_uq: Option<f64>,
}

/// Melt three wide matrices to long format and inner-join them on
/// (gene, barcode). A pair absent from any of the three inputs is dropped:
/// partial normalization coverage is excluded rather than null-padded. A
/// cell that is present but non-numeric still joins, with that value
/// missing.
pub fn merge_normalizations(
    tpm: &WideMatrix,
    fpkm: &WideMatrix,
    fpkm_uq: &WideMatrix,
) -> Vec<MergedRow> {
    let fpkm_genes = fpkm.gene_index();
    let fpkm_samples = fpkm.sample_index();
    let uq_genes = fpkm_uq.gene_index();
    let uq_samples = fpkm_uq.sample_index();

    let mut rows = Vec::new();
    for (gene_row, gene) in tpm.genes.iter().enumerate() {
        let (Some(&fpkm_row), Some(&uq_row)) =
            (fpkm_genes.get(gene.as_str()), uq_genes.get(gene.as_str()))
        else {
            continue;
        };
        for (sample_col, barcode) in tpm.samples.iter().enumerate() {
            let (Some(&fpkm_col), Some(&uq_col)) = (
                fpkm_samples.get(barcode.as_str()),
                uq_samples.get(barcode.as_str()),
            ) else {
                continue;
            };
            rows.push(MergedRow {
                ensembl_id: gene.clone(),
                barcode: barcode.clone(),
                tpm: finite(tpm.values[[gene_row, sample_col]]),
                fpkm: finite(fpkm.values[[fpkm_row, fpkm_col]]),
                fpkm_uq: finite(fpkm_uq.values[[uq_row, uq_col]]),
            });
        }
    }
    rows
}

/// Locate a matrix file for a (class, normalization) pair inside a site
/// folder, accepting the plain CSV or its gzipped sibling.
pub fn matrix_path(
    site_dir: &Path,
    class: SampleClass,
    normalization: Normalization,
) -> Option<std::path::PathBuf> {
    let stem = format!("{}_{}.csv", class.as_str(), normalization.file_stem());
    let plain = site_dir.join(&stem);
    if plain.is_file() {
        return Some(plain);
    }
    let gzipped = site_dir.join(format!("{stem}.gz"));
    if gzipped.is_file() {
        return Some(gzipped);
    }
    None
}

fn parse_cell(field: Option<&str>) -> f64 {
    field
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(f64::NAN)
}

fn finite(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_matrix(dir: &Path, name: &str, header: &str, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{header}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        path
    }

    #[test]
    fn read_csv_drops_symbol_column_and_coerces_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_matrix(
            dir.path(),
            "tumor_tpm.csv",
            "gene_id,gene_name,S1,S2",
            &["ENSG1,TP53,1.5,oops", "ENSG2,EGFR,,3.25"],
        );

        let matrix = WideMatrix::read_csv(&path).unwrap();
        assert_eq!(matrix.genes, vec!["ENSG1", "ENSG2"]);
        assert_eq!(matrix.samples, vec!["S1", "S2"]);
        assert_eq!(matrix.values[[0, 0]], 1.5);
        assert!(matrix.values[[0, 1]].is_nan());
        assert!(matrix.values[[1, 0]].is_nan());
        assert_eq!(matrix.values[[1, 1]], 3.25);
    }

    #[test]
    fn read_csv_accepts_gzip_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tumor_tpm.csv.gz");
        let file = File::create(&path).unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder
            .write_all(b"gene_id,gene_name,S1\nENSG1,TP53,2.0\n")
            .unwrap();
        encoder.finish().unwrap();

        let matrix = WideMatrix::read_csv(&path).unwrap();
        assert_eq!(matrix.genes, vec!["ENSG1"]);
        assert_eq!(matrix.values[[0, 0]], 2.0);
    }

    #[test]
    fn missing_matrix_file_is_reported_as_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = WideMatrix::read_csv(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, LoaderError::MissingInput(_)));
    }

    #[test]
    fn merge_keeps_only_pairs_present_in_all_three_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "tpm.csv",
            "gene_id,A,B",
            &["ENSG1,1.0,2.0"],
        ))
        .unwrap();
        let fpkm = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "fpkm.csv",
            "gene_id,A,C",
            &["ENSG1,3.0,4.0"],
        ))
        .unwrap();
        let fpkm_uq = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "fpkm_uq.csv",
            "gene_id,A,B,C",
            &["ENSG1,5.0,6.0,7.0"],
        ))
        .unwrap();

        let rows = merge_normalizations(&tpm, &fpkm, &fpkm_uq);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].barcode, "A");
        assert_eq!(rows[0].tpm, Some(1.0));
        assert_eq!(rows[0].fpkm, Some(3.0));
        assert_eq!(rows[0].fpkm_uq, Some(5.0));
    }

    #[test]
    fn merge_keeps_non_numeric_cells_as_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "tpm.csv",
            "gene_id,A",
            &["ENSG1,not-a-number"],
        ))
        .unwrap();
        let fpkm = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "fpkm.csv",
            "gene_id,A",
            &["ENSG1,1.0"],
        ))
        .unwrap();
        let fpkm_uq = WideMatrix::read_csv(&write_matrix(
            dir.path(),
            "fpkm_uq.csv",
            "gene_id,A",
            &["ENSG1,2.0"],
        ))
        .unwrap();

        let rows = merge_normalizations(&tpm, &fpkm, &fpkm_uq);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tpm, None);
        assert_eq!(rows[0].fpkm, Some(1.0));
    }

    #[test]
    fn gene_annotations_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_matrix(
            dir.path(),
            "tumor_tpm.csv",
            "gene_id,gene_name,S1",
            &["ENSG1,TP53,1.0", "ENSG1,TP53,2.0", "ENSG2,,3.0"],
        );

        let genes = read_gene_annotations(&path).unwrap();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[0].ensembl_id, "ENSG1");
        assert_eq!(genes[0].symbol.as_deref(), Some("TP53"));
        assert_eq!(genes[1].symbol, None);
    }

    #[test]
    fn log2_transform_maps_zero_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_matrix(dir.path(), "m.csv", "gene_id,S1,S2", &["ENSG1,0,3"]);
        let matrix = WideMatrix::read_csv(&path).unwrap().log2_plus_one();
        assert_eq!(matrix.values[[0, 0]], 0.0);
        assert_eq!(matrix.values[[0, 1]], 2.0);
    }
}
