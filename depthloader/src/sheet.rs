use std::path::Path;

use depthstore::models::SampleClass;

use crate::error::{LoaderError, Result};
use crate::matrix::open_maybe_gzip;

/// Barcodes starting with this project prefix carry their classification
/// code in the first two dash-separated segments.
const PROJECT_PREFIX: &str = "TCGA";

/// Raw substrings that mark a sample as non-tumor tissue.
const NORMAL_KEYWORDS: [&str; 3] = ["normal", "control", "benign"];

/// One row of a per-site metadata sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub barcode: String,
    pub sample_type: String,
    pub tcga_code: Option<String>,
}

/// Read a `sample_sheet.csv`. The sheet must carry `sample_barcode` and
/// `sample_type` columns; `tcga_code` is optional and blank values are
/// treated as absent.
pub fn read_sample_sheet(path: &Path) -> Result<Vec<SheetRow>> {
    let reader = open_maybe_gzip(path)?;
    let mut csv_reader = csv::ReaderBuilder::new().from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let barcode_idx = column_index(&headers, path, "sample_barcode")?;
    let type_idx = column_index(&headers, path, "sample_type")?;
    let code_idx = headers.iter().position(|h| h == "tcga_code");

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let barcode = record.get(barcode_idx).unwrap_or_default().trim();
        if barcode.is_empty() {
            continue;
        }
        let sample_type = record.get(type_idx).unwrap_or_default().trim().to_string();
        let tcga_code = code_idx
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string);
        rows.push(SheetRow {
            barcode: barcode.to_string(),
            sample_type,
            tcga_code,
        });
    }
    Ok(rows)
}

/// Collapse a raw sample-type string to tumor/normal. Any case-insensitive
/// occurrence of a normal-tissue keyword wins; everything else, including an
/// empty string, counts as tumor.
pub fn classify_sample_type(raw: &str) -> SampleClass {
    let lowered = raw.trim().to_lowercase();
    if NORMAL_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        SampleClass::Normal
    } else {
        SampleClass::Tumor
    }
}

/// Derive a classification code from a barcode: the first two dash-separated
/// segments, but only when the barcode belongs to the fixed project prefix.
pub fn barcode_code(barcode: &str) -> Option<String> {
    let mut parts = barcode.split('-');
    let project = parts.next()?;
    let code = parts.next()?;
    if project == PROJECT_PREFIX && !code.is_empty() {
        Some(format!("{project}-{code}"))
    } else {
        None
    }
}

fn column_index(
    headers: &csv::StringRecord,
    path: &Path,
    column: &'static str,
) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| LoaderError::MissingColumn {
            file: path.to_path_buf(),
            column,
        })
}
