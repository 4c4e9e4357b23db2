use serde::{Deserialize, Serialize};

/// Tumor/normal classification of a sample, stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleClass {
    Tumor,
    Normal,
}

impl SampleClass {
    pub const ALL: [SampleClass; 2] = [SampleClass::Tumor, SampleClass::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleClass::Tumor => "tumor",
            SampleClass::Normal => "normal",
        }
    }
}

impl std::fmt::Display for SampleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three expression quantification units carried in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    Tpm,
    Fpkm,
    FpkmUq,
}

impl Normalization {
    pub const ALL: [Normalization; 3] =
        [Normalization::Tpm, Normalization::Fpkm, Normalization::FpkmUq];

    /// Stem used in matrix file names, e.g. `tumor_fpkm_uq.csv`.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Normalization::Tpm => "tpm",
            Normalization::Fpkm => "fpkm",
            Normalization::FpkmUq => "fpkm_uq",
        }
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// A gene as discovered in a matrix annotation column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GeneRecord {
    pub ensembl_id: String,
    pub symbol: Option<String>,
}

/// A classification code together with the site folder it was discovered in.
#[derive(Debug, Clone)]
pub struct CancerTypeRecord {
    pub tcga_code: String,
    pub site_id: i64,
}

/// A sample row ready for upsert, with the cancer type already resolved
/// (or left null when the code could not be mapped).
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub barcode: String,
    pub class: SampleClass,
    pub cancer_type_id: Option<i64>,
}

/// A sample row as stored, for read-backs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub id: i64,
    pub sample_type: String,
    pub cancer_type_id: Option<i64>,
}

/// One fully resolved fact row for the expression table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionRow {
    pub gene_id: i64,
    pub sample_id: i64,
    pub tpm: Option<f64>,
    pub fpkm: Option<f64>,
    pub fpkm_uq: Option<f64>,
}

/// The three expression values stored for a (gene, sample) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpressionValues {
    pub tpm: Option<f64>,
    pub fpkm: Option<f64>,
    pub fpkm_uq: Option<f64>,
}

/// Which of the two heterogeneity statistics a score row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    Depth2,
    Depth,
}

impl ScoreKind {
    pub fn table(&self) -> &'static str {
        match self {
            ScoreKind::Depth2 => "depth2_scores",
            ScoreKind::Depth => "depth_scores",
        }
    }
}

/// Per-sample score values, one column per normalization; a normalization
/// that was never computed for the sample stays null.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleScore {
    pub sample_id: i64,
    pub tpm: Option<f64>,
    pub fpkm: Option<f64>,
    pub fpkm_uq: Option<f64>,
}
