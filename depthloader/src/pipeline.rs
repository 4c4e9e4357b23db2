use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use depthstore::catalog::Catalog;
use depthstore::load::ExpressionLoader;
use depthstore::models::{Normalization, SampleClass, SampleRecord, SampleScore, ScoreKind};
use serde::Deserialize;

use crate::dimensions::{DimensionMaps, DimensionResolver};
use crate::error::{LoaderError, Result};
use crate::matrix::{
    matrix_path, merge_normalizations, read_gene_annotations, MergedRow, WideMatrix,
};
use crate::scores::{depth2_scores, depth_scores};
use crate::sheet::{barcode_code, classify_sample_type, read_sample_sheet};

pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Caps applied by the single-file demonstration path.
const DEMO_GENE_LIMIT: usize = 100;
const DEMO_SAMPLE_LIMIT: usize = 5;

#[derive(Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory holding one folder per site.
    pub data_dir: PathBuf,
    /// Rows per commit for batched writes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Whether to attempt the bulk staging-file path before falling back.
    #[serde(default = "default_bulk_load")]
    pub bulk_load_enabled: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_bulk_load() -> bool {
    true
}

impl PipelineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            bulk_load_enabled: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub sites: Vec<String>,
    pub sites_failed: usize,
    pub expression_rows: usize,
    pub scored_samples: usize,
}

/// Sequential driver for the whole population run: dimension resolution in
/// dependency order, then expression loading per (site, class), then
/// heterogeneity scoring per site. Every write is an idempotent upsert, so
/// re-running over the same tree is safe; an error inside one site is logged
/// and the run continues with the next site.
pub struct Pipeline {
    catalog: Arc<Catalog>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(catalog: Arc<Catalog>, config: PipelineConfig) -> Self {
        Self { catalog, config }
    }

    /// Site folders that contain at least one expression matrix, sorted.
    pub fn discover_sites(&self) -> Result<Vec<String>> {
        let data_dir = &self.config.data_dir;
        if !data_dir.is_dir() {
            return Err(LoaderError::MissingInput(data_dir.clone()));
        }

        let mut sites = Vec::new();
        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let has_matrix = SampleClass::ALL.iter().any(|&class| {
                Normalization::ALL
                    .iter()
                    .any(|&normalization| matrix_path(&path, class, normalization).is_some())
            });
            if !has_matrix {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                sites.push(name.to_string());
            }
        }
        sites.sort();
        Ok(sites)
    }

    pub fn run(&self) -> Result<RunSummary> {
        let run_id = self.catalog.begin_run("populate")?;
        match self.run_inner() {
            Ok(summary) => {
                let details = serde_json::json!({
                    "sites": summary.sites.len(),
                    "sites_failed": summary.sites_failed,
                    "expression_rows": summary.expression_rows,
                    "scored_samples": summary.scored_samples,
                })
                .to_string();
                self.catalog.finish_run(run_id, "SUCCESS", &details)?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(log_err) = self.catalog.finish_run(run_id, "FAILED", &err.to_string())
                {
                    log::warn!("could not record failed run: {log_err}");
                }
                Err(err)
            }
        }
    }

    fn run_inner(&self) -> Result<RunSummary> {
        let sites = self.discover_sites()?;
        if sites.is_empty() {
            log::warn!(
                "no site folders with expression files under {}",
                self.config.data_dir.display()
            );
            return Ok(RunSummary::default());
        }
        log::info!("found {} site(s): {}", sites.len(), sites.join(", "));

        let resolver = DimensionResolver::new(
            self.catalog.as_ref(),
            &self.config.data_dir,
            self.config.batch_size,
        );
        let maps = resolver.resolve(&sites)?;

        let mut summary = RunSummary {
            sites: sites.clone(),
            ..Default::default()
        };

        for site in &sites {
            match self.load_site_expressions(site, &maps) {
                Ok(rows) => summary.expression_rows += rows,
                Err(err) => {
                    log::error!("expression load failed for site '{site}': {err}");
                    summary.sites_failed += 1;
                }
            }
        }

        for site in &sites {
            match self.score_site(site, &maps) {
                Ok(scored) => summary.scored_samples += scored,
                Err(err) => {
                    log::error!("scoring failed for site '{site}': {err}");
                    summary.sites_failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Load both sample classes of one site. A class with incomplete
    /// normalization coverage is skipped whole: partial measurements are
    /// never loaded.
    fn load_site_expressions(&self, site: &str, maps: &DimensionMaps) -> Result<usize> {
        let site_dir = self.config.data_dir.join(site);
        let mut total = 0;
        for class in SampleClass::ALL {
            let paths: Vec<Option<PathBuf>> = Normalization::ALL
                .iter()
                .map(|&normalization| matrix_path(&site_dir, class, normalization))
                .collect();
            if paths.iter().any(Option::is_none) {
                log::warn!("site '{site}': missing {class} matrices, skipping this class");
                continue;
            }
            let paths: Vec<&PathBuf> = paths.iter().map(|p| p.as_ref().unwrap()).collect();

            let tpm = WideMatrix::read_csv(paths[0])?;
            let fpkm = WideMatrix::read_csv(paths[1])?;
            let fpkm_uq = WideMatrix::read_csv(paths[2])?;

            let merged = merge_normalizations(&tpm, &fpkm, &fpkm_uq);
            log::info!("site '{site}' {class}: {} merged rows", merged.len());

            let rows = maps.resolve_expression_rows(merged);
            let loader =
                ExpressionLoader::new(self.config.batch_size, self.config.bulk_load_enabled);
            total += loader.load(self.catalog.as_ref(), &rows)?;
        }
        Ok(total)
    }

    fn score_site(&self, site: &str, maps: &DimensionMaps) -> Result<usize> {
        let site_dir = self.config.data_dir.join(site);
        score_site_dir(self.catalog.as_ref(), &site_dir, site, &maps.samples)
    }
}

/// Compute and upsert DEPTH2 and DEPTH scores for every tumor sample of one
/// site folder, independently per normalization. The TPM matrix is the
/// primary input: without it the site is skipped. Samples absent from the
/// sample table are silently excluded, keeping the foreign-key invariant.
fn score_site_dir(
    catalog: &Catalog,
    site_dir: &Path,
    site: &str,
    samples: &HashMap<String, i64>,
) -> Result<usize> {
    if matrix_path(site_dir, SampleClass::Tumor, Normalization::Tpm).is_none() {
        log::warn!("site '{site}' has no tumor TPM matrix; skipping scoring");
        return Ok(0);
    }

    let mut depth2_by_norm = Vec::new();
    let mut depth_by_norm = Vec::new();
    let mut barcodes: BTreeSet<String> = BTreeSet::new();

    for normalization in Normalization::ALL {
        let Some(tumor_path) = matrix_path(site_dir, SampleClass::Tumor, normalization) else {
            continue;
        };
        let tumor = WideMatrix::read_csv(&tumor_path)?.log2_plus_one();
        let normal = match matrix_path(site_dir, SampleClass::Normal, normalization) {
            Some(path) => Some(WideMatrix::read_csv(&path)?.log2_plus_one()),
            None => None,
        };

        let depth2 = depth2_scores(&tumor);
        let depth = depth_scores(&tumor, normal.as_ref());
        barcodes.extend(tumor.samples.iter().cloned());
        depth2_by_norm.push((normalization, depth2.into_iter().collect::<HashMap<_, _>>()));
        depth_by_norm.push((normalization, depth.into_iter().collect::<HashMap<_, _>>()));
    }

    let mut depth2_records = Vec::new();
    let mut depth_records = Vec::new();
    let mut excluded = 0usize;
    for barcode in &barcodes {
        let Some(&sample_id) = samples.get(barcode) else {
            excluded += 1;
            continue;
        };
        depth2_records.push(assemble_score(sample_id, barcode, &depth2_by_norm));
        depth_records.push(assemble_score(sample_id, barcode, &depth_by_norm));
    }
    if excluded > 0 {
        log::warn!("site '{site}': {excluded} scored samples missing from the sample table");
    }

    catalog.upsert_scores(ScoreKind::Depth2, &depth2_records)?;
    catalog.upsert_scores(ScoreKind::Depth, &depth_records)?;
    log::info!("site '{site}': scored {} samples", depth2_records.len());
    Ok(depth2_records.len())
}

fn assemble_score(
    sample_id: i64,
    barcode: &str,
    by_norm: &[(Normalization, HashMap<String, Option<f64>>)],
) -> SampleScore {
    let mut score = SampleScore {
        sample_id,
        tpm: None,
        fpkm: None,
        fpkm_uq: None,
    };
    for (normalization, values) in by_norm {
        let value = values.get(barcode).copied().flatten();
        match normalization {
            Normalization::Tpm => score.tpm = value,
            Normalization::Fpkm => score.fpkm = value,
            Normalization::FpkmUq => score.fpkm_uq = value,
        }
    }
    score
}

/// Demonstration path: populate the store from a single tumor TPM matrix.
///
/// Walks the same stations as the full pipeline — genes, site, cancer types,
/// samples, a capped slice of expression rows, then both scores — but scoped
/// to one file and its folder, so the whole flow can be inspected quickly.
pub fn run_single_file(
    catalog: &Catalog,
    file: &Path,
    batch_size: usize,
    bulk_load_enabled: bool,
) -> Result<RunSummary> {
    if !file.is_file() {
        return Err(LoaderError::MissingInput(file.to_path_buf()));
    }
    let site_dir = file
        .parent()
        .ok_or_else(|| LoaderError::Malformed("matrix file has no parent folder".into()))?;
    let site = site_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unknown")
        .to_string();
    log::info!("single-file demonstration for site '{site}'");

    // Genes from the one matrix.
    let genes = read_gene_annotations(file)?;
    catalog.upsert_genes(&genes)?;
    let gene_map = catalog.gene_ids()?;
    log::info!("upserted {} genes", genes.len());

    // The folder name is the site.
    catalog.ensure_sites(std::slice::from_ref(&site))?;
    let site_id = catalog.site_ids()?[&site];

    // Cancer types and samples from the adjacent sheet; barcode-only tumor
    // records when the sheet is absent.
    let tpm = WideMatrix::read_csv(file)?;
    let sheet_path = site_dir.join("sample_sheet.csv");
    let sample_records = match read_sample_sheet(&sheet_path) {
        Ok(rows) => {
            let codes: BTreeSet<String> = rows
                .iter()
                .filter_map(|row| row.tcga_code.clone())
                .collect();
            let cancer_types: Vec<_> = codes
                .into_iter()
                .map(|tcga_code| depthstore::models::CancerTypeRecord { tcga_code, site_id })
                .collect();
            catalog.upsert_cancer_types(&cancer_types)?;
            let code_map = catalog.cancer_type_ids()?;

            rows.into_iter()
                .map(|row| {
                    let class = classify_sample_type(&row.sample_type);
                    let code = row.tcga_code.or_else(|| barcode_code(&row.barcode));
                    let cancer_type_id =
                        code.as_deref().and_then(|code| code_map.get(code).copied());
                    SampleRecord {
                        barcode: row.barcode,
                        class,
                        cancer_type_id,
                    }
                })
                .collect()
        }
        Err(err) => {
            log::warn!("no usable sample sheet at {}: {err}", sheet_path.display());
            tpm.samples
                .iter()
                .map(|barcode| SampleRecord {
                    barcode: barcode.clone(),
                    class: SampleClass::Tumor,
                    cancer_type_id: None,
                })
                .collect::<Vec<_>>()
        }
    };
    catalog.upsert_samples(&sample_records, batch_size)?;
    let sample_map = catalog.sample_ids()?;
    log::info!("upserted {} samples", sample_records.len());

    // A capped slice of expression rows, merged with the sibling matrices
    // when they exist (their values stay missing otherwise).
    let fpkm = matrix_path(site_dir, SampleClass::Tumor, Normalization::Fpkm)
        .map(|path| WideMatrix::read_csv(&path))
        .transpose()?;
    let fpkm_uq = matrix_path(site_dir, SampleClass::Tumor, Normalization::FpkmUq)
        .map(|path| WideMatrix::read_csv(&path))
        .transpose()?;
    let merged = merge_demo_slice(&tpm, fpkm.as_ref(), fpkm_uq.as_ref());

    let maps = DimensionMaps {
        genes: gene_map,
        samples: sample_map.clone(),
        ..Default::default()
    };
    let rows = maps.resolve_expression_rows(merged);
    let loader = ExpressionLoader::new(batch_size, bulk_load_enabled);
    let expression_rows = loader.load(catalog, &rows)?;

    // Scores over the full matrices, exactly as the pipeline computes them.
    let scored_samples = score_site_dir(catalog, site_dir, &site, &sample_map)?;

    Ok(RunSummary {
        sites: vec![site],
        sites_failed: 0,
        expression_rows,
        scored_samples,
    })
}

/// Left-merge a capped gene × sample slice of the TPM matrix with the
/// optional sibling normalizations.
fn merge_demo_slice(
    tpm: &WideMatrix,
    fpkm: Option<&WideMatrix>,
    fpkm_uq: Option<&WideMatrix>,
) -> Vec<MergedRow> {
    let lookup = |matrix: Option<&WideMatrix>, gene: &str, barcode: &str| -> Option<f64> {
        let matrix = matrix?;
        let gene_row = matrix.genes.iter().position(|g| g == gene)?;
        let sample_col = matrix.samples.iter().position(|s| s == barcode)?;
        let value = matrix.values[[gene_row, sample_col]];
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    };

    let mut rows = Vec::new();
    for (gene_row, gene) in tpm.genes.iter().take(DEMO_GENE_LIMIT).enumerate() {
        for (sample_col, barcode) in tpm.samples.iter().take(DEMO_SAMPLE_LIMIT).enumerate() {
            let value = tpm.values[[gene_row, sample_col]];
            rows.push(MergedRow {
                ensembl_id: gene.clone(),
                barcode: barcode.clone(),
                tpm: if value.is_nan() { None } else { Some(value) },
                fpkm: lookup(fpkm, gene, barcode),
                fpkm_uq: lookup(fpkm_uq, gene, barcode),
            });
        }
    }
    rows
}
