use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use depthstore::catalog::Catalog;
use depthstore::models::{
    CancerTypeRecord, ExpressionRow, GeneRecord, Normalization, SampleClass, SampleRecord,
};

use crate::error::Result;
use crate::matrix::{matrix_path, read_gene_annotations, MergedRow};
use crate::sheet::{barcode_code, classify_sample_type, read_sample_sheet};

/// The closed site vocabulary seeded regardless of what the data directory
/// contains; any additional folder with expression files is added to it.
pub const PREDEFINED_SITES: [&str; 26] = [
    "Adrenal Gland",
    "Bladder",
    "Bone Marrow and Blood",
    "Brain",
    "Breast",
    "Cervix",
    "Colorectal",
    "Esophagus",
    "Eye",
    "Head and Neck",
    "Kidney",
    "Liver",
    "Lung",
    "Lymph Nodes",
    "Ovary",
    "Pancreas",
    "Pleura",
    "Prostate",
    "Rectum",
    "Skin",
    "Soft Tissue",
    "Stomach",
    "Testis",
    "Thymus",
    "Thyroid",
    "Uterus",
];

/// Natural-key → surrogate-id lookups for the four dimension tables.
#[derive(Debug, Default)]
pub struct DimensionMaps {
    pub genes: HashMap<String, i64>,
    pub sites: HashMap<String, i64>,
    pub cancer_types: HashMap<String, i64>,
    pub samples: HashMap<String, i64>,
}

impl DimensionMaps {
    /// Resolve merged long rows to surrogate-keyed fact rows, dropping any
    /// row whose gene or sample does not resolve. Unresolved rows are never
    /// inserted with a null foreign key.
    pub fn resolve_expression_rows(&self, rows: Vec<MergedRow>) -> Vec<ExpressionRow> {
        let before = rows.len();
        let resolved: Vec<ExpressionRow> = rows
            .into_iter()
            .filter_map(|row| {
                let gene_id = *self.genes.get(&row.ensembl_id)?;
                let sample_id = *self.samples.get(&row.barcode)?;
                Some(ExpressionRow {
                    gene_id,
                    sample_id,
                    tpm: row.tpm,
                    fpkm: row.fpkm,
                    fpkm_uq: row.fpkm_uq,
                })
            })
            .collect();
        let dropped = before - resolved.len();
        if dropped > 0 {
            log::warn!("dropped {dropped} expression rows with unresolved gene or sample");
        }
        resolved
    }
}

/// Populates the four dimension tables from the per-site input folders and
/// hands back the id maps, in strict dependency order: genes and sites
/// first, then cancer types (which need site ids), then samples (which need
/// cancer-type ids).
pub struct DimensionResolver<'a> {
    catalog: &'a Catalog,
    data_dir: &'a Path,
    batch_size: usize,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(catalog: &'a Catalog, data_dir: &'a Path, batch_size: usize) -> Self {
        Self {
            catalog,
            data_dir,
            batch_size,
        }
    }

    pub fn resolve(&self, sites: &[String]) -> Result<DimensionMaps> {
        let genes = self.populate_genes(sites)?;
        let site_map = self.populate_sites(sites)?;
        let cancer_types = self.populate_cancer_types(sites, &site_map)?;
        let samples = self.populate_samples(sites, &cancer_types)?;
        Ok(DimensionMaps {
            genes,
            sites: site_map,
            cancer_types,
            samples,
        })
    }

    /// Union the distinct (identifier, symbol) pairs of every site's tumor
    /// TPM matrix. The matrices are expected to share one gene set; the
    /// union guards against drift between sites.
    fn populate_genes(&self, sites: &[String]) -> Result<HashMap<String, i64>> {
        let mut union: BTreeMap<String, Option<String>> = BTreeMap::new();
        for site in sites {
            let site_dir = self.data_dir.join(site);
            let Some(path) = matrix_path(&site_dir, SampleClass::Tumor, Normalization::Tpm)
            else {
                log::warn!("site '{site}' has no tumor TPM matrix; skipping gene discovery");
                continue;
            };
            match read_gene_annotations(&path) {
                Ok(genes) => {
                    for gene in genes {
                        union.insert(gene.ensembl_id, gene.symbol);
                    }
                }
                Err(err) => {
                    log::warn!("gene discovery failed for site '{site}': {err}");
                }
            }
        }

        let records: Vec<GeneRecord> = union
            .into_iter()
            .map(|(ensembl_id, symbol)| GeneRecord { ensembl_id, symbol })
            .collect();
        self.catalog.upsert_genes(&records)?;
        log::info!("populated {} genes", records.len());
        Ok(self.catalog.gene_ids()?)
    }

    fn populate_sites(&self, sites: &[String]) -> Result<HashMap<String, i64>> {
        let mut names: BTreeSet<String> =
            PREDEFINED_SITES.iter().map(|name| name.to_string()).collect();
        names.extend(sites.iter().cloned());
        let names: Vec<String> = names.into_iter().collect();

        let inserted = self.catalog.ensure_sites(&names)?;
        log::info!("sites: {} known, {} newly inserted", names.len(), inserted);
        Ok(self.catalog.site_ids()?)
    }

    /// Map every classification code found in a site's sheet to that site's
    /// id. Sites are visited in sorted order, so a code listed by several
    /// sites deterministically keeps the last one; each remap is logged.
    fn populate_cancer_types(
        &self,
        sites: &[String],
        site_map: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>> {
        let mut ordered = sites.to_vec();
        ordered.sort();

        let mut code_to_site: BTreeMap<String, (i64, String)> = BTreeMap::new();
        for site in &ordered {
            let Some(&site_id) = site_map.get(site) else {
                log::warn!("no site id for '{site}'; skipping cancer-type discovery");
                continue;
            };
            let sheet_path = self.data_dir.join(site).join("sample_sheet.csv");
            let rows = match read_sample_sheet(&sheet_path) {
                Ok(rows) => rows,
                Err(err) => {
                    log::warn!("skipping cancer-type discovery for site '{site}': {err}");
                    continue;
                }
            };
            for row in rows {
                let Some(code) = row.tcga_code else {
                    continue;
                };
                if let Some((previous_id, previous_site)) = code_to_site.get(&code) {
                    if *previous_id != site_id {
                        log::warn!(
                            "classification code '{code}' remaps from site '{previous_site}' \
                             to '{site}'; last write wins"
                        );
                    }
                }
                code_to_site.insert(code, (site_id, site.clone()));
            }
        }

        let records: Vec<CancerTypeRecord> = code_to_site
            .into_iter()
            .map(|(tcga_code, (site_id, _))| CancerTypeRecord { tcga_code, site_id })
            .collect();
        self.catalog.upsert_cancer_types(&records)?;
        log::info!("populated {} cancer types", records.len());
        Ok(self.catalog.cancer_type_ids()?)
    }

    fn populate_samples(
        &self,
        sites: &[String],
        cancer_types: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>> {
        let mut records = Vec::new();
        let mut unresolved = 0usize;
        for site in sites {
            let sheet_path = self.data_dir.join(site).join("sample_sheet.csv");
            let rows = match read_sample_sheet(&sheet_path) {
                Ok(rows) => rows,
                Err(err) => {
                    log::warn!("skipping sample discovery for site '{site}': {err}");
                    continue;
                }
            };
            for row in rows {
                let class = classify_sample_type(&row.sample_type);
                let code = row.tcga_code.or_else(|| barcode_code(&row.barcode));
                let cancer_type_id = code
                    .as_deref()
                    .and_then(|code| cancer_types.get(code).copied());
                if cancer_type_id.is_none() {
                    unresolved += 1;
                    log::debug!(
                        "sample '{}' has no resolvable cancer type (code: {:?})",
                        row.barcode,
                        code
                    );
                }
                records.push(SampleRecord {
                    barcode: row.barcode,
                    class,
                    cancer_type_id,
                });
            }
        }

        if unresolved > 0 {
            log::warn!("{unresolved} samples carry a null cancer type");
        }
        self.catalog.upsert_samples(&records, self.batch_size)?;
        log::info!("populated {} samples", records.len());
        Ok(self.catalog.sample_ids()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_rows_are_dropped_not_null_padded() {
        let mut maps = DimensionMaps::default();
        maps.genes.insert("ENSG1".into(), 1);
        maps.samples.insert("TCGA-AB-0001-01".into(), 10);

        let rows = vec![
            MergedRow {
                ensembl_id: "ENSG1".into(),
                barcode: "TCGA-AB-0001-01".into(),
                tpm: Some(1.0),
                fpkm: Some(2.0),
                fpkm_uq: Some(3.0),
            },
            MergedRow {
                ensembl_id: "ENSG1".into(),
                barcode: "TCGA-ZZ-9999-01".into(),
                tpm: Some(1.0),
                fpkm: Some(2.0),
                fpkm_uq: Some(3.0),
            },
            MergedRow {
                ensembl_id: "ENSG-unknown".into(),
                barcode: "TCGA-AB-0001-01".into(),
                tpm: Some(1.0),
                fpkm: Some(2.0),
                fpkm_uq: Some(3.0),
            },
        ];

        let resolved = maps.resolve_expression_rows(rows);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].gene_id, 1);
        assert_eq!(resolved[0].sample_id, 10);
    }
}
