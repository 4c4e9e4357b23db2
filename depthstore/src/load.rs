use std::io::Write;
use std::path::PathBuf;

use rusqlite::{params, Connection};
use tempfile::NamedTempFile;

use crate::catalog::Catalog;
use crate::errors::{Result, StoreError};
use crate::models::ExpressionRow;

/// Marker for a missing value in the staging file.
const STAGING_NULL: &str = "\\N";

const UPSERT_SQL: &str = "INSERT INTO gene_expressions (gene_id, sample_id, tpm, fpkm, fpkm_uq)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(gene_id, sample_id) DO UPDATE SET
        tpm = excluded.tpm,
        fpkm = excluded.fpkm,
        fpkm_uq = excluded.fpkm_uq";

/// A way of applying a batch of expression fact rows to the store.
///
/// Implementations return a structured error on failure; the coordinator
/// decides whether another strategy gets a turn.
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn load(&self, conn: &mut Connection, rows: &[ExpressionRow]) -> Result<usize>;
}

/// Bulk path: spill the rows to a tab-separated staging file, ingest the file
/// into a staging table and apply it to the fact table with a single
/// `INSERT ... SELECT ... ON CONFLICT DO UPDATE` directive, all in one
/// transaction. The staging file is a `NamedTempFile`, so it is removed on
/// success and failure alike.
pub struct BulkFileLoad {
    staging_dir: Option<PathBuf>,
}

impl BulkFileLoad {
    pub fn new() -> Self {
        Self { staging_dir: None }
    }

    pub fn in_dir(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: Some(staging_dir.into()),
        }
    }

    fn write_staging(&self, rows: &[ExpressionRow]) -> Result<NamedTempFile> {
        let mut staging = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        {
            let mut writer = std::io::BufWriter::new(staging.as_file_mut());
            for row in rows {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{}",
                    row.gene_id,
                    row.sample_id,
                    staging_field(row.tpm),
                    staging_field(row.fpkm),
                    staging_field(row.fpkm_uq),
                )?;
            }
            writer.flush()?;
        }
        Ok(staging)
    }
}

impl Default for BulkFileLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadStrategy for BulkFileLoad {
    fn name(&self) -> &'static str {
        "bulk-staging-file"
    }

    fn load(&self, conn: &mut Connection, rows: &[ExpressionRow]) -> Result<usize> {
        let staging = self.write_staging(rows)?;

        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS staging_expressions (
                gene_id INTEGER NOT NULL,
                sample_id INTEGER NOT NULL,
                tpm REAL,
                fpkm REAL,
                fpkm_uq REAL
            );
            DELETE FROM staging_expressions;",
        )?;
        {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .from_path(staging.path())?;
            let mut stmt = tx.prepare(
                "INSERT INTO staging_expressions (gene_id, sample_id, tpm, fpkm, fpkm_uq)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in reader.records() {
                let record = record?;
                let gene_id: i64 = staging_key(record.get(0))?;
                let sample_id: i64 = staging_key(record.get(1))?;
                stmt.execute(params![
                    gene_id,
                    sample_id,
                    staging_value(record.get(2)),
                    staging_value(record.get(3)),
                    staging_value(record.get(4)),
                ])?;
            }
        }
        // `WHERE true` keeps SQLite from parsing ON CONFLICT as a join clause.
        let applied = tx.execute(
            "INSERT INTO gene_expressions (gene_id, sample_id, tpm, fpkm, fpkm_uq)
             SELECT gene_id, sample_id, tpm, fpkm, fpkm_uq FROM staging_expressions
             WHERE true
             ON CONFLICT(gene_id, sample_id) DO UPDATE SET
                tpm = excluded.tpm,
                fpkm = excluded.fpkm,
                fpkm_uq = excluded.fpkm_uq",
            [],
        )?;
        tx.execute_batch("DROP TABLE staging_expressions;")?;
        tx.commit()?;
        Ok(applied)
    }
}

/// Fallback path: prepared-statement upserts chunked at `batch_size` rows,
/// one commit per chunk so a mid-run failure leaves prior chunks applied.
pub struct BatchedUpsert {
    batch_size: usize,
}

impl BatchedUpsert {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl LoadStrategy for BatchedUpsert {
    fn name(&self) -> &'static str {
        "row-batched-upsert"
    }

    fn load(&self, conn: &mut Connection, rows: &[ExpressionRow]) -> Result<usize> {
        let mut applied = 0;
        for chunk in rows.chunks(self.batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
                for row in chunk {
                    stmt.execute(params![
                        row.gene_id,
                        row.sample_id,
                        row.tpm,
                        row.fpkm,
                        row.fpkm_uq,
                    ])?;
                }
            }
            tx.commit()?;
            applied += chunk.len();
            log::debug!("committed expression batch of {} rows", chunk.len());
        }
        Ok(applied)
    }
}

/// Coordinator that attempts each strategy in order and falls back on a
/// structured failure, logging the recovery as a warning.
pub struct ExpressionLoader {
    strategies: Vec<Box<dyn LoadStrategy>>,
}

impl ExpressionLoader {
    pub fn new(batch_size: usize, bulk_load_enabled: bool) -> Self {
        let mut strategies: Vec<Box<dyn LoadStrategy>> = Vec::new();
        if bulk_load_enabled {
            strategies.push(Box::new(BulkFileLoad::new()));
        }
        strategies.push(Box::new(BatchedUpsert::new(batch_size)));
        Self { strategies }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn LoadStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn load(&self, catalog: &Catalog, rows: &[ExpressionRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = catalog.lock();
        let mut last_error = None;
        for strategy in &self.strategies {
            match strategy.load(&mut conn, rows) {
                Ok(applied) => {
                    log::info!(
                        "loaded {} expression rows via '{}'",
                        applied,
                        strategy.name()
                    );
                    return Ok(applied);
                }
                Err(err) => {
                    log::warn!(
                        "load strategy '{}' failed ({}); trying next strategy",
                        strategy.name(),
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(StoreError::AllStrategiesFailed(
            last_error.map(|err| err.to_string()).unwrap_or_default(),
        ))
    }
}

fn staging_field(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => STAGING_NULL.to_string(),
    }
}

fn staging_key(field: Option<&str>) -> Result<i64> {
    let field = field.ok_or_else(|| StoreError::StagingRow("missing key column".into()))?;
    field
        .parse()
        .map_err(|_| StoreError::StagingRow(format!("bad surrogate id '{field}'")))
}

fn staging_value(field: Option<&str>) -> Option<f64> {
    match field {
        None => None,
        Some(STAGING_NULL) => None,
        Some(raw) => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeneRecord, SampleClass, SampleRecord};

    fn seeded_catalog() -> Catalog {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.initialize_schema().unwrap();
        catalog
            .upsert_genes(&[
                GeneRecord {
                    ensembl_id: "ENSG1".into(),
                    symbol: Some("A".into()),
                },
                GeneRecord {
                    ensembl_id: "ENSG2".into(),
                    symbol: Some("B".into()),
                },
            ])
            .unwrap();
        catalog
            .upsert_samples(
                &[
                    SampleRecord {
                        barcode: "TCGA-AA-0001-01".into(),
                        class: SampleClass::Tumor,
                        cancer_type_id: None,
                    },
                    SampleRecord {
                        barcode: "TCGA-AA-0002-01".into(),
                        class: SampleClass::Tumor,
                        cancer_type_id: None,
                    },
                ],
                1000,
            )
            .unwrap();
        catalog
    }

    fn rows(catalog: &Catalog) -> Vec<ExpressionRow> {
        let genes = catalog.gene_ids().unwrap();
        let samples = catalog.sample_ids().unwrap();
        vec![
            ExpressionRow {
                gene_id: genes["ENSG1"],
                sample_id: samples["TCGA-AA-0001-01"],
                tpm: Some(1.5),
                fpkm: Some(2.5),
                fpkm_uq: None,
            },
            ExpressionRow {
                gene_id: genes["ENSG2"],
                sample_id: samples["TCGA-AA-0002-01"],
                tpm: None,
                fpkm: Some(0.125),
                fpkm_uq: Some(4.0),
            },
        ]
    }

    struct AlwaysFails;

    impl LoadStrategy for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }

        fn load(&self, _conn: &mut Connection, _rows: &[ExpressionRow]) -> Result<usize> {
            Err(StoreError::StagingRow("synthetic failure".into()))
        }
    }

    #[test]
    fn bulk_load_round_trips_values_and_nulls() {
        let catalog = seeded_catalog();
        let rows = rows(&catalog);

        let loader = ExpressionLoader::with_strategies(vec![Box::new(BulkFileLoad::new())]);
        let applied = loader.load(&catalog, &rows).unwrap();
        assert_eq!(applied, 2);

        let stored = catalog
            .expression_values("ENSG1", "TCGA-AA-0001-01")
            .unwrap()
            .unwrap();
        assert_eq!(stored.tpm, Some(1.5));
        assert_eq!(stored.fpkm, Some(2.5));
        assert_eq!(stored.fpkm_uq, None);
    }

    #[test]
    fn bulk_load_overwrites_on_conflict() {
        let catalog = seeded_catalog();
        let mut first = rows(&catalog);
        let loader = ExpressionLoader::with_strategies(vec![Box::new(BulkFileLoad::new())]);
        loader.load(&catalog, &first).unwrap();

        first[0].tpm = Some(9.0);
        loader.load(&catalog, &first).unwrap();

        assert_eq!(catalog.expression_count().unwrap(), 2);
        let stored = catalog
            .expression_values("ENSG1", "TCGA-AA-0001-01")
            .unwrap()
            .unwrap();
        assert_eq!(stored.tpm, Some(9.0));
    }

    #[test]
    fn batched_upsert_loads_and_overwrites() {
        let catalog = seeded_catalog();
        let mut batch = rows(&catalog);

        let loader = ExpressionLoader::with_strategies(vec![Box::new(BatchedUpsert::new(1))]);
        assert_eq!(loader.load(&catalog, &batch).unwrap(), 2);

        batch[1].fpkm_uq = Some(8.0);
        assert_eq!(loader.load(&catalog, &batch).unwrap(), 2);
        assert_eq!(catalog.expression_count().unwrap(), 2);

        let stored = catalog
            .expression_values("ENSG2", "TCGA-AA-0002-01")
            .unwrap()
            .unwrap();
        assert_eq!(stored.fpkm_uq, Some(8.0));
    }

    #[test]
    fn coordinator_falls_back_after_structured_failure() {
        let catalog = seeded_catalog();
        let batch = rows(&catalog);

        let loader = ExpressionLoader::with_strategies(vec![
            Box::new(AlwaysFails),
            Box::new(BatchedUpsert::new(1000)),
        ]);
        assert_eq!(loader.load(&catalog, &batch).unwrap(), 2);
        assert_eq!(catalog.expression_count().unwrap(), 2);
    }

    #[test]
    fn coordinator_reports_when_every_strategy_fails() {
        let catalog = seeded_catalog();
        let batch = rows(&catalog);

        let loader = ExpressionLoader::with_strategies(vec![Box::new(AlwaysFails)]);
        let err = loader.load(&catalog, &batch).unwrap_err();
        assert!(matches!(err, StoreError::AllStrategiesFailed(_)));
    }

    #[test]
    fn staging_file_is_removed_after_load() {
        let catalog = seeded_catalog();
        let batch = rows(&catalog);
        let staging_dir = tempfile::tempdir().unwrap();

        let loader = ExpressionLoader::with_strategies(vec![Box::new(BulkFileLoad::in_dir(
            staging_dir.path(),
        ))]);
        loader.load(&catalog, &batch).unwrap();

        let leftovers = std::fs::read_dir(staging_dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
