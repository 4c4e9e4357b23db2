use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::StoreConfig;
use crate::errors::Result;
use crate::models::{
    CancerTypeRecord, ExpressionValues, GeneRecord, SampleRecord, SampleScore, ScoreKind,
    StoredSample,
};

/// Relational catalog for the expression warehouse.
///
/// All writes are idempotent upserts keyed on the natural key of each table,
/// so a full re-run over the same input tree leaves the database unchanged.
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.database_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, used by the demo mode and tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS genes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ensembl_id TEXT NOT NULL UNIQUE,
                gene_symbol TEXT
            );
            CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS cancer_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tcga_code TEXT NOT NULL UNIQUE,
                site_id INTEGER NOT NULL REFERENCES sites(id)
            );
            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sample_barcode TEXT NOT NULL UNIQUE,
                sample_type TEXT NOT NULL,
                cancer_type_id INTEGER REFERENCES cancer_types(id)
            );
            CREATE TABLE IF NOT EXISTS gene_expressions (
                gene_id INTEGER NOT NULL REFERENCES genes(id),
                sample_id INTEGER NOT NULL REFERENCES samples(id),
                tpm REAL,
                fpkm REAL,
                fpkm_uq REAL,
                PRIMARY KEY (gene_id, sample_id)
            );
            CREATE TABLE IF NOT EXISTS depth2_scores (
                sample_id INTEGER PRIMARY KEY REFERENCES samples(id),
                tpm REAL,
                fpkm REAL,
                fpkm_uq REAL
            );
            CREATE TABLE IF NOT EXISTS depth_scores (
                sample_id INTEGER PRIMARY KEY REFERENCES samples(id),
                tpm REAL,
                fpkm REAL,
                fpkm_uq REAL
            );
            CREATE TABLE IF NOT EXISTS run_log (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT,
                details TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // --- Dimension tables ---

    /// Upsert genes keyed by ensembl id; only the display symbol is
    /// overwritten on collision.
    pub fn upsert_genes(&self, genes: &[GeneRecord]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO genes (ensembl_id, gene_symbol)
                 VALUES (?1, ?2)
                 ON CONFLICT(ensembl_id) DO UPDATE SET gene_symbol = excluded.gene_symbol",
            )?;
            for gene in genes {
                stmt.execute(params![gene.ensembl_id, gene.symbol])?;
            }
        }
        tx.commit()?;
        Ok(genes.len())
    }

    pub fn gene_ids(&self) -> Result<HashMap<String, i64>> {
        self.id_map("SELECT ensembl_id, id FROM genes")
    }

    /// Insert-only: an existing site's identity is never altered.
    pub fn ensure_sites(&self, names: &[String]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sites (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            )?;
            for name in names {
                inserted += stmt.execute(params![name])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn site_ids(&self) -> Result<HashMap<String, i64>> {
        self.id_map("SELECT name, id FROM sites")
    }

    /// Upsert classification codes; the site mapping is overwritten on
    /// collision (last write wins).
    pub fn upsert_cancer_types(&self, records: &[CancerTypeRecord]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO cancer_types (tcga_code, site_id)
                 VALUES (?1, ?2)
                 ON CONFLICT(tcga_code) DO UPDATE SET site_id = excluded.site_id",
            )?;
            for record in records {
                stmt.execute(params![record.tcga_code, record.site_id])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn cancer_type_ids(&self) -> Result<HashMap<String, i64>> {
        self.id_map("SELECT tcga_code, id FROM cancer_types")
    }

    /// Upsert samples in chunks, committing once per chunk to bound
    /// transaction size. Class and cancer type are overwritten on reload.
    pub fn upsert_samples(&self, samples: &[SampleRecord], batch_size: usize) -> Result<usize> {
        let mut conn = self.lock();
        for chunk in samples.chunks(batch_size.max(1)) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO samples (sample_barcode, sample_type, cancer_type_id)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(sample_barcode) DO UPDATE SET
                        sample_type = excluded.sample_type,
                        cancer_type_id = excluded.cancer_type_id",
                )?;
                for sample in chunk {
                    stmt.execute(params![
                        sample.barcode,
                        sample.class.as_str(),
                        sample.cancer_type_id,
                    ])?;
                }
            }
            tx.commit()?;
            log::debug!("committed sample batch of {} rows", chunk.len());
        }
        Ok(samples.len())
    }

    pub fn sample_ids(&self) -> Result<HashMap<String, i64>> {
        self.id_map("SELECT sample_barcode, id FROM samples")
    }

    pub fn sample_info(&self, barcode: &str) -> Result<Option<StoredSample>> {
        let conn = self.lock();
        let info = conn
            .query_row(
                "SELECT id, sample_type, cancer_type_id FROM samples WHERE sample_barcode = ?1",
                params![barcode],
                |row| {
                    Ok(StoredSample {
                        id: row.get(0)?,
                        sample_type: row.get(1)?,
                        cancer_type_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    // --- Score tables ---

    pub fn upsert_scores(&self, kind: ScoreKind, scores: &[SampleScore]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {} (sample_id, tpm, fpkm, fpkm_uq)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sample_id) DO UPDATE SET
                tpm = excluded.tpm,
                fpkm = excluded.fpkm,
                fpkm_uq = excluded.fpkm_uq",
            kind.table()
        );
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for score in scores {
                stmt.execute(params![score.sample_id, score.tpm, score.fpkm, score.fpkm_uq])?;
            }
        }
        tx.commit()?;
        Ok(scores.len())
    }

    // --- Read-backs ---

    pub fn expression_count(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM gene_expressions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn score_count(&self, kind: ScoreKind) -> Result<u64> {
        let conn = self.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch the stored expression values for a (gene, sample) pair by
    /// natural key. Returns `None` when no fact row exists.
    pub fn expression_values(
        &self,
        ensembl_id: &str,
        barcode: &str,
    ) -> Result<Option<ExpressionValues>> {
        let conn = self.lock();
        let values = conn
            .query_row(
                "SELECT e.tpm, e.fpkm, e.fpkm_uq
                 FROM gene_expressions e
                 JOIN genes g ON g.id = e.gene_id
                 JOIN samples s ON s.id = e.sample_id
                 WHERE g.ensembl_id = ?1 AND s.sample_barcode = ?2",
                params![ensembl_id, barcode],
                |row| {
                    Ok(ExpressionValues {
                        tpm: row.get(0)?,
                        fpkm: row.get(1)?,
                        fpkm_uq: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(values)
    }

    pub fn score_values(
        &self,
        kind: ScoreKind,
        barcode: &str,
    ) -> Result<Option<ExpressionValues>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT t.tpm, t.fpkm, t.fpkm_uq
             FROM {} t
             JOIN samples s ON s.id = t.sample_id
             WHERE s.sample_barcode = ?1",
            kind.table()
        );
        let values = conn
            .query_row(&sql, params![barcode], |row| {
                Ok(ExpressionValues {
                    tpm: row.get(0)?,
                    fpkm: row.get(1)?,
                    fpkm_uq: row.get(2)?,
                })
            })
            .optional()?;
        Ok(values)
    }

    // --- Run log ---

    pub fn begin_run(&self, task_name: &str) -> Result<i64> {
        let conn = self.lock();
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO run_log (task_name, start_time, status) VALUES (?1, ?2, 'RUNNING')",
            params![task_name, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, status: &str, details: &str) -> Result<()> {
        let conn = self.lock();
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE run_log SET status = ?1, details = ?2, end_time = ?3 WHERE run_id = ?4",
            params![status, details, end_time, run_id],
        )?;
        Ok(())
    }

    fn id_map(&self, sql: &str) -> Result<HashMap<String, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut map = HashMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let id: i64 = row.get(1)?;
            map.insert(key, id);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleClass;

    fn setup() -> Catalog {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.initialize_schema().unwrap();
        catalog
    }

    #[test]
    fn gene_upsert_overwrites_symbol_only() {
        let catalog = setup();

        catalog
            .upsert_genes(&[GeneRecord {
                ensembl_id: "ENSG00000141510".into(),
                symbol: Some("TP53".into()),
            }])
            .unwrap();
        let first = catalog.gene_ids().unwrap();

        catalog
            .upsert_genes(&[GeneRecord {
                ensembl_id: "ENSG00000141510".into(),
                symbol: Some("TP53-renamed".into()),
            }])
            .unwrap();
        let second = catalog.gene_ids().unwrap();

        // Surrogate id is stable across the symbol update.
        assert_eq!(first["ENSG00000141510"], second["ENSG00000141510"]);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn sites_are_insert_only() {
        let catalog = setup();

        let inserted = catalog
            .ensure_sites(&["Lung".to_string(), "Breast".to_string()])
            .unwrap();
        assert_eq!(inserted, 2);

        let again = catalog
            .ensure_sites(&["Lung".to_string(), "Thymus".to_string()])
            .unwrap();
        assert_eq!(again, 1);

        let ids = catalog.site_ids().unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn cancer_type_site_mapping_last_write_wins() {
        let catalog = setup();
        catalog
            .ensure_sites(&["Lung".to_string(), "Breast".to_string()])
            .unwrap();
        let sites = catalog.site_ids().unwrap();

        catalog
            .upsert_cancer_types(&[CancerTypeRecord {
                tcga_code: "TCGA-LU".into(),
                site_id: sites["Lung"],
            }])
            .unwrap();
        catalog
            .upsert_cancer_types(&[CancerTypeRecord {
                tcga_code: "TCGA-LU".into(),
                site_id: sites["Breast"],
            }])
            .unwrap();

        let conn = catalog.lock();
        let site_id: i64 = conn
            .query_row(
                "SELECT site_id FROM cancer_types WHERE tcga_code = 'TCGA-LU'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(site_id, sites["Breast"]);
    }

    #[test]
    fn sample_upsert_overwrites_class_and_cancer_type() {
        let catalog = setup();

        catalog
            .upsert_samples(
                &[SampleRecord {
                    barcode: "TCGA-AB-0001-01".into(),
                    class: SampleClass::Tumor,
                    cancer_type_id: None,
                }],
                1000,
            )
            .unwrap();

        catalog
            .upsert_samples(
                &[SampleRecord {
                    barcode: "TCGA-AB-0001-01".into(),
                    class: SampleClass::Normal,
                    cancer_type_id: None,
                }],
                1000,
            )
            .unwrap();

        let conn = catalog.lock();
        let class: String = conn
            .query_row(
                "SELECT sample_type FROM samples WHERE sample_barcode = 'TCGA-AB-0001-01'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(class, "normal");
    }

    #[test]
    fn score_upsert_is_idempotent() {
        let catalog = setup();
        catalog
            .upsert_samples(
                &[SampleRecord {
                    barcode: "TCGA-AB-0001-01".into(),
                    class: SampleClass::Tumor,
                    cancer_type_id: None,
                }],
                1000,
            )
            .unwrap();
        let sample_id = catalog.sample_ids().unwrap()["TCGA-AB-0001-01"];

        let score = SampleScore {
            sample_id,
            tpm: Some(0.25),
            fpkm: None,
            fpkm_uq: Some(0.5),
        };
        catalog.upsert_scores(ScoreKind::Depth2, &[score.clone()]).unwrap();
        catalog.upsert_scores(ScoreKind::Depth2, &[score]).unwrap();

        assert_eq!(catalog.score_count(ScoreKind::Depth2).unwrap(), 1);
        let stored = catalog
            .score_values(ScoreKind::Depth2, "TCGA-AB-0001-01")
            .unwrap()
            .unwrap();
        assert_eq!(stored.tpm, Some(0.25));
        assert_eq!(stored.fpkm, None);
        assert_eq!(stored.fpkm_uq, Some(0.5));
    }
}
