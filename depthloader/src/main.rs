use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use depthloader::pipeline::{run_single_file, Pipeline, PipelineConfig, DEFAULT_BATCH_SIZE};
use depthstore::config::StoreConfig;
use depthstore::DepthStore;

/// Populate the expression warehouse from per-site matrices and compute
/// tumor-heterogeneity scores.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Root directory holding one folder per site
    #[arg(long, default_value = "data/raw")]
    data_dir: PathBuf,

    /// SQLite database file
    #[arg(long, default_value = "depth.sqlite")]
    database: PathBuf,

    /// Rows per commit for batched writes
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Skip the bulk staging-file path and upsert row batches directly
    #[arg(long)]
    no_bulk_load: bool,

    /// Run the single-file demonstration path on one tumor TPM matrix
    /// instead of the full pipeline
    #[arg(long, value_name = "TUMOR_TPM_CSV")]
    example: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let store = DepthStore::open(StoreConfig::at(&cli.database))?;
    let config = PipelineConfig {
        data_dir: cli.data_dir,
        batch_size: cli.batch_size,
        bulk_load_enabled: !cli.no_bulk_load,
    };

    let summary = match &cli.example {
        Some(file) => run_single_file(
            &store.catalog,
            file,
            config.batch_size,
            config.bulk_load_enabled,
        )?,
        None => Pipeline::new(Arc::clone(&store.catalog), config).run()?,
    };

    log::info!(
        "run complete: {} site(s), {} failed, {} expression rows, {} scored samples",
        summary.sites.len(),
        summary.sites_failed,
        summary.expression_rows,
        summary.scored_samples,
    );
    Ok(())
}
