use ndarray::Array2;

use crate::matrix::WideMatrix;

/// Per-sample scores keyed by barcode; a sample whose score could not be
/// computed (no surviving values) carries `None`.
pub type ScoreSeries = Vec<(String, Option<f64>)>;

/// DEPTH2: variability-of-deviation statistic.
///
/// Every gene row is z-scored against its own distribution across samples
/// (missing-aware, population deviation); rows with zero or undefined
/// variance propagate as missing rather than dividing by zero. A sample's
/// score is the population standard deviation of its absolute z-scores
/// across genes. A sample that deviates from the population unevenly across
/// genes disperses its |z| values more than one deviating uniformly.
pub fn depth2_scores(matrix: &WideMatrix) -> ScoreSeries {
    if matrix.is_empty() {
        return Vec::new();
    }

    let (n_genes, n_samples) = matrix.values.dim();
    let mut abs_z = Array2::from_elem((n_genes, n_samples), f64::NAN);
    for (gene_row, row) in matrix.values.rows().into_iter().enumerate() {
        let finite: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
        let Some(row_mean) = mean(&finite) else {
            continue;
        };
        let Some(row_std) = population_std(&finite, row_mean) else {
            continue;
        };
        if row_std == 0.0 {
            continue;
        }
        for (sample_col, &value) in row.iter().enumerate() {
            if !value.is_nan() {
                abs_z[[gene_row, sample_col]] = ((value - row_mean) / row_std).abs();
            }
        }
    }

    matrix
        .samples
        .iter()
        .enumerate()
        .map(|(sample_col, barcode)| {
            let finite: Vec<f64> = abs_z
                .column(sample_col)
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .collect();
            let score = mean(&finite).and_then(|m| population_std(&finite, m));
            (barcode.clone(), score)
        })
        .collect()
}

/// DEPTH: deviation-from-reference statistic.
///
/// The per-gene reference is the missing-aware mean across normal samples
/// when a normal matrix is supplied (aligned by gene identifier), otherwise
/// the mean across the tumor samples themselves. A sample's score is the
/// sample standard deviation, across genes, of its squared deviations from
/// the reference.
pub fn depth_scores(tumor: &WideMatrix, normal: Option<&WideMatrix>) -> ScoreSeries {
    if tumor.is_empty() {
        return Vec::new();
    }

    let normal = normal.filter(|matrix| !matrix.is_empty());
    let normal_rows: Option<std::collections::HashMap<&str, usize>> = normal.map(|matrix| {
        matrix
            .genes
            .iter()
            .enumerate()
            .map(|(idx, gene)| (gene.as_str(), idx))
            .collect()
    });

    let reference: Vec<Option<f64>> = tumor
        .genes
        .iter()
        .enumerate()
        .map(|(gene_row, gene)| match (normal, &normal_rows) {
            (Some(normal_matrix), Some(rows)) => rows.get(gene.as_str()).and_then(|&row| {
                let finite: Vec<f64> = normal_matrix
                    .values
                    .row(row)
                    .iter()
                    .copied()
                    .filter(|v| !v.is_nan())
                    .collect();
                mean(&finite)
            }),
            _ => {
                let finite: Vec<f64> = tumor
                    .values
                    .row(gene_row)
                    .iter()
                    .copied()
                    .filter(|v| !v.is_nan())
                    .collect();
                mean(&finite)
            }
        })
        .collect();

    tumor
        .samples
        .iter()
        .enumerate()
        .map(|(sample_col, barcode)| {
            let deviations: Vec<f64> = tumor
                .values
                .column(sample_col)
                .iter()
                .zip(&reference)
                .filter_map(|(&value, reference)| {
                    let reference = (*reference)?;
                    if value.is_nan() {
                        None
                    } else {
                        Some((value - reference).powi(2))
                    }
                })
                .collect();
            (barcode.clone(), sample_std(&deviations))
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population (ddof 0) standard deviation; defined for any non-empty set,
/// including a single value.
fn population_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / values.len() as f64).sqrt())
}

/// Sample (ddof 1) standard deviation; undefined for fewer than two values.
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}
