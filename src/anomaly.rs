//! Population-level outlier detection over the rectangular feature matrix.
//!
//! The primary pass standardizes every column and scores each student by mean
//! distance to the k nearest neighbours in standardized space; the students
//! with the sparsest neighbourhoods are flagged, `ceil(N × contamination)` of
//! them. When the matrix is degenerate the detector falls back to flagging the
//! first `ceil(N × contamination)` students in stable input order, so the
//! flagged count never changes, only the selection.

use tracing::warn;

use crate::error::CoreError;
use crate::features::{FeatureVector, FEATURE_COLUMNS};
use crate::models::StudentId;
use crate::stats;

const KNN_NEIGHBOURS: usize = 5;

/// Rectangular population matrix: one row per student, one column per feature
/// name, missing cells filled with the per-column median.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub student_ids: Vec<StudentId>,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    /// Build the matrix from per-student vectors. Every row gets the full
    /// column set; a cell missing from a vector takes the median of the values
    /// present in that column across the population (0 when nobody has it).
    pub fn build(vectors: &[FeatureVector]) -> Self {
        let columns: Vec<&'static str> = FEATURE_COLUMNS.to_vec();
        let mut fills = Vec::with_capacity(columns.len());
        for col in &columns {
            let present: Vec<f64> = vectors.iter().filter_map(|v| v.get(col)).collect();
            fills.push(stats::median(&present).unwrap_or(0.0));
        }

        let rows = vectors
            .iter()
            .map(|v| {
                columns
                    .iter()
                    .zip(&fills)
                    .map(|(col, &fill)| v.get(col).unwrap_or(fill))
                    .collect()
            })
            .collect();

        Self {
            student_ids: vectors.iter().map(|v| v.student_id.clone()).collect(),
            columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Standardize every column to zero mean and unit variance. Constant
    /// columns become all zeros instead of dividing by zero.
    pub fn standardized(&self) -> Vec<Vec<f64>> {
        let n_cols = self.columns.len();
        let mut out = self.rows.clone();
        for c in 0..n_cols {
            let column: Vec<f64> = self.rows.iter().map(|r| r[c]).collect();
            let mean = stats::mean(&column);
            let std = stats::std_dev(&column);
            for row in out.iter_mut() {
                row[c] = if std > 0.0 { (row[c] - mean) / std } else { 0.0 };
            }
        }
        out
    }
}

/// Number of students the configured contamination fraction flags.
pub fn flag_count(population: usize, contamination: f64) -> usize {
    if population == 0 || contamination <= 0.0 {
        return 0;
    }
    ((population as f64 * contamination).ceil() as usize).min(population)
}

/// Detect outliers, falling back deterministically when the detector cannot
/// run. Returns row indices into the matrix.
pub fn detect(matrix: &FeatureMatrix, contamination: f64) -> Vec<usize> {
    match density_outliers(matrix, contamination) {
        Ok(flagged) => flagged,
        Err(e) => {
            warn!(error = %e, "outlier detector unavailable, using deterministic fallback");
            fallback(matrix.len(), contamination)
        }
    }
}

/// Deterministic fallback: the first `ceil(N × contamination)` students in
/// stable input order.
pub fn fallback(population: usize, contamination: f64) -> Vec<usize> {
    (0..flag_count(population, contamination)).collect()
}

fn density_outliers(matrix: &FeatureMatrix, contamination: f64) -> Result<Vec<usize>, CoreError> {
    let n = matrix.len();
    let take = flag_count(n, contamination);
    if take == 0 {
        return Ok(Vec::new());
    }
    if n < 2 {
        return Err(CoreError::DegenerateMatrix(
            "fewer than 2 rows".to_string(),
        ));
    }

    let standardized = matrix.standardized();
    if standardized
        .iter()
        .flatten()
        .any(|v| !v.is_finite())
    {
        return Err(CoreError::DegenerateMatrix(
            "non-finite cell after standardization".to_string(),
        ));
    }

    let k = KNN_NEIGHBOURS.min(n - 1);
    let mut scores: Vec<(usize, f64)> = Vec::with_capacity(n);
    for (i, row) in standardized.iter().enumerate() {
        let mut dists: Vec<f64> = standardized
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, other)| euclidean(row, other))
            .collect();
        dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let score = stats::mean(&dists[..k]);
        if !score.is_finite() {
            return Err(CoreError::DegenerateMatrix(
                "non-finite neighbour distance".to_string(),
            ));
        }
        scores.push((i, score));
    }

    if scores.iter().all(|(_, s)| *s == 0.0) {
        // Every student identical: density carries no signal.
        return Err(CoreError::DegenerateMatrix(
            "zero variance across population".to_string(),
        ));
    }

    // Sparsest neighbourhoods first; ties break on row order for determinism.
    scores.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mut flagged: Vec<usize> = scores.into_iter().take(take).map(|(i, _)| i).collect();
    flagged.sort_unstable();
    Ok(flagged)
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
