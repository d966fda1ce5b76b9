//! Small numeric helpers shared by the extractors and classifiers.

/// Arithmetic mean; 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; 0.0 when fewer than 2 values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Median of a sample; None for an empty slice. Non-finite values are
/// dropped before sorting.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Ordinary least-squares slope of `values` against their index. Defined as
/// 0.0 when fewer than 2 points exist or the fit degenerates.
pub fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        return 0.0;
    }
    let slope = num / den;
    if slope.is_finite() {
        slope
    } else {
        0.0
    }
}

/// Length of the longest run of consecutive values strictly below `floor`,
/// scanning once in the given (chronological) order.
pub fn longest_run_below(values: &[f64], floor: f64) -> usize {
    let mut longest = 0usize;
    let mut current = 0usize;
    for &v in values {
        if v < floor {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slope_is_zero_below_two_points() {
        assert_eq!(ols_slope(&[]), 0.0);
        assert_eq!(ols_slope(&[42.0]), 0.0);
    }

    #[test]
    fn slope_matches_exact_line() {
        let values = [100.0, 90.0, 80.0, 70.0];
        assert!((ols_slope(&values) + 10.0).abs() < 1e-9);
    }

    #[test]
    fn slope_of_constant_series_is_zero() {
        assert_eq!(ols_slope(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn longest_run_counts_consecutive_months_only() {
        assert_eq!(longest_run_below(&[250.0, 280.0, 400.0, 290.0], 300.0), 2);
        assert_eq!(longest_run_below(&[400.0, 500.0], 300.0), 0);
        assert_eq!(longest_run_below(&[], 300.0), 0);
    }

    #[test]
    fn longest_run_is_monotone_under_appended_low_months() {
        let mut history = vec![250.0, 400.0, 280.0];
        let mut last = longest_run_below(&history, 300.0);
        for _ in 0..5 {
            history.push(200.0);
            let next = longest_run_below(&history, 300.0);
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, 6);
    }

    #[test]
    fn median_ignores_non_finite_samples() {
        assert_eq!(median(&[1.0, f64::NAN, 3.0]), Some(2.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn std_dev_needs_two_samples() {
        assert_eq!(std_dev(&[7.0]), 0.0);
        assert!((std_dev(&[2.0, 4.0]) - 1.0).abs() < 1e-9);
    }
}
