/// Linear calibration of one series against another, and fixed linear
/// combinations of several series.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::model::{append_tag, CalibrationDataError, Observation, Series, TAG_ADJUSTED, TAG_LINEAR_COMBINATION};

/// Residual quantiles reported alongside calibration coefficients.
pub const RESIDUAL_QUANTILES: [f64; 5] = [0.05, 0.25, 0.5, 0.75, 0.95];

/// Fitted `truth ≈ intercept + coefficient * sim` and its fit quality.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationStats {
    pub intercept: f64,
    pub coefficient: f64,
    pub r2: f64,
    pub pairs: usize,
    /// `(level, residual)` for each of `RESIDUAL_QUANTILES`.
    pub residual_quantiles: Vec<(f64, f64)>,
}

/// Solve a least squares problem using SVD, loosening the tolerance until a
/// finite solution comes out.
fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }
    None
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile(sorted: &[f64], level: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = level.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Fits `truth` against `sim` over their shared non-null timestamps and
/// predicts over the full domain of `sim`.
///
/// Predicted cells get `adjusted` appended to their tag; null sim cells stay
/// null.
pub fn calibrate(sim: &Series, truth: &Series) -> Result<(Series, CalibrationStats), CalibrationDataError> {
    let pairs: Vec<(f64, f64)> = sim
        .iter()
        .filter_map(|obs| Some((obs.value?, truth.value_at(&obs.timestamp)?)))
        .collect();

    if pairs.is_empty() {
        return Err(CalibrationDataError::NoValidPairs);
    }
    let first_x = pairs[0].0;
    if pairs.len() < 2 || pairs.iter().all(|(x, _)| *x == first_x) {
        return Err(CalibrationDataError::Singular { pairs: pairs.len() });
    }

    let n = pairs.len();
    let design = DMatrix::from_fn(n, 2, |row, col| if col == 0 { 1.0 } else { pairs[row].0 });
    let target = DVector::from_iterator(n, pairs.iter().map(|(_, y)| *y));
    let beta = solve_least_squares(&design, &target).ok_or(CalibrationDataError::Singular { pairs: n })?;
    let (intercept, coefficient) = (beta[0], beta[1]);

    let mut residuals: Vec<f64> = pairs
        .iter()
        .map(|(x, y)| y - (intercept + coefficient * x))
        .collect();
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n as f64;
    let ss_tot: f64 = pairs.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = residuals.iter().map(|r| r.powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    residuals.sort_by(|a, b| a.total_cmp(b));
    let residual_quantiles = RESIDUAL_QUANTILES
        .iter()
        .map(|&level| (level, quantile(&residuals, level)))
        .collect();

    let adjusted = Series::from_observations(
        sim.iter()
            .map(|obs| match obs.value {
                Some(v) => Observation {
                    timestamp: obs.timestamp,
                    value: Some(intercept + coefficient * v),
                    tag: Some(append_tag(obs.tag.as_deref(), TAG_ADJUSTED)),
                },
                None => obs.clone(),
            })
            .collect(),
    );

    Ok((
        adjusted,
        CalibrationStats {
            intercept,
            coefficient,
            r2,
            pairs: n,
            residual_quantiles,
        },
    ))
}

/// `intercept + Σ coefficients[i] * inputs[i]` over the outer join of all
/// inputs. A row where any input is missing is null. Row tags extend the
/// first input's tag.
///
/// Callers guarantee `coefficients.len() == inputs.len()`; extra entries on
/// either side are ignored.
pub fn linear_combine(inputs: &[&Series], intercept: f64, coefficients: &[f64]) -> Series {
    let index = Series::union_index(inputs);
    let primary = inputs.first();

    Series::from_observations(
        index
            .iter()
            .map(|t| {
                let value = inputs
                    .iter()
                    .zip(coefficients)
                    .try_fold(intercept, |acc, (series, c)| series.value_at(t).map(|v| acc + c * v));
                let previous = primary.and_then(|p| p.get(t)).and_then(|o| o.tag.as_deref());
                Observation {
                    timestamp: *t,
                    value,
                    tag: value.map(|_| append_tag(previous, TAG_LINEAR_COMBINATION)),
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Timestamp, TAG_OBS};
    use chrono::{FixedOffset, TimeZone};

    fn t(hour: u32) -> Timestamp {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .unwrap()
    }

    fn series(values: &[Option<f64>]) -> Series {
        let points: Vec<_> = values.iter().enumerate().map(|(i, v)| (t(i as u32), *v)).collect();
        Series::from_values(&points, Some(TAG_OBS))
    }

    #[test]
    fn test_calibration_recovers_exact_line() {
        let sim = series(&[Some(0.0), Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        let truth = series(&[Some(1.0), Some(3.0), Some(5.0), None, None]);
        let (adjusted, stats) = calibrate(&sim, &truth).expect("three pairs fit a line");

        assert!((stats.intercept - 1.0).abs() < 1e-9);
        assert!((stats.coefficient - 2.0).abs() < 1e-9);
        assert!((stats.r2 - 1.0).abs() < 1e-9);
        assert_eq!(stats.pairs, 3);
        assert_eq!(stats.residual_quantiles.len(), RESIDUAL_QUANTILES.len());

        assert_eq!(adjusted.len(), sim.len(), "prediction covers the whole sim domain");
        assert!((adjusted.value_at(&t(4)).unwrap() - 9.0).abs() < 1e-9);
        assert_eq!(adjusted.observations()[4].tag.as_deref(), Some("obs,adjusted"));
    }

    #[test]
    fn test_calibration_without_overlap_is_an_error() {
        let sim = series(&[Some(1.0), Some(2.0), None]);
        let truth = series(&[None, None, Some(3.0)]);
        assert_eq!(calibrate(&sim, &truth), Err(CalibrationDataError::NoValidPairs));
    }

    #[test]
    fn test_calibration_with_constant_sim_is_singular() {
        let sim = series(&[Some(1.0), Some(1.0)]);
        let truth = series(&[Some(2.0), Some(3.0)]);
        assert_eq!(calibrate(&sim, &truth), Err(CalibrationDataError::Singular { pairs: 2 }));
    }

    #[test]
    fn test_quantile_interpolates_between_ranks() {
        let sorted = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(quantile(&sorted, 0.5), 20.0);
        assert_eq!(quantile(&sorted, 0.25), 10.0);
        assert!((quantile(&sorted, 0.05) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_combination_nulls_incomplete_rows() {
        let a = series(&[Some(1.0), Some(2.0), None]);
        let b = series(&[Some(10.0), Some(20.0), Some(30.0)]);
        let combined = linear_combine(&[&a, &b], 0.5, &[2.0, 0.1]);

        assert_eq!(combined.values(), vec![Some(3.5), Some(6.5), None]);
        assert_eq!(combined.observations()[0].tag.as_deref(), Some("obs,linear_combination"));
        assert_eq!(combined.observations()[2].tag, None);
    }
}
