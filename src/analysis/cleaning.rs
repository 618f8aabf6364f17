use serde::Serialize;

use crate::model::{Observation, Series, Timestamp, XOffset};

// ---------------------------------------------------------------------------
// Outliers
// ---------------------------------------------------------------------------

/// A value removed by `clamp_outliers`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierRow {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Nulls every value strictly outside `[lower, upper]`.
///
/// Returns the cleaned series and the removed rows. Tags are left as they
/// were, so a removed cell still records where it came from.
pub fn clamp_outliers(series: &Series, lower: f64, upper: f64) -> (Series, Vec<OutlierRow>) {
    let mut removed = Vec::new();
    let observations = series
        .iter()
        .map(|obs| match obs.value {
            Some(v) if v < lower || v > upper => {
                removed.push(OutlierRow {
                    timestamp: obs.timestamp,
                    value: v,
                });
                Observation {
                    value: None,
                    ..obs.clone()
                }
            }
            _ => obs.clone(),
        })
        .collect();
    (Series::from_observations(observations), removed)
}

// ---------------------------------------------------------------------------
// Jumps
// ---------------------------------------------------------------------------

/// A step between consecutive non-null values larger than the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JumpRow {
    pub timestamp: Timestamp,
    pub value: f64,
    pub previous_value: f64,
    pub magnitude: f64,
}

/// Reports every non-null value whose absolute difference from the previous
/// non-null value exceeds `threshold`, largest jumps first. The series itself
/// is never modified.
pub fn detect_jumps(series: &Series, threshold: f64) -> Vec<JumpRow> {
    let mut jumps = Vec::new();
    let mut previous: Option<f64> = None;

    for obs in series.iter() {
        let Some(value) = obs.value else {
            continue;
        };
        if let Some(prev) = previous {
            let magnitude = (value - prev).abs();
            if magnitude > threshold {
                jumps.push(JumpRow {
                    timestamp: obs.timestamp,
                    value,
                    previous_value: prev,
                    magnitude,
                });
            }
        }
        previous = Some(value);
    }

    jumps.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
    jumps
}

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Moves values and tags `rows` positions along the existing index.
///
/// A positive shift moves data later, leaving empty cells at the start; a
/// negative shift moves it earlier. Timestamps stay put.
pub fn shift_rows(series: &Series, rows: i64) -> Series {
    let len = series.len() as i64;
    let source = series.observations();
    let observations = source
        .iter()
        .enumerate()
        .map(|(i, obs)| {
            let from = i as i64 - rows;
            if (0..len).contains(&from) {
                let src = &source[from as usize];
                Observation {
                    timestamp: obs.timestamp,
                    value: src.value,
                    tag: src.tag.clone(),
                }
            } else {
                Observation::null(obs.timestamp)
            }
        })
        .collect();
    Series::from_observations(observations)
}

/// Applies a horizontal offset then adds `y_offset` to every non-null value.
pub fn apply_offset(series: &Series, x_offset: XOffset, y_offset: f64) -> Series {
    let shifted = match x_offset {
        XOffset::Duration(d) => Series::from_observations(
            series
                .iter()
                .map(|obs| Observation {
                    timestamp: obs.timestamp + d,
                    ..obs.clone()
                })
                .collect(),
        ),
        XOffset::Rows(0) => series.clone(),
        XOffset::Rows(n) => shift_rows(series, n),
    };

    if y_offset == 0.0 {
        return shifted;
    }

    Series::from_observations(
        shifted
            .into_observations()
            .into_iter()
            .map(|obs| Observation {
                value: obs.value.map(|v| v + y_offset),
                ..obs
            })
            .collect(),
    )
}
