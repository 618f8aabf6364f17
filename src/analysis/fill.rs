use chrono::Duration;

use crate::analysis::cleaning::shift_rows;
use crate::model::{append_tag, Observation, Series, TAG_FILLED, TAG_MOVING_AVERAGE};

// ---------------------------------------------------------------------------
// Rolling mean
// ---------------------------------------------------------------------------

/// Trailing mean over the window `(t - window, t]`, at least one non-null
/// sample required. Cells that were null and gain a value are tagged
/// `moving_average`; others keep their tag.
pub fn rolling_mean(series: &Series, window: Duration) -> Series {
    if window <= Duration::zero() {
        return series.clone();
    }
    let cells = series.observations();
    let mut start = 0;
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut output = Vec::with_capacity(cells.len());

    for (end, obs) in cells.iter().enumerate() {
        if let Some(v) = obs.value {
            sum += v;
            count += 1;
        }
        while cells[start].timestamp <= obs.timestamp - window {
            if let Some(v) = cells[start].value {
                sum -= v;
                count -= 1;
            }
            start += 1;
        }
        debug_assert!(start <= end);

        let mean = (count > 0).then(|| sum / count as f64);
        let tag = match (obs.value, mean) {
            (None, Some(_)) => Some(append_tag(obs.tag.as_deref(), TAG_MOVING_AVERAGE)),
            _ => obs.tag.clone(),
        };
        output.push(Observation {
            timestamp: obs.timestamp,
            value: mean,
            tag,
        });
    }

    Series::from_observations(output)
}

// ---------------------------------------------------------------------------
// Fill from another series
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillOptions {
    /// Constant used for cells neither series can supply.
    pub fill_value: Option<f64>,
    /// Positional shift applied to the other series after joining it onto
    /// the primary index.
    pub shift_rows: i64,
    /// Subtracted from every value taken from the other series.
    pub bias: f64,
    /// Also add the other series' timestamps to the index.
    pub extend: bool,
}

/// Fills the null cells of `primary` from `other`.
///
/// Non-null primary values are never overwritten. A filled cell carries the
/// other series' tag; a cell filled with the constant is tagged `filled`.
pub fn fill_from_other(primary: &Series, other: &Series, options: &FillOptions) -> Series {
    let index = if options.extend {
        Series::union_index(&[primary, other])
    } else {
        primary.timestamps()
    };

    let joined = Series::from_observations(
        index
            .iter()
            .map(|t| other.get(t).cloned().unwrap_or_else(|| Observation::null(*t)))
            .collect(),
    );
    let joined = if options.shift_rows != 0 {
        shift_rows(&joined, options.shift_rows)
    } else {
        joined
    };

    let filled = index
        .iter()
        .zip(joined.iter())
        .map(|(t, replacement)| {
            let base = primary.get(t).cloned().unwrap_or_else(|| Observation::null(*t));
            if base.value.is_some() {
                return base;
            }
            if let Some(v) = replacement.value {
                return Observation {
                    timestamp: *t,
                    value: Some(v - options.bias),
                    tag: replacement.tag.clone().or(base.tag),
                };
            }
            match options.fill_value {
                Some(constant) => Observation {
                    timestamp: *t,
                    value: Some(constant),
                    tag: Some(append_tag(base.tag.as_deref(), TAG_FILLED)),
                },
                None => base,
            }
        })
        .collect();

    Series::from_observations(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Timestamp, TAG_OBS, TAG_PRONO};
    use chrono::{FixedOffset, TimeZone};

    fn t(hour: u32) -> Timestamp {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .unwrap()
    }

    fn series(values: &[Option<f64>], tag: &str) -> Series {
        let points: Vec<_> = values.iter().enumerate().map(|(i, v)| (t(i as u32), *v)).collect();
        Series::from_values(&points, Some(tag))
    }

    #[test]
    fn test_rolling_mean_uses_trailing_window() {
        let input = series(&[Some(1.0), Some(3.0), Some(5.0), Some(7.0)], TAG_OBS);
        let result = rolling_mean(&input, Duration::hours(2));
        assert_eq!(result.values(), vec![Some(1.0), Some(2.0), Some(4.0), Some(6.0)]);
    }

    #[test]
    fn test_rolling_mean_tags_newly_filled_cells() {
        let input = series(&[Some(2.0), None, Some(4.0)], TAG_OBS);
        let result = rolling_mean(&input, Duration::hours(2));

        assert_eq!(result.values()[1], Some(2.0));
        assert_eq!(result.observations()[1].tag.as_deref(), Some("moving_average"));
        assert_eq!(result.observations()[2].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_rolling_mean_needs_one_sample() {
        let input = series(&[Some(2.0), None, None], TAG_OBS);
        let result = rolling_mean(&input, Duration::hours(1));
        assert_eq!(result.values(), vec![Some(2.0), None, None]);
    }

    #[test]
    fn test_fill_never_overwrites_primary_values() {
        let primary = series(&[Some(1.0), None, Some(3.0)], TAG_OBS);
        let other = series(&[Some(10.0), Some(20.0), Some(30.0)], "backup");
        let result = fill_from_other(&primary, &other, &FillOptions::default());

        assert_eq!(result.values(), vec![Some(1.0), Some(20.0), Some(3.0)]);
        assert_eq!(result.observations()[1].tag.as_deref(), Some("backup"));
        assert_eq!(result.observations()[0].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_fill_applies_shift_and_bias() {
        let primary = series(&[None, None, Some(3.0)], TAG_OBS);
        let other = series(&[Some(10.0), Some(20.0), Some(30.0)], "backup");
        let options = FillOptions {
            shift_rows: 1,
            bias: 1.0,
            ..FillOptions::default()
        };
        let result = fill_from_other(&primary, &other, &options);
        assert_eq!(result.values(), vec![None, Some(9.0), Some(3.0)]);
    }

    #[test]
    fn test_fill_value_covers_what_other_cannot() {
        let primary = series(&[None, None], TAG_OBS);
        let other = series(&[Some(5.0), None], "backup");
        let options = FillOptions {
            fill_value: Some(0.0),
            ..FillOptions::default()
        };
        let result = fill_from_other(&primary, &other, &options);

        assert_eq!(result.values(), vec![Some(5.0), Some(0.0)]);
        assert_eq!(result.observations()[1].tag.as_deref(), Some("filled"));
    }

    #[test]
    fn test_extend_adds_other_timestamps() {
        let primary = Series::from_values(&[(t(0), Some(1.0)), (t(1), None)], Some(TAG_OBS));
        let forecast = Series::from_values(&[(t(1), Some(2.0)), (t(2), Some(3.0))], Some(TAG_PRONO));
        let options = FillOptions {
            extend: true,
            ..FillOptions::default()
        };
        let result = fill_from_other(&primary, &forecast, &options);

        assert_eq!(result.timestamps(), vec![t(0), t(1), t(2)]);
        assert_eq!(result.values(), vec![Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(result.observations()[2].tag.as_deref(), Some("prono"));
    }

    #[test]
    fn test_backward_shift_with_bias() {
        let primary = series(&[None, None, Some(3.0)], TAG_OBS);
        let other = series(&[Some(10.0), Some(20.0), Some(30.0)], "backup");
        let options = FillOptions {
            shift_rows: -1,
            bias: 0.5,
            ..FillOptions::default()
        };
        let result = fill_from_other(&primary, &other, &options);

        assert_eq!(result.values(), vec![Some(19.5), Some(29.5), Some(3.0)]);
        assert_eq!(result.observations()[0].tag.as_deref(), Some("backup"));
    }

    #[test]
    fn test_without_extend_index_is_unchanged() {
        let primary = Series::from_values(&[(t(0), None), (t(1), None)], Some(TAG_OBS));
        let other = Series::from_values(&[(t(1), Some(2.0)), (t(2), Some(3.0)), (t(3), Some(4.0))], Some("backup"));
        let result = fill_from_other(&primary, &other, &FillOptions::default());

        assert_eq!(result.timestamps(), primary.timestamps());
        assert_eq!(result.values(), vec![None, Some(2.0)]);
    }

    #[test]
    fn test_non_null_cells_survive_every_option() {
        let primary = series(&[Some(1.0), None, Some(3.0), None, Some(5.0)], TAG_OBS);
        let other = series(&[Some(10.0), Some(20.0), None, Some(40.0), Some(50.0)], "backup");

        for shift in [-2, -1, 0, 1, 2] {
            for bias in [0.0, 2.5] {
                for fill_value in [None, Some(-1.0)] {
                    for extend in [false, true] {
                        let options = FillOptions {
                            fill_value,
                            shift_rows: shift,
                            bias,
                            extend,
                        };
                        let result = fill_from_other(&primary, &other, &options);
                        for kept in primary.iter().filter(|o| o.value.is_some()) {
                            assert_eq!(result.get(&kept.timestamp), Some(kept), "{:?}", options);
                        }
                        if fill_value.is_some() {
                            assert_eq!(result.null_count(), 0, "{:?}", options);
                        }
                    }
                }
            }
        }
    }
}
