/// Regularization onto a time grid and limited gap interpolation.
///
/// Gap limits are all-or-nothing: a run of missing cells is filled only when
/// it spans at most `limit` grid steps, otherwise every cell of the run stays
/// null. Counting in grid steps (not original rows) keeps `regularize`
/// idempotent on an already regular series.

use serde::{Deserialize, Serialize};

use crate::model::{append_tag, Observation, Series, Timestamp, TAG_EXTRAPOLATED, TAG_INTERPOLATED};
use crate::timegrid::TimeGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegularizeMode {
    /// Keep values sitting exactly on a grid timestamp; every other grid cell
    /// is null. Gaps are left to the fill cascade and the final interpolation.
    #[default]
    Reindex,
    /// Join on the grid and fill interior gaps by time-weighted linear
    /// interpolation.
    Interpolate,
    /// Snap each observation to its nearest grid timestamp.
    Nearest,
}

/// Regularizes `series` onto `grid`.
///
/// Only `Interpolate` uses `interpolation_limit` (`None` fills gaps of any
/// length) and `extrapolate`. Without `extrapolate`, cells before the first
/// or after the last valid value stay null.
pub fn regularize(
    series: &Series,
    grid: &TimeGrid,
    interpolation_limit: Option<usize>,
    mode: RegularizeMode,
    extrapolate: bool,
) -> Series {
    match mode {
        RegularizeMode::Reindex => reindex(series, grid.timestamps()),
        RegularizeMode::Interpolate => align(series, grid.timestamps(), interpolation_limit, extrapolate),
        RegularizeMode::Nearest => snap_to_nearest(series, grid),
    }
}

/// Plain reindex: one cell per target, null where `series` has no row.
pub fn reindex(series: &Series, targets: &[Timestamp]) -> Series {
    Series::from_observations(
        targets
            .iter()
            .map(|t| series.get(t).cloned().unwrap_or_else(|| Observation::null(*t)))
            .collect(),
    )
}

/// Reindexes `series` onto arbitrary `targets` by interpolation.
///
/// Original timestamps act as interpolation anchors and are dropped from the
/// result unless they are also targets.
pub fn align(series: &Series, targets: &[Timestamp], limit: Option<usize>, extrapolate: bool) -> Series {
    let source = series.observations();
    let mut cells: Vec<Observation> = Vec::with_capacity(source.len() + targets.len());
    let mut on_target: Vec<bool> = Vec::with_capacity(cells.capacity());

    let (mut i, mut j) = (0, 0);
    while i < source.len() || j < targets.len() {
        let take_source = j >= targets.len() || (i < source.len() && source[i].timestamp <= targets[j]);
        if take_source {
            let matches_target = j < targets.len() && source[i].timestamp == targets[j];
            cells.push(source[i].clone());
            on_target.push(matches_target);
            i += 1;
            if matches_target {
                j += 1;
            }
        } else {
            cells.push(Observation::null(targets[j]));
            on_target.push(true);
            j += 1;
        }
    }

    fill_gaps(&mut cells, &on_target, limit, extrapolate);

    Series::from_observations(
        cells
            .into_iter()
            .zip(on_target)
            .filter_map(|(cell, keep)| keep.then_some(cell))
            .collect(),
    )
}

/// Fills gaps on the series' own index, as the final pipeline stage does.
pub fn interpolate_final(series: &Series, limit: Option<usize>, extrapolate: bool) -> Series {
    let mut cells = series.observations().to_vec();
    let on_index = vec![true; cells.len()];
    fill_gaps(&mut cells, &on_index, limit, extrapolate);
    Series::from_observations(cells)
}

/// Fills maximal runs of null cells in place. Only cells flagged in `counts`
/// contribute to a run's length.
fn fill_gaps(cells: &mut [Observation], counts: &[bool], limit: Option<usize>, extrapolate: bool) {
    let n = cells.len();
    if cells.iter().all(|c| c.value.is_none()) {
        return;
    }

    let mut i = 0;
    while i < n {
        if cells[i].value.is_some() {
            i += 1;
            continue;
        }
        let start = i;
        while i < n && cells[i].value.is_none() {
            i += 1;
        }
        let end = i;

        let steps = (start..end).filter(|&k| counts[k]).count();
        if limit.is_some_and(|l| steps > l) {
            continue;
        }

        let left = start.checked_sub(1);
        let right = (end < n).then_some(end);
        match (left, right) {
            (Some(l), Some(r)) => {
                let (t0, t1) = (cells[l].timestamp, cells[r].timestamp);
                let (v0, v1) = match (cells[l].value, cells[r].value) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                let span = (t1 - t0).num_milliseconds() as f64;
                for cell in &mut cells[start..end] {
                    let elapsed = (cell.timestamp - t0).num_milliseconds() as f64;
                    cell.value = Some(v0 + (v1 - v0) * elapsed / span);
                    cell.tag = Some(append_tag(cell.tag.as_deref(), TAG_INTERPOLATED));
                }
            }
            (Some(edge), None) | (None, Some(edge)) if extrapolate => {
                let value = cells[edge].value;
                for cell in &mut cells[start..end] {
                    cell.value = value;
                    cell.tag = Some(append_tag(cell.tag.as_deref(), TAG_EXTRAPOLATED));
                }
            }
            _ => {}
        }
    }
}

/// Assigns each non-null observation to the closest grid timestamp. An
/// observation exactly halfway between two grid points lands on both; when
/// several observations compete for one grid point the closest wins.
fn snap_to_nearest(series: &Series, grid: &TimeGrid) -> Series {
    let targets = grid.timestamps();
    let interval_ms = grid.interval.num_milliseconds();
    let mut best: Vec<Option<(i64, &Observation)>> = vec![None; targets.len()];

    if interval_ms > 0 && !targets.is_empty() {
        for obs in series.iter().filter(|o| o.value.is_some()) {
            let offset = (obs.timestamp - grid.start).num_milliseconds();
            let q = offset.div_euclid(interval_ms);
            let r = offset.rem_euclid(interval_ms);

            let candidates: Vec<(i64, i64)> = match (2 * r).cmp(&interval_ms) {
                std::cmp::Ordering::Less => vec![(q, r)],
                std::cmp::Ordering::Greater => vec![(q + 1, interval_ms - r)],
                std::cmp::Ordering::Equal => vec![(q, r), (q + 1, r)],
            };

            for (index, distance) in candidates {
                if index < 0 || index as usize >= targets.len() {
                    continue;
                }
                let slot = &mut best[index as usize];
                if slot.map_or(true, |(d, _)| distance < d) {
                    *slot = Some((distance, obs));
                }
            }
        }
    }

    Series::from_observations(
        targets
            .iter()
            .zip(best)
            .map(|(t, slot)| match slot {
                Some((_, obs)) => Observation {
                    timestamp: *t,
                    value: obs.value,
                    tag: obs.tag.clone(),
                },
                None => Observation::null(*t),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TAG_OBS;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn t(hour: u32, minute: u32) -> Timestamp {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
            .unwrap()
    }

    fn hourly_grid(hours: u32) -> TimeGrid {
        TimeGrid::new(t(0, 0), t(hours, 0), Duration::hours(1), None)
    }

    fn obs(points: &[(Timestamp, Option<f64>)]) -> Series {
        Series::from_values(points, Some(TAG_OBS))
    }

    #[test]
    fn test_regularize_puts_every_cell_on_the_grid() {
        let input = obs(&[(t(0, 10), Some(1.0)), (t(1, 0), Some(2.0)), (t(2, 50), Some(3.0))]);
        let result = regularize(&input, &hourly_grid(3), None, RegularizeMode::Interpolate, false);
        assert_eq!(result.timestamps(), hourly_grid(3).timestamps().to_vec());
    }

    #[test]
    fn test_interior_gap_is_time_weighted() {
        let input = obs(&[(t(0, 0), Some(0.0)), (t(3, 0), Some(3.0))]);
        let result = regularize(&input, &hourly_grid(3), None, RegularizeMode::Interpolate, false);

        assert_eq!(result.values(), vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(result.observations()[1].tag.as_deref(), Some("interpolated"));
        assert_eq!(result.observations()[0].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_off_grid_observations_anchor_interpolation() {
        let input = obs(&[(t(0, 30), Some(0.0)), (t(1, 30), Some(10.0))]);
        let result = regularize(&input, &hourly_grid(2), None, RegularizeMode::Interpolate, false);

        assert_eq!(result.values()[0], None, "before the first observation stays null");
        assert_eq!(result.values()[1], Some(5.0));
        assert_eq!(result.values()[2], None, "after the last observation stays null");
    }

    #[test]
    fn test_gap_longer_than_limit_stays_entirely_null() {
        let input = obs(&[(t(0, 0), Some(0.0)), (t(4, 0), Some(4.0))]);
        let result = regularize(&input, &hourly_grid(4), Some(2), RegularizeMode::Interpolate, false);
        assert_eq!(result.values(), vec![Some(0.0), None, None, None, Some(4.0)]);
    }

    #[test]
    fn test_gap_within_limit_is_filled() {
        let input = obs(&[(t(0, 0), Some(0.0)), (t(3, 0), Some(3.0))]);
        let result = regularize(&input, &hourly_grid(3), Some(2), RegularizeMode::Interpolate, false);
        assert_eq!(result.null_count(), 0);
    }

    #[test]
    fn test_regularize_is_idempotent() {
        let input = obs(&[(t(0, 20), Some(1.0)), (t(2, 40), Some(5.0)), (t(5, 0), Some(2.0))]);
        let grid = hourly_grid(6);
        let once = regularize(&input, &grid, Some(1), RegularizeMode::Interpolate, false);
        let twice = regularize(&once, &grid, Some(1), RegularizeMode::Interpolate, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_nearest_mode_snaps_and_splits_ties() {
        let input = obs(&[(t(0, 10), Some(1.0)), (t(1, 30), Some(2.0)), (t(3, 0), Some(3.0))]);
        let result = regularize(&input, &hourly_grid(3), None, RegularizeMode::Nearest, false);

        assert_eq!(result.values(), vec![Some(1.0), Some(2.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_nearest_mode_prefers_closest_observation() {
        let input = obs(&[(t(0, 25), Some(1.0)), (t(0, 55), Some(2.0))]);
        let result = regularize(&input, &hourly_grid(1), None, RegularizeMode::Nearest, false);
        assert_eq!(result.values(), vec![Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_final_interpolation_extrapolates_only_when_enabled() {
        let input = obs(&[(t(0, 0), None), (t(1, 0), Some(2.0)), (t(2, 0), None)]);
        let plain = interpolate_final(&input, None, false);
        assert_eq!(plain.values(), vec![None, Some(2.0), None]);

        let extended = interpolate_final(&input, None, true);
        assert_eq!(extended.values(), vec![Some(2.0), Some(2.0), Some(2.0)]);
        assert_eq!(extended.observations()[0].tag.as_deref(), Some("extrapolated"));
    }

    #[test]
    fn test_all_null_series_stays_null() {
        let input = Series::all_null(hourly_grid(2).timestamps(), Some(TAG_OBS));
        let result = interpolate_final(&input, None, true);
        assert_eq!(result.null_count(), 3);
    }

    #[test]
    fn test_reindex_keeps_only_on_grid_values() {
        let input = obs(&[(t(0, 0), Some(1.0)), (t(1, 30), Some(9.0)), (t(3, 0), Some(3.0))]);
        let result = regularize(&input, &hourly_grid(3), None, RegularizeMode::default(), false);

        assert_eq!(result.timestamps(), hourly_grid(3).timestamps().to_vec());
        assert_eq!(result.values(), vec![Some(1.0), None, None, Some(3.0)]);
        assert_eq!(result.observations()[3].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_regularize_extrapolates_only_when_enabled() {
        let input = obs(&[(t(1, 0), Some(2.0)), (t(2, 0), Some(4.0))]);

        let plain = regularize(&input, &hourly_grid(3), None, RegularizeMode::Interpolate, false);
        assert_eq!(plain.values(), vec![None, Some(2.0), Some(4.0), None]);

        let extended = regularize(&input, &hourly_grid(3), None, RegularizeMode::Interpolate, true);
        assert_eq!(extended.values(), vec![Some(2.0), Some(2.0), Some(4.0), Some(4.0)]);
        assert_eq!(extended.observations()[0].tag.as_deref(), Some("extrapolated"));
        assert_eq!(extended.observations()[3].tag.as_deref(), Some("extrapolated"));
        assert_eq!(extended.observations()[1].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_final_interpolation_limit_one() {
        let input = obs(&[
            (t(0, 0), Some(0.0)),
            (t(1, 0), None),
            (t(2, 0), Some(2.0)),
            (t(3, 0), None),
            (t(4, 0), None),
            (t(5, 0), Some(5.0)),
        ]);
        let result = interpolate_final(&input, Some(1), false);

        assert_eq!(result.values(), vec![Some(0.0), Some(1.0), Some(2.0), None, None, Some(5.0)]);
        assert_eq!(result.observations()[1].tag.as_deref(), Some("interpolated"));
        assert_eq!(result.observations()[3].tag, None);
    }
}
