/// In-process provider for replay runs and tests
///
/// Serves series and forecast runs held in memory, either registered through
/// the builder methods or loaded from a recorded JSON snapshot. Uploads are
/// kept so callers can inspect what the pipeline would have published.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::FixedOffset;
use serde::Deserialize;

use super::{ForecastOutputSeries, ForecastSelector, ObservationProvider, OutputObservation, RawObservation, SeriesType};
use crate::model::{ProviderError, SeriesId, Timestamp};
use crate::timegrid::{format_timestamp, parse_timestamp};

type Points = Vec<(Timestamp, Option<f64>)>;

/// One issued forecast run of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRun {
    pub run_id: u64,
    pub forecast_date: Timestamp,
    pub qualifier: Option<String>,
    pub series: HashMap<SeriesId, Points>,
}

impl MemoryRun {
    pub fn new(run_id: u64, forecast_date: Timestamp) -> Self {
        MemoryRun {
            run_id,
            forecast_date,
            qualifier: None,
            series: HashMap::new(),
        }
    }

    pub fn with_series(mut self, series_id: SeriesId, points: Points) -> Self {
        self.series.insert(series_id, points);
        self
    }

    pub fn with_qualifier(mut self, qualifier: &str) -> Self {
        self.qualifier = Some(qualifier.to_string());
        self
    }
}

/// A forecast run as it was pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedRun {
    pub run_id: u64,
    pub cal_id: u64,
    pub forecast_date: Timestamp,
    pub series: Vec<ForecastOutputSeries>,
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    series: HashMap<SeriesId, Points>,
    runs: HashMap<u64, Vec<MemoryRun>>,
    failures: HashMap<SeriesId, ProviderError>,
    uploads: Mutex<HashMap<SeriesId, Vec<OutputObservation>>>,
    uploaded_runs: Mutex<Vec<UploadedRun>>,
}

fn within(points: &Points, start: &Timestamp, end: &Timestamp) -> Vec<RawObservation> {
    points
        .iter()
        .filter(|(t, _)| t >= start && t <= end)
        .map(|(t, v)| RawObservation {
            timestart: format_timestamp(t),
            timeend: None,
            valor: *v,
        })
        .collect()
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, series_id: SeriesId, points: Points) -> Self {
        self.series.insert(series_id, points);
        self
    }

    pub fn with_run(mut self, model_id: u64, run: MemoryRun) -> Self {
        self.runs.entry(model_id).or_default().push(run);
        self
    }

    /// Makes every request for `series_id` fail with `error`.
    pub fn with_failure(mut self, series_id: SeriesId, error: ProviderError) -> Self {
        self.failures.insert(series_id, error);
        self
    }

    /// Everything uploaded to `series_id` so far, in upload order.
    pub fn uploaded(&self, series_id: SeriesId) -> Vec<OutputObservation> {
        self.uploads
            .lock()
            .map(|store| store.get(&series_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Forecast runs pushed so far, in upload order.
    pub fn uploaded_runs(&self) -> Vec<UploadedRun> {
        self.uploaded_runs.lock().map(|runs| runs.clone()).unwrap_or_default()
    }

    fn check_failure(&self, series_id: SeriesId) -> Result<(), ProviderError> {
        match self.failures.get(&series_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn select_run(&self, selector: &ForecastSelector) -> Option<&MemoryRun> {
        let runs = self.runs.get(&selector.model_id)?;
        let mut candidates = runs.iter().filter(|run| match &selector.qualifier {
            Some(q) => run.qualifier.as_deref() == Some(q.as_str()),
            None => true,
        });

        if let Some(id) = selector.run_id {
            return candidates.find(|run| run.run_id == id);
        }
        match selector.forecast_date {
            Some(date) => candidates
                .filter(|run| run.forecast_date >= date)
                .min_by_key(|run| run.forecast_date),
            None => candidates.max_by_key(|run| run.forecast_date),
        }
    }

    /// Loads a recorded snapshot, interpreting naive timestamps in `zone`.
    pub fn from_snapshot_json(json: &str, zone: FixedOffset) -> Result<Self, ProviderError> {
        let snapshot: Snapshot =
            serde_json::from_str(json).map_err(|e| ProviderError::Parse(format!("snapshot: {}", e)))?;

        let mut provider = MemoryProvider::new();
        for entry in snapshot.series {
            let points = entry.points(zone)?;
            provider = provider.with_series(entry.series_id, points);
        }
        for run in snapshot.runs {
            let forecast_date = parse_timestamp(&run.forecast_date, zone).map_err(ProviderError::Parse)?;
            let mut memory_run = MemoryRun::new(run.run_id, forecast_date);
            memory_run.qualifier = run.qualifier;
            for entry in run.series {
                let points = entry.points(zone)?;
                memory_run.series.insert(entry.series_id, points);
            }
            provider = provider.with_run(run.model_id, memory_run);
        }
        Ok(provider)
    }
}

impl ObservationProvider for MemoryProvider {
    fn fetch_series(
        &self,
        series_id: SeriesId,
        _series_type: SeriesType,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError> {
        self.check_failure(series_id)?;
        Ok(self
            .series
            .get(&series_id)
            .map(|points| within(points, start, end))
            .unwrap_or_default())
    }

    fn fetch_forecast(
        &self,
        series_id: SeriesId,
        selector: &ForecastSelector,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError> {
        self.check_failure(series_id)?;
        Ok(self
            .select_run(selector)
            .and_then(|run| run.series.get(&series_id))
            .map(|points| within(points, start, end))
            .unwrap_or_default())
    }

    fn push_observations(
        &self,
        series_id: SeriesId,
        _series_type: SeriesType,
        observations: &[OutputObservation],
    ) -> Result<Vec<RawObservation>, ProviderError> {
        self.check_failure(series_id)?;
        let mut store = self
            .uploads
            .lock()
            .map_err(|_| ProviderError::Request("upload store poisoned".to_string()))?;
        store.entry(series_id).or_default().extend_from_slice(observations);
        Ok(observations
            .iter()
            .map(|o| RawObservation {
                timestart: o.timestart.clone(),
                timeend: Some(o.timeend.clone()),
                valor: Some(o.valor),
            })
            .collect())
    }

    /// Fails when any of the series has a registered failure; run ids count
    /// up from 1.
    fn push_forecast(
        &self,
        cal_id: u64,
        forecast_date: &Timestamp,
        series: &[ForecastOutputSeries],
    ) -> Result<u64, ProviderError> {
        for s in series {
            self.check_failure(s.series_id)?;
        }
        let mut runs = self
            .uploaded_runs
            .lock()
            .map_err(|_| ProviderError::Request("run store poisoned".to_string()))?;
        let run_id = runs.len() as u64 + 1;
        runs.push(UploadedRun {
            run_id,
            cal_id,
            forecast_date: *forecast_date,
            series: series.to_vec(),
        });
        Ok(run_id)
    }
}

// ---------------------------------------------------------------------------
// Snapshot format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    series: Vec<SnapshotSeries>,
    #[serde(default)]
    runs: Vec<SnapshotRun>,
}

#[derive(Debug, Deserialize)]
struct SnapshotSeries {
    series_id: SeriesId,
    observations: Vec<RawObservation>,
}

impl SnapshotSeries {
    fn points(&self, zone: FixedOffset) -> Result<Points, ProviderError> {
        self.observations
            .iter()
            .map(|row| {
                let t = parse_timestamp(&row.timestart, zone).map_err(ProviderError::Parse)?;
                Ok((t, row.valor))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotRun {
    model_id: u64,
    run_id: u64,
    forecast_date: String,
    #[serde(default)]
    qualifier: Option<String>,
    series: Vec<SnapshotSeries>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timegrid::parse_utc_offset;

    fn zone() -> FixedOffset {
        parse_utc_offset("-03:00").unwrap()
    }

    fn at(raw: &str) -> Timestamp {
        parse_timestamp(raw, zone()).unwrap()
    }

    #[test]
    fn test_fetch_series_respects_window() {
        let provider = MemoryProvider::new().with_series(
            1,
            vec![
                (at("2022-05-24T23:00:00"), Some(0.5)),
                (at("2022-05-25T00:00:00"), Some(1.0)),
                (at("2022-05-25T01:00:00"), None),
            ],
        );
        let rows = provider
            .fetch_series(1, SeriesType::Point, &at("2022-05-25T00:00:00"), &at("2022-05-25T01:00:00"))
            .expect("memory fetch never fails unless told to");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].valor, None);
    }

    #[test]
    fn test_unknown_series_is_empty() {
        let provider = MemoryProvider::new();
        let rows = provider
            .fetch_series(99, SeriesType::Point, &at("2022-05-25"), &at("2022-05-26"))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_registered_failure_is_returned() {
        let provider = MemoryProvider::new().with_failure(
            5,
            ProviderError::Http {
                status: 500,
                message: "boom".into(),
            },
        );
        let result = provider.fetch_series(5, SeriesType::Point, &at("2022-05-25"), &at("2022-05-26"));
        assert!(matches!(result, Err(ProviderError::Http { status: 500, .. })));
    }

    #[test]
    fn test_forecast_selection_by_run_and_issue_date() {
        let provider = MemoryProvider::new()
            .with_run(
                10,
                MemoryRun::new(1, at("2022-05-24T09:00:00")).with_series(7, vec![(at("2022-05-25T00:00:00"), Some(1.0))]),
            )
            .with_run(
                10,
                MemoryRun::new(2, at("2022-05-25T09:00:00")).with_series(7, vec![(at("2022-05-25T00:00:00"), Some(2.0))]),
            );

        let latest = ForecastSelector {
            model_id: 10,
            ..ForecastSelector::default()
        };
        let rows = provider
            .fetch_forecast(7, &latest, &at("2022-05-25"), &at("2022-05-26"))
            .unwrap();
        assert_eq!(rows[0].valor, Some(2.0));

        let pinned = ForecastSelector {
            model_id: 10,
            run_id: Some(1),
            ..ForecastSelector::default()
        };
        let rows = provider
            .fetch_forecast(7, &pinned, &at("2022-05-25"), &at("2022-05-26"))
            .unwrap();
        assert_eq!(rows[0].valor, Some(1.0));

        let too_late = ForecastSelector {
            model_id: 10,
            forecast_date: Some(at("2022-05-26")),
            ..ForecastSelector::default()
        };
        let rows = provider
            .fetch_forecast(7, &too_late, &at("2022-05-25"), &at("2022-05-26"))
            .unwrap();
        assert!(rows.is_empty(), "no run issued after the reference date");

        let first_after = ForecastSelector {
            model_id: 10,
            forecast_date: Some(at("2022-05-24")),
            ..ForecastSelector::default()
        };
        let rows = provider
            .fetch_forecast(7, &first_after, &at("2022-05-25"), &at("2022-05-26"))
            .unwrap();
        assert_eq!(rows[0].valor, Some(1.0), "first run issued at or after the reference date");
    }

    #[test]
    fn test_uploads_are_recorded() {
        let provider = MemoryProvider::new();
        let rows = vec![OutputObservation {
            timestart: "2022-05-25T00:00:00-03:00".into(),
            timeend: "2022-05-25T00:00:00-03:00".into(),
            valor: 3.0,
        }];
        let created = provider.push_observations(900, SeriesType::Point, &rows).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(provider.uploaded(900), rows);
    }

    #[test]
    fn test_forecast_runs_are_recorded_with_sequential_ids() {
        let provider = MemoryProvider::new();
        let series = vec![ForecastOutputSeries {
            series_id: 900,
            series_type: SeriesType::Point,
            forecasts: Vec::new(),
        }];
        assert_eq!(provider.push_forecast(489, &at("2022-05-25"), &series).unwrap(), 1);
        assert_eq!(provider.push_forecast(489, &at("2022-05-26"), &series).unwrap(), 2);

        let runs = provider.uploaded_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].forecast_date, at("2022-05-26"));
        assert_eq!(runs[0].series, series);
    }

    #[test]
    fn test_snapshot_round_trips_into_provider() {
        let json = r#"{
            "series": [{"series_id": 1, "observations": [{"timestart": "2022-05-25T00:00:00", "valor": 1.0}]}],
            "runs": [{"model_id": 3, "run_id": 4, "forecast_date": "2022-05-25T09:00:00",
                      "series": [{"series_id": 1, "observations": [{"timestart": "2022-05-26T00:00:00", "valor": 2.0}]}]}]
        }"#;
        let provider = MemoryProvider::from_snapshot_json(json, zone()).expect("snapshot should load");
        let forecast = provider
            .fetch_forecast(
                1,
                &ForecastSelector {
                    model_id: 3,
                    ..ForecastSelector::default()
                },
                &at("2022-05-25"),
                &at("2022-05-27"),
            )
            .unwrap();
        assert_eq!(forecast[0].valor, Some(2.0));
    }
}
