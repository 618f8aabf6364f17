/// Observation and forecast providers.
///
/// The pipeline talks to its data source only through `ObservationProvider`.
/// Two implementations ship with the crate:
/// - `a5`     — blocking HTTP client for an a5-style observation/forecast API.
/// - `memory` — in-process provider serving canned series, used for replay
///              runs and tests.

pub mod a5;
pub mod memory;

#[cfg(test)]
pub(crate) mod fixtures;

use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::model::{Observation, ProviderError, Series, SeriesId, Timestamp};
use crate::timegrid::{format_timestamp, parse_timestamp};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A single observation as the provider returns it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawObservation {
    pub timestart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeend: Option<String>,
    pub valor: Option<f64>,
}

/// An observation prepared for upload. `timeend` is `timestart` plus the
/// variable's time support.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputObservation {
    pub timestart: String,
    pub timeend: String,
    pub valor: f64,
}

impl OutputObservation {
    pub fn new(timestart: &Timestamp, time_support: Duration, value: f64) -> Self {
        OutputObservation {
            timestart: format_timestamp(timestart),
            timeend: format_timestamp(&(*timestart + time_support)),
            valor: value,
        }
    }
}

/// One output series filed under a forecast run.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastOutputSeries {
    pub series_id: SeriesId,
    pub series_type: SeriesType,
    pub forecasts: Vec<OutputObservation>,
}

/// Spatial support of a provider series; selects the API path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesType {
    #[default]
    Point,
    Areal,
    Raster,
}

impl SeriesType {
    pub fn path_segment(&self) -> &'static str {
        match self {
            SeriesType::Point => "puntual",
            SeriesType::Areal => "areal",
            SeriesType::Raster => "raster",
        }
    }

    /// Table name used when filing series under a forecast run.
    pub fn table_name(&self) -> &'static str {
        match self {
            SeriesType::Point => "series",
            SeriesType::Areal => "series_areal",
            SeriesType::Raster => "series_rast",
        }
    }
}

/// Which forecast run to read for a forecast series.
///
/// A `run_id` pins the run. Otherwise, with `forecast_date` the first run
/// issued at or after that date is read, and without it the latest run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForecastSelector {
    pub model_id: u64,
    pub run_id: Option<u64>,
    pub forecast_date: Option<Timestamp>,
    pub qualifier: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// The upstream data source. Implementations must be shareable across the
/// worker threads of the load stage.
pub trait ObservationProvider: Sync {
    /// Observations of `series_id` within `[start, end]`.
    fn fetch_series(
        &self,
        series_id: SeriesId,
        series_type: SeriesType,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError>;

    /// Forecast values of `series_id` from the run chosen by `selector`,
    /// within `[start, end]`.
    fn fetch_forecast(
        &self,
        series_id: SeriesId,
        selector: &ForecastSelector,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError>;

    /// Uploads observations; returns what the provider stored.
    fn push_observations(
        &self,
        series_id: SeriesId,
        series_type: SeriesType,
        observations: &[OutputObservation],
    ) -> Result<Vec<RawObservation>, ProviderError>;

    /// Creates a forecast run of model `cal_id` issued at `forecast_date`
    /// holding `series`. Returns the id of the new run.
    fn push_forecast(
        &self,
        cal_id: u64,
        forecast_date: &Timestamp,
        series: &[ForecastOutputSeries],
    ) -> Result<u64, ProviderError>;
}

/// Converts provider rows into a series normalised to `zone`, tagging every
/// row with `tag`.
pub fn to_series(raw: &[RawObservation], zone: FixedOffset, tag: &str) -> Result<Series, ProviderError> {
    let observations = raw
        .iter()
        .map(|row| {
            let timestamp = parse_timestamp(&row.timestart, zone).map_err(ProviderError::Parse)?;
            Ok(Observation::new(timestamp, row.valor, Some(tag)))
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;
    Ok(Series::from_observations(observations))
}
