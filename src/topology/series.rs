/// Leaf series: one provider series plus its per-series cleaning settings.
///
/// Each leaf walks `Unloaded → Loaded → Cleaned → OffsetApplied →
/// Regularized → MovingAverage → FinalizedForFill` as the topology drives
/// it through the stages.

use chrono::{Duration, FixedOffset};
use serde::Serialize;

use super::description::{ForecastSeriesDescription, InputSeriesDescription, StepsOrInterval};
use crate::analysis::cleaning::{apply_offset, clamp_outliers, detect_jumps, JumpRow, OutlierRow};
use crate::analysis::fill::rolling_mean;
use crate::analysis::regression::CalibrationStats;
use crate::analysis::regular::{regularize, RegularizeMode};
use crate::ingest::{to_series, ForecastSelector, ObservationProvider, RawObservation, SeriesType};
use crate::logging::{log_provider_failure, Logger};
use crate::model::{
    ConfigurationError, PipelineError, PipelineIssue, ProviderError, Series, SeriesId, Stage, Timestamp, XOffset,
    TAG_OBS, TAG_PRONO,
};
use crate::timegrid::{parse_timestamp, Interval, TimeGrid};

/// Converts a described offset into an `XOffset`.
pub fn x_offset_from(description: Option<StepsOrInterval>) -> XOffset {
    match description {
        None => XOffset::default(),
        Some(StepsOrInterval::Rows(n)) => XOffset::Rows(n),
        Some(StepsOrInterval::Interval(i)) => XOffset::Duration(i.to_duration()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafState {
    Unloaded,
    Loaded,
    Cleaned,
    OffsetApplied,
    Regularized,
    MovingAverage,
    FinalizedForFill,
}

/// Everything the load stage needs, shared read-only across worker threads.
pub struct LoadContext<'a> {
    pub provider: &'a dyn ObservationProvider,
    pub start: Timestamp,
    pub end: Timestamp,
    pub forecast_end: Timestamp,
    pub zone: FixedOffset,
    pub logger: &'a Logger,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesCleaning {
    pub outlier_bounds: Option<(f64, f64)>,
    pub jump_threshold: Option<f64>,
    pub x_offset: XOffset,
    pub y_offset: f64,
    pub moving_average_window: Option<Duration>,
}

impl SeriesCleaning {
    fn new(
        outlier_bounds: Option<[f64; 2]>,
        jump_threshold: Option<f64>,
        x_offset: Option<StepsOrInterval>,
        y_offset: f64,
        moving_average: Option<Interval>,
        context: &str,
    ) -> Result<Self, ConfigurationError> {
        let invalid = |field: &str, message: String| ConfigurationError::InvalidValue {
            context: context.to_string(),
            field: field.to_string(),
            message,
        };

        if let Some([lower, upper]) = outlier_bounds {
            if lower > upper {
                return Err(invalid("outlier_bounds", format!("lower bound {} exceeds upper bound {}", lower, upper)));
            }
        }
        if let Some(threshold) = jump_threshold {
            if threshold < 0.0 {
                return Err(invalid("jump_threshold", format!("{} is negative", threshold)));
            }
        }
        let window = moving_average.map(|i| i.to_duration());
        if window.is_some_and(|w| w <= Duration::zero()) {
            return Err(invalid("moving_average", "window must be positive".to_string()));
        }

        Ok(SeriesCleaning {
            outlier_bounds: outlier_bounds.map(|[lower, upper]| (lower, upper)),
            jump_threshold,
            x_offset: x_offset_from(x_offset),
            y_offset,
            moving_average_window: window,
        })
    }
}

// ---------------------------------------------------------------------------
// NodeSerie
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSerie {
    pub series_id: SeriesId,
    pub series_type: SeriesType,
    pub cleaning: SeriesCleaning,
    pub data: Series,
    pub outliers: Vec<OutlierRow>,
    pub jumps: Vec<JumpRow>,
    state: LeafState,
}

impl NodeSerie {
    pub fn from_description(description: &InputSeriesDescription, context: &str) -> Result<Self, ConfigurationError> {
        let cleaning = SeriesCleaning::new(
            description.outlier_bounds,
            description.jump_threshold,
            description.x_offset,
            description.y_offset,
            description.moving_average,
            &format!("{} series {}", context, description.series_id),
        )?;
        Ok(Self::new(description.series_id, description.series_type, cleaning))
    }

    pub fn new(series_id: SeriesId, series_type: SeriesType, cleaning: SeriesCleaning) -> Self {
        NodeSerie {
            series_id,
            series_type,
            cleaning,
            data: Series::new(),
            outliers: Vec::new(),
            jumps: Vec::new(),
            state: LeafState::Unloaded,
        }
    }

    pub fn state(&self) -> LeafState {
        self.state
    }

    fn advance(&mut self, to: LeafState) {
        self.state = self.state.max(to);
    }

    /// Fetches observations for the analysis window. An empty response
    /// becomes an all-null series on `grid`, tagged `obs`.
    pub fn load(&mut self, ctx: &LoadContext<'_>, grid: &TimeGrid) -> Result<Option<PipelineIssue>, PipelineError> {
        let rows = ctx.provider.fetch_series(self.series_id, self.series_type, &ctx.start, &ctx.end);
        let rows = self.check(rows, ctx, "fetch_series")?;

        let issue = if rows.is_empty() {
            let message = format!("series {}: no observations between {} and {}", self.series_id, ctx.start, ctx.end);
            ctx.logger.warn(Stage::Load, Some(&format!("series {}", self.series_id)), &message);
            self.data = Series::all_null(grid.timestamps(), Some(TAG_OBS));
            Some(PipelineIssue::data_availability(Stage::Load, message))
        } else {
            self.data = self.parse(&rows, ctx, TAG_OBS)?;
            None
        };

        self.advance(LeafState::Loaded);
        Ok(issue)
    }

    fn check(
        &self,
        result: Result<Vec<RawObservation>, ProviderError>,
        ctx: &LoadContext<'_>,
        operation: &str,
    ) -> Result<Vec<RawObservation>, PipelineError> {
        result.map_err(|source| {
            log_provider_failure(ctx.logger, self.series_id, Stage::Load, operation, &source);
            PipelineError::Provider {
                series_id: self.series_id,
                stage: Stage::Load,
                source,
            }
        })
    }

    fn parse(&self, rows: &[RawObservation], ctx: &LoadContext<'_>, tag: &str) -> Result<Series, PipelineError> {
        to_series(rows, ctx.zone, tag).map_err(|source| {
            log_provider_failure(ctx.logger, self.series_id, Stage::Load, "parse", &source);
            PipelineError::Provider {
                series_id: self.series_id,
                stage: Stage::Load,
                source,
            }
        })
    }

    /// Returns false when no bounds are configured.
    pub fn remove_outliers(&mut self) -> bool {
        self.advance(LeafState::Cleaned);
        let Some((lower, upper)) = self.cleaning.outlier_bounds else {
            return false;
        };
        let (cleaned, removed) = clamp_outliers(&self.data, lower, upper);
        self.data = cleaned;
        self.outliers.extend(removed);
        true
    }

    /// Returns false when no threshold is configured.
    pub fn detect_jumps(&mut self) -> bool {
        self.advance(LeafState::Cleaned);
        let Some(threshold) = self.cleaning.jump_threshold else {
            return false;
        };
        self.jumps = detect_jumps(&self.data, threshold);
        true
    }

    pub fn apply_offset(&mut self) {
        if !self.cleaning.x_offset.is_zero() || self.cleaning.y_offset != 0.0 {
            self.data = apply_offset(&self.data, self.cleaning.x_offset, self.cleaning.y_offset);
        }
        self.advance(LeafState::OffsetApplied);
    }

    pub fn regularize(&mut self, grid: &TimeGrid, limit: Option<usize>, mode: RegularizeMode, extrapolate: bool) {
        self.data = regularize(&self.data, grid, limit, mode, extrapolate);
        self.advance(LeafState::Regularized);
    }

    pub fn apply_moving_average(&mut self) -> bool {
        self.advance(LeafState::MovingAverage);
        let Some(window) = self.cleaning.moving_average_window else {
            return false;
        };
        self.data = rolling_mean(&self.data, window);
        true
    }

    pub fn finalize(&mut self) {
        self.advance(LeafState::FinalizedForFill);
    }
}

// ---------------------------------------------------------------------------
// ForecastSerie
// ---------------------------------------------------------------------------

/// A forecast leaf: a `NodeSerie` read from one issuance of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSerie {
    pub leaf: NodeSerie,
    pub selector: ForecastSelector,
    /// Calibrate against the variable's first input series before splicing.
    pub adjust: bool,
    pub calibration: Option<CalibrationStats>,
}

impl ForecastSerie {
    pub fn from_description(
        description: &ForecastSeriesDescription,
        zone: FixedOffset,
        context: &str,
    ) -> Result<Self, ConfigurationError> {
        let context = format!("{} forecast series {}", context, description.series_id);
        let cleaning = SeriesCleaning::new(
            description.outlier_bounds,
            description.jump_threshold,
            description.x_offset,
            description.y_offset,
            description.moving_average,
            &context,
        )?;
        let forecast_date = description
            .forecast_date
            .as_deref()
            .map(|raw| parse_timestamp(raw, zone))
            .transpose()
            .map_err(ConfigurationError::InvalidTimestamp)?;

        Ok(ForecastSerie {
            leaf: NodeSerie::new(description.series_id, SeriesType::Point, cleaning),
            selector: ForecastSelector {
                model_id: description.model_id,
                run_id: description.run_id,
                forecast_date,
                qualifier: description.qualifier.clone(),
            },
            adjust: description.adjust,
            calibration: None,
        })
    }

    /// Fetches the selected issuance up to the forecast horizon. A run with
    /// no points leaves the series empty.
    pub fn load(&mut self, ctx: &LoadContext<'_>) -> Result<Option<PipelineIssue>, PipelineError> {
        let leaf = &mut self.leaf;
        let rows = ctx
            .provider
            .fetch_forecast(leaf.series_id, &self.selector, &ctx.start, &ctx.forecast_end);
        let rows = leaf.check(rows, ctx, "fetch_forecast")?;

        let issue = if rows.is_empty() {
            let message = format!(
                "forecast series {} (model {}): no forecast values",
                leaf.series_id, self.selector.model_id
            );
            ctx.logger.warn(Stage::Load, Some(&format!("series {}", leaf.series_id)), &message);
            leaf.data = Series::new();
            Some(PipelineIssue::data_availability(Stage::Load, message))
        } else {
            leaf.data = leaf.parse(&rows, ctx, TAG_PRONO)?;
            None
        };

        leaf.advance(LeafState::Loaded);
        Ok(issue)
    }
}
