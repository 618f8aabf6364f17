/// A Variable fuses its input series (or a derivation) and optional forecast
/// series into one canonical `data` series.

use chrono::{Duration, FixedOffset};
use rayon::prelude::*;
use serde::Serialize;

use super::derived::{DerivedOrigin, DerivedSeries, InterpolatedOrigin, VariableRef};
use super::description::{StepsOrInterval, VariableDescription};
use super::series::{x_offset_from, ForecastSerie, LoadContext, NodeSerie};
use crate::analysis::cleaning::apply_offset;
use crate::analysis::fill::{fill_from_other, FillOptions};
use crate::analysis::regression::{calibrate, linear_combine, CalibrationStats};
use crate::analysis::regular::{interpolate_final, RegularizeMode};
use crate::ingest::{OutputObservation, SeriesType};
use crate::logging::Logger;
use crate::model::{
    ConfigurationError, NodeId, PipelineError, PipelineIssue, Series, SeriesId, Stage, Timestamp, VariableId,
    XOffset, TAG_PRONO,
};
use crate::timegrid::{steps_in, TimeGrid};

/// Indices into the variable's input series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationSpec {
    pub truth: usize,
    pub sim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinearCombinationSpec {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

/// A published copy of the variable's data, offset for its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSerie {
    pub series_id: SeriesId,
    pub series_type: SeriesType,
    pub x_offset: XOffset,
    pub y_offset: f64,
    pub data: Series,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    Observed { series: Vec<NodeSerie> },
    Derived { source: DerivedSeries },
}

/// Analysis window shared by every variable of a topology.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
    pub forecast_end: Timestamp,
    pub time_offset: Option<Duration>,
    pub interpolation_limit: Option<StepsOrInterval>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub node_id: NodeId,
    pub id: VariableId,
    pub name: Option<String>,
    pub kind: VariableKind,
    pub forecast_series: Vec<ForecastSerie>,
    pub fallback_value: Option<f64>,
    pub calibration: Option<CalibrationSpec>,
    pub linear_combination: Option<LinearCombinationSpec>,
    /// Gap limit in grid steps; `None` fills gaps of any length.
    pub interpolation_limit: Option<usize>,
    pub regularize_mode: RegularizeMode,
    pub time_support: Duration,
    pub output_series: Vec<OutputSerie>,
    pub grid: TimeGrid,
    pub forecast_grid: TimeGrid,
    pub data: Series,
    pub original_data: Option<Series>,
    /// Latest timestamp with an observed (non-forecast) value.
    pub max_obs_date: Option<Timestamp>,
    pub calibration_stats: Option<CalibrationStats>,
    /// Forecast slot written by external procedures. Never merged into `data`.
    pub procedure_forecast: Option<Series>,
    pub issues: Vec<PipelineIssue>,
}

impl Variable {
    pub fn from_description(
        node_id: NodeId,
        description: &VariableDescription,
        window: &Window,
        zone: FixedOffset,
    ) -> Result<Self, ConfigurationError> {
        let context = format!("node {} variable {}", node_id, description.id);
        let invalid = |field: &str, message: String| ConfigurationError::InvalidValue {
            context: context.clone(),
            field: field.to_string(),
            message,
        };

        let time_interval = description.time_interval.to_duration();
        if time_interval <= Duration::zero() {
            return Err(invalid("time_interval", "must be positive".to_string()));
        }

        let interpolation_limit = match (description.interpolation_limit, window.interpolation_limit) {
            (Some(limit), _) if limit <= 0 => {
                return Err(ConfigurationError::InvalidInterpolationLimit {
                    context: context.clone(),
                    limit,
                });
            }
            (Some(limit), _) => Some(limit as usize),
            (None, Some(StepsOrInterval::Rows(rows))) => Some(rows.max(0) as usize),
            (None, Some(StepsOrInterval::Interval(i))) => Some(steps_in(i.to_duration(), time_interval)),
            (None, None) => None,
        };

        let kind = match (
            description.input_series.is_empty(),
            &description.derived_from,
            &description.interpolated_from,
        ) {
            (false, None, None) => VariableKind::Observed {
                series: description
                    .input_series
                    .iter()
                    .map(|s| NodeSerie::from_description(s, &context))
                    .collect::<Result<_, _>>()?,
            },
            (true, Some(d), None) => VariableKind::Derived {
                source: DerivedSeries::Single(DerivedOrigin {
                    origin: VariableRef::new(d.node_id, d.variable_id),
                    x_offset: x_offset_from(d.x_offset),
                    y_offset: d.y_offset,
                }),
            },
            (true, None, Some(i)) => {
                if !(0.0..=1.0).contains(&i.interpolation_coefficient) {
                    return Err(invalid(
                        "interpolation_coefficient",
                        format!("{} is outside [0, 1]", i.interpolation_coefficient),
                    ));
                }
                VariableKind::Derived {
                    source: DerivedSeries::Interpolated(InterpolatedOrigin {
                        origin_1: VariableRef::new(i.node_id_1, i.variable_id_1),
                        origin_2: VariableRef::new(i.node_id_2, i.variable_id_2),
                        coefficient: i.interpolation_coefficient,
                        x_offset: x_offset_from(i.x_offset),
                        y_offset: i.y_offset,
                    }),
                }
            }
            (true, None, None) => {
                return Err(invalid(
                    "input_series",
                    "needs input_series, derived_from or interpolated_from".to_string(),
                ));
            }
            _ => {
                return Err(invalid(
                    "input_series",
                    "input_series, derived_from and interpolated_from are mutually exclusive".to_string(),
                ));
            }
        };

        let input_count = description.input_series.len();
        let calibration = description.calibration.map(|c| CalibrationSpec {
            truth: c.truth,
            sim: c.sim,
        });
        if let Some(spec) = calibration {
            if spec.truth >= input_count || spec.sim >= input_count || spec.truth == spec.sim {
                return Err(invalid(
                    "calibration",
                    format!(
                        "truth {} and sim {} must be distinct indices below {}",
                        spec.truth, spec.sim, input_count
                    ),
                ));
            }
        }

        let linear_combination = description.linear_combination.as_ref().map(|l| LinearCombinationSpec {
            intercept: l.intercept,
            coefficients: l.coefficients.clone(),
        });
        if let Some(spec) = &linear_combination {
            if spec.coefficients.len() != input_count {
                return Err(invalid(
                    "linear_combination",
                    format!("{} coefficients for {} input series", spec.coefficients.len(), input_count),
                ));
            }
            if calibration.is_some() {
                return Err(invalid(
                    "linear_combination",
                    "calibration and linear_combination are mutually exclusive".to_string(),
                ));
            }
        }

        let forecast_series = description
            .forecast_series
            .iter()
            .map(|f| ForecastSerie::from_description(f, zone, &context))
            .collect::<Result<Vec<_>, _>>()?;

        let time_offset = description.time_offset.map(|i| i.to_duration()).or(window.time_offset);
        let time_support = description
            .time_support
            .map(|i| i.to_duration())
            .unwrap_or_else(Duration::zero);

        let output_series = description
            .output_series
            .iter()
            .map(|o| OutputSerie {
                series_id: o.series_id,
                series_type: o.series_type,
                x_offset: x_offset_from(o.x_offset),
                y_offset: o.y_offset,
                data: Series::new(),
            })
            .collect();

        Ok(Variable {
            node_id,
            id: description.id,
            name: description.name.clone(),
            kind,
            forecast_series,
            fallback_value: description.fallback_value,
            calibration,
            linear_combination,
            interpolation_limit,
            regularize_mode: description.regularize_mode,
            time_support,
            output_series,
            grid: TimeGrid::new(window.start, window.end, time_interval, time_offset),
            forecast_grid: TimeGrid::new(window.start, window.forecast_end, time_interval, time_offset),
            data: Series::new(),
            original_data: None,
            max_obs_date: None,
            calibration_stats: None,
            procedure_forecast: None,
            issues: Vec::new(),
        })
    }

    pub fn reference(&self) -> VariableRef {
        VariableRef::new(self.node_id, self.id)
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("node {} variable {} ({})", self.node_id, self.id, name),
            None => format!("node {} variable {}", self.node_id, self.id),
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, VariableKind::Derived { .. })
    }

    pub fn input_series(&self) -> &[NodeSerie] {
        match &self.kind {
            VariableKind::Observed { series } => series,
            VariableKind::Derived { .. } => &[],
        }
    }

    fn warn(&mut self, logger: &Logger, issue: PipelineIssue) {
        logger.warn(issue.stage, Some(&self.label()), &issue.message);
        self.issues.push(issue);
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Fetches every leaf of this variable concurrently.
    pub fn load(&mut self, ctx: &LoadContext<'_>, include_forecast: bool) -> Result<(), PipelineError> {
        let grid = &self.grid;
        let mut issues = Vec::new();

        if let VariableKind::Observed { series } = &mut self.kind {
            let found = series
                .par_iter_mut()
                .map(|s| s.load(ctx, grid))
                .collect::<Result<Vec<_>, _>>()?;
            issues.extend(found.into_iter().flatten());
            if let Some(primary) = series.first() {
                self.data = primary.data.clone();
                self.original_data = Some(self.data.clone());
            }
        }

        if include_forecast {
            let found = self
                .forecast_series
                .par_iter_mut()
                .map(|f| f.load(ctx))
                .collect::<Result<Vec<_>, _>>()?;
            issues.extend(found.into_iter().flatten());
        }

        self.issues.extend(issues);
        Ok(())
    }

    /// Returns true when any leaf had outlier bounds configured.
    pub fn remove_outliers(&mut self) -> bool {
        let mut applied = false;
        if let VariableKind::Observed { series } = &mut self.kind {
            for serie in series.iter_mut() {
                applied |= serie.remove_outliers();
            }
        }
        for forecast in self.forecast_series.iter_mut() {
            applied |= forecast.leaf.remove_outliers();
        }
        applied
    }

    pub fn detect_jumps(&mut self) -> bool {
        let mut applied = false;
        if let VariableKind::Observed { series } = &mut self.kind {
            for serie in series.iter_mut() {
                applied |= serie.detect_jumps();
            }
        }
        for forecast in self.forecast_series.iter_mut() {
            applied |= forecast.leaf.detect_jumps();
        }
        applied
    }

    pub fn apply_offset(&mut self) {
        if let VariableKind::Observed { series } = &mut self.kind {
            series.iter_mut().for_each(NodeSerie::apply_offset);
        }
        for forecast in self.forecast_series.iter_mut() {
            forecast.leaf.apply_offset();
        }
    }

    pub fn regularize(&mut self, extrapolate: bool) {
        let (limit, mode) = (self.interpolation_limit, self.regularize_mode);
        if let VariableKind::Observed { series } = &mut self.kind {
            for serie in series.iter_mut() {
                serie.regularize(&self.grid, limit, mode, extrapolate);
            }
        }
        for forecast in self.forecast_series.iter_mut() {
            if !forecast.leaf.data.is_empty() {
                forecast.leaf.regularize(&self.forecast_grid, limit, mode, extrapolate);
            }
        }
    }

    pub fn apply_moving_average(&mut self) {
        if let VariableKind::Observed { series } = &mut self.kind {
            for serie in series.iter_mut() {
                serie.apply_moving_average();
            }
        }
        for forecast in self.forecast_series.iter_mut() {
            forecast.leaf.apply_moving_average();
        }
    }

    /// Folds every secondary input into the primary one. Only the last
    /// input may contribute the constant fallback.
    pub fn fill_nulls(&mut self) {
        let VariableKind::Observed { series } = &mut self.kind else {
            return;
        };
        let Some(primary) = series.first() else {
            return;
        };

        let last = series.len() - 1;
        let mut data = primary.data.clone();
        if last == 0 && self.fallback_value.is_some() {
            let options = FillOptions {
                fill_value: self.fallback_value,
                ..FillOptions::default()
            };
            data = fill_from_other(&data, &Series::new(), &options);
        }
        for (i, other) in series.iter().enumerate().skip(1) {
            let options = FillOptions {
                fill_value: if i == last { self.fallback_value } else { None },
                ..FillOptions::default()
            };
            data = fill_from_other(&data, &other.data, &options);
        }

        series.iter_mut().for_each(NodeSerie::finalize);
        self.data = data;
        self.max_obs_date = self.data.last_valid_timestamp();
    }

    /// Applies calibration or the linear combination, then calibrates any
    /// forecast series flagged `adjust`. Calibration failures are recorded
    /// and leave data unchanged.
    pub fn calibrate(&mut self, logger: &Logger) {
        let mut issues = Vec::new();

        if let VariableKind::Observed { series } = &self.kind {
            if let Some(spec) = self.calibration {
                match calibrate(&series[spec.sim].data, &series[spec.truth].data) {
                    Ok((adjusted, stats)) => {
                        self.data = adjusted;
                        self.calibration_stats = Some(stats);
                    }
                    Err(e) => issues.push(PipelineIssue::calibration(Stage::Calibrate, e.to_string())),
                }
            } else if let Some(spec) = &self.linear_combination {
                let inputs: Vec<&Series> = series.iter().map(|s| &s.data).collect();
                self.data = linear_combine(&inputs, spec.intercept, &spec.coefficients);
            }
        }

        if let Some(truth) = self.input_series().first().map(|s| s.data.clone()) {
            for forecast in self.forecast_series.iter_mut().filter(|f| f.adjust) {
                let sim = forecast.leaf.data.filter(|o| o.tag.as_deref() == Some(TAG_PRONO));
                match calibrate(&sim, &truth) {
                    Ok((adjusted, stats)) => {
                        forecast.leaf.data = Series::from_observations(
                            forecast
                                .leaf
                                .data
                                .iter()
                                .map(|o| adjusted.get(&o.timestamp).cloned().unwrap_or_else(|| o.clone()))
                                .collect(),
                        );
                        forecast.calibration = Some(stats);
                    }
                    Err(e) => issues.push(PipelineIssue::calibration(
                        Stage::Calibrate,
                        format!("forecast series {}: {}", forecast.leaf.series_id, e),
                    )),
                }
            }
        }

        for issue in issues {
            self.warn(logger, issue);
        }
    }

    /// Extends `data` with the first forecast series. With `ignore_warmup`,
    /// only forecast values strictly after the last observed value are used.
    pub fn splice_forecast(&mut self, ignore_warmup: bool, logger: &Logger) {
        if self.forecast_series.is_empty() {
            return;
        }
        self.max_obs_date = self.data.last_valid_timestamp();

        let forecast = &self.forecast_series[0].leaf.data;
        if forecast.is_empty() {
            let message = format!("forecast series {} has no data to splice", self.forecast_series[0].leaf.series_id);
            self.warn(logger, PipelineIssue::data_availability(Stage::Splice, message));
            return;
        }

        let usable = match (ignore_warmup, self.max_obs_date) {
            (true, Some(max)) => forecast.filter(|o| o.timestamp > max),
            _ => forecast.clone(),
        };
        let options = FillOptions {
            extend: true,
            ..FillOptions::default()
        };
        self.data = fill_from_other(&self.data, &usable, &options);
    }

    /// Computes a derived variable from its origins' finalized data, given
    /// in the order of `DerivedSeries::origins`.
    pub fn derive(&mut self, origins: &[&Series], origin_max_obs_date: Option<Timestamp>, logger: &Logger) {
        let VariableKind::Derived { source } = &self.kind else {
            return;
        };

        let shift = match source {
            DerivedSeries::Single(DerivedOrigin {
                x_offset: XOffset::Duration(d),
                ..
            }) => *d,
            _ => Duration::zero(),
        };

        match source.compute(origins) {
            Some(series) => self.data = series,
            None => {
                self.data = Series::new();
                let message = "origin has no data; derived series left empty".to_string();
                self.warn(logger, PipelineIssue::data_availability(Stage::Derive, message));
            }
        }
        self.original_data = Some(self.data.clone());
        self.max_obs_date = origin_max_obs_date.map(|t| t + shift);
    }

    pub fn interpolate_final(&mut self, extrapolate: bool) {
        self.data = interpolate_final(&self.data, self.interpolation_limit, extrapolate);
    }

    pub fn publish_output(&mut self) {
        for output in self.output_series.iter_mut() {
            output.data = apply_offset(&self.data, output.x_offset, output.y_offset);
        }
    }

    /// Rows of `output` ready for upload. Values after the last observation
    /// are withheld unless `include_forecast` is set.
    pub fn upload_rows(&self, output: &OutputSerie, include_forecast: bool) -> Vec<OutputObservation> {
        let shift = match output.x_offset {
            XOffset::Duration(d) => d,
            XOffset::Rows(_) => Duration::zero(),
        };
        let cutoff = if include_forecast {
            None
        } else {
            self.max_obs_date.map(|t| t + shift)
        };

        output
            .data
            .iter()
            .filter(|o| cutoff.map_or(true, |c| o.timestamp <= c))
            .filter_map(|o| o.value.map(|v| OutputObservation::new(&o.timestamp, self.time_support, v)))
            .collect()
    }
}
