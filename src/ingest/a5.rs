/// a5 observation/forecast API client
///
/// Reads observed series and forecast runs of calibrated models, uploads
/// derived observations and files outputs as new forecast runs. Every request carries the bearer token when
/// one is configured; any non-2xx response is a `ProviderError::Http`.
///
/// Endpoints:
/// - `GET  {url}/obs/{type}/series/{id}?timestart&timeend`
/// - `GET  {url}/sim/calibrados/{model}/corridas/{run|last}?timestart&timeend&series_id[&qualifier]`
/// - `GET  {url}/sim/calibrados/{model}/corridas?forecast_date`
/// - `POST {url}/obs/{type}/series/{id}/observaciones`
/// - `POST {url}/sim/calibrados/{model}/corridas`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ForecastOutputSeries, ForecastSelector, ObservationProvider, OutputObservation, RawObservation, SeriesType};
use crate::model::{ProviderError, SeriesId, Timestamp};
use crate::timegrid::format_timestamp;

// ============================================================================
// API Response Structures
// ============================================================================

/// Observed series response. Only the observations are read.
#[derive(Debug, Deserialize)]
pub struct SeriesResponse {
    #[serde(default, rename = "observaciones")]
    pub observations: Vec<RawObservation>,
}

/// One series of a forecast run. Rows are positional arrays
/// `[timestart, timeend, value, qualifier]`.
#[derive(Debug, Deserialize)]
pub struct ForecastSeries {
    #[serde(default)]
    pub series_id: Option<SeriesId>,
    #[serde(default, rename = "pronosticos")]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ForecastRunResponse {
    #[serde(default)]
    pub series: Vec<ForecastSeries>,
}

/// Run listing entry.
#[derive(Debug, Deserialize)]
pub struct RunSummary {
    pub id: u64,
    #[serde(default)]
    pub forecast_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadBody<'a> {
    #[serde(rename = "observaciones")]
    observations: &'a [OutputObservation],
}

#[derive(Debug, Serialize)]
struct RunUploadBody<'a> {
    cal_id: u64,
    forecast_date: String,
    series: Vec<RunUploadSeries<'a>>,
}

#[derive(Debug, Serialize)]
struct RunUploadSeries<'a> {
    series_id: SeriesId,
    series_table: &'static str,
    #[serde(rename = "pronosticos")]
    forecasts: &'a [OutputObservation],
}

impl<'a> RunUploadBody<'a> {
    fn new(cal_id: u64, forecast_date: &Timestamp, series: &'a [ForecastOutputSeries]) -> Self {
        RunUploadBody {
            cal_id,
            forecast_date: format_timestamp(forecast_date),
            series: series
                .iter()
                .map(|s| RunUploadSeries {
                    series_id: s.series_id,
                    series_table: s.series_type.table_name(),
                    forecasts: &s.forecasts,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_series_response(body: &str) -> Result<Vec<RawObservation>, ProviderError> {
    let response: SeriesResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(format!("observations response: {}", e)))?;
    Ok(response.observations)
}

/// Extracts `(timestart, value)` rows from the first series of a run.
/// Values may arrive as numbers or numeric strings.
pub fn parse_forecast_response(body: &str) -> Result<Vec<RawObservation>, ProviderError> {
    let response: ForecastRunResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(format!("forecast response: {}", e)))?;

    let Some(first) = response.series.into_iter().next() else {
        return Ok(Vec::new());
    };

    first
        .rows
        .iter()
        .map(|row| {
            let timestart = row
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::Parse(format!("forecast row without timestart: {:?}", row)))?;
            let valor = match row.get(2) {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => Some(
                    s.trim()
                        .parse::<f64>()
                        .map_err(|e| ProviderError::Parse(format!("forecast value '{}': {}", s, e)))?,
                ),
                _ => None,
            };
            Ok(RawObservation {
                timestart: timestart.to_string(),
                timeend: row.get(1).and_then(Value::as_str).map(String::from),
                valor,
            })
        })
        .collect()
}

pub fn parse_run_list(body: &str) -> Result<Vec<RunSummary>, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Parse(format!("run listing: {}", e)))
}

pub fn parse_created_response(body: &str) -> Result<Vec<RawObservation>, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Parse(format!("upload response: {}", e)))
}

pub fn parse_created_run(body: &str) -> Result<u64, ProviderError> {
    let run: RunSummary =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(format!("created run: {}", e)))?;
    Ok(run.id)
}

// ============================================================================
// Client
// ============================================================================

enum RunChoice {
    Latest,
    Run(u64),
    /// No run was issued at or after the requested forecast date.
    NoneIssued,
}

pub struct A5Client {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl A5Client {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(A5Client {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn series_url(&self, series_type: SeriesType, series_id: SeriesId) -> String {
        format!("{}/obs/{}/series/{}", self.base_url, series_type.path_segment(), series_id)
    }

    pub fn run_url(&self, model_id: u64, run: Option<u64>) -> String {
        match run {
            Some(id) => format!("{}/sim/calibrados/{}/corridas/{}", self.base_url, model_id, id),
            None => format!("{}/sim/calibrados/{}/corridas/last", self.base_url, model_id),
        }
    }

    fn authorize(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn execute(&self, request: reqwest::blocking::RequestBuilder) -> Result<String, ProviderError> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        let body = response.text().map_err(|e| ProviderError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body)
    }

    fn resolve_run(&self, selector: &ForecastSelector) -> Result<RunChoice, ProviderError> {
        if let Some(id) = selector.run_id {
            return Ok(RunChoice::Run(id));
        }
        let Some(date) = selector.forecast_date else {
            return Ok(RunChoice::Latest);
        };
        let url = format!("{}/sim/calibrados/{}/corridas", self.base_url, selector.model_id);
        let body = self.execute(self.client.get(&url).query(&[("forecast_date", format_timestamp(&date))]))?;
        Ok(match parse_run_list(&body)?.first() {
            Some(run) => RunChoice::Run(run.id),
            None => RunChoice::NoneIssued,
        })
    }
}

impl ObservationProvider for A5Client {
    fn fetch_series(
        &self,
        series_id: SeriesId,
        series_type: SeriesType,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError> {
        let request = self.client.get(self.series_url(series_type, series_id)).query(&[
            ("timestart", format_timestamp(start)),
            ("timeend", format_timestamp(end)),
        ]);
        let body = self.execute(request)?;
        parse_series_response(&body)
    }

    fn fetch_forecast(
        &self,
        series_id: SeriesId,
        selector: &ForecastSelector,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<RawObservation>, ProviderError> {
        let run = match self.resolve_run(selector)? {
            RunChoice::Run(id) => Some(id),
            RunChoice::Latest => None,
            RunChoice::NoneIssued => return Ok(Vec::new()),
        };

        let mut params = vec![
            ("timestart", format_timestamp(start)),
            ("timeend", format_timestamp(end)),
            ("series_id", series_id.to_string()),
        ];
        if let Some(qualifier) = &selector.qualifier {
            params.push(("qualifier", qualifier.clone()));
        }

        let body = self.execute(self.client.get(self.run_url(selector.model_id, run)).query(&params))?;
        parse_forecast_response(&body)
    }

    fn push_observations(
        &self,
        series_id: SeriesId,
        series_type: SeriesType,
        observations: &[OutputObservation],
    ) -> Result<Vec<RawObservation>, ProviderError> {
        let url = format!("{}/observaciones", self.series_url(series_type, series_id));
        let payload = serde_json::to_string(&UploadBody { observations })
            .map_err(|e| ProviderError::Parse(format!("upload body: {}", e)))?;
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload);
        let body = self.execute(request)?;
        parse_created_response(&body)
    }

    fn push_forecast(
        &self,
        cal_id: u64,
        forecast_date: &Timestamp,
        series: &[ForecastOutputSeries],
    ) -> Result<u64, ProviderError> {
        let url = format!("{}/sim/calibrados/{}/corridas", self.base_url, cal_id);
        let payload = serde_json::to_string(&RunUploadBody::new(cal_id, forecast_date, series))
            .map_err(|e| ProviderError::Parse(format!("forecast run body: {}", e)))?;
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload);
        let body = self.execute(request)?;
        parse_created_run(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fixtures;
    use crate::timegrid::{parse_timestamp, parse_utc_offset};

    #[test]
    fn test_parse_series_response_keeps_nulls() {
        let rows = parse_series_response(fixtures::SERIES_RESPONSE).expect("fixture should parse");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].valor, Some(2.41));
        assert_eq!(rows[1].valor, None, "null values must survive parsing");
    }

    #[test]
    fn test_parse_series_response_without_observations_is_empty() {
        let rows = parse_series_response(fixtures::EMPTY_SERIES_RESPONSE).expect("fixture should parse");
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_series_response_rejects_garbage() {
        let result = parse_series_response("<html>502 Bad Gateway</html>");
        assert!(matches!(result, Err(ProviderError::Parse(_))));
    }

    #[test]
    fn test_parse_forecast_response_reads_positional_rows() {
        let rows = parse_forecast_response(fixtures::FORECAST_RESPONSE).expect("fixture should parse");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].valor, Some(2.61), "numeric strings are accepted");
        assert_eq!(rows[1].valor, Some(2.7));
        assert_eq!(rows[2].valor, None);
        assert_eq!(rows[0].timestart, "2022-05-26T03:00:00.000Z");
    }

    #[test]
    fn test_parse_forecast_response_without_series_is_empty() {
        let rows = parse_forecast_response(r#"{"cal_id": 289, "series": []}"#).expect("should parse");
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_run_list_preserves_provider_order() {
        let runs = parse_run_list(fixtures::RUN_LIST_RESPONSE).expect("fixture should parse");
        assert_eq!(runs[0].id, 1240);
    }

    #[test]
    fn test_parse_created_response() {
        let created = parse_created_response(fixtures::CREATED_RESPONSE).expect("fixture should parse");
        assert_eq!(created[0].valor, Some(1.5));
    }

    #[test]
    fn test_urls_follow_api_layout() {
        let client = A5Client::new("https://alerta.example.org/a5/", None).expect("client builds");
        assert_eq!(
            client.series_url(SeriesType::Areal, 42),
            "https://alerta.example.org/a5/obs/areal/series/42"
        );
        assert_eq!(
            client.run_url(289, None),
            "https://alerta.example.org/a5/sim/calibrados/289/corridas/last"
        );
        assert_eq!(
            client.run_url(289, Some(7)),
            "https://alerta.example.org/a5/sim/calibrados/289/corridas/7"
        );
    }

    #[test]
    fn test_upload_body_wraps_observations() {
        let zone = parse_utc_offset("-03:00").unwrap();
        let start = parse_timestamp("2022-05-25T00:00:00", zone).unwrap();
        let rows = vec![OutputObservation::new(&start, chrono::Duration::zero(), 1.0)];
        let json = serde_json::to_value(UploadBody { observations: &rows }).unwrap();
        assert_eq!(json["observaciones"][0]["valor"], 1.0);
    }

    #[test]
    fn test_parse_created_run_returns_run_id() {
        assert_eq!(parse_created_run(fixtures::CREATED_RUN_RESPONSE).unwrap(), 1301);
        assert!(matches!(parse_created_run("[]"), Err(ProviderError::Parse(_))));
    }

    #[test]
    fn test_forecast_run_body_layout() {
        let zone = parse_utc_offset("-03:00").unwrap();
        let issued = parse_timestamp("2022-05-25T00:00:00", zone).unwrap();
        let series = vec![ForecastOutputSeries {
            series_id: 3526,
            series_type: SeriesType::Areal,
            forecasts: vec![OutputObservation::new(&issued, chrono::Duration::days(1), 2.5)],
        }];
        let json = serde_json::to_value(RunUploadBody::new(489, &issued, &series)).unwrap();

        assert_eq!(json["cal_id"], 489);
        assert_eq!(json["forecast_date"], "2022-05-25T00:00:00-03:00");
        assert_eq!(json["series"][0]["series_table"], "series_areal");
        assert_eq!(json["series"][0]["pronosticos"][0]["valor"], 2.5);
        assert_eq!(json["series"][0]["pronosticos"][0]["timeend"], "2022-05-26T00:00:00-03:00");
    }

    /// Integration test against a live a5 instance.
    /// Run with: A5_URL=... A5_API_TOKEN=... cargo test -- --ignored
    #[test]
    #[ignore]
    fn test_live_fetch_series() {
        let url = std::env::var("A5_URL").expect("A5_URL must be set");
        let token = std::env::var("A5_API_TOKEN").ok();
        let client = A5Client::new(&url, token).expect("client builds");

        let zone = parse_utc_offset("-03:00").unwrap();
        let end = chrono::Utc::now().with_timezone(&zone);
        let start = end - chrono::Duration::days(3);

        match client.fetch_series(151, SeriesType::Point, &start, &end) {
            Ok(rows) => println!("✓ fetched {} observations for series 151", rows.len()),
            Err(e) => panic!("live fetch failed: {}", e),
        }
    }
}
