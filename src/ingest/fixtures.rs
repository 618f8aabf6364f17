/// Canned provider payloads shared by the ingest unit tests.

/// Observations endpoint response with one null value and extra fields the
/// client must ignore.
pub const SERIES_RESPONSE: &str = r#"{
  "id": 151,
  "tipo": "puntual",
  "estacion": {"id": 1698, "nombre": "Paraná"},
  "observaciones": [
    {"timestart": "2022-05-25T03:00:00.000Z", "timeend": "2022-05-25T03:00:00.000Z", "valor": 2.41},
    {"timestart": "2022-05-25T04:00:00.000Z", "timeend": "2022-05-25T04:00:00.000Z", "valor": null},
    {"timestart": "2022-05-25T05:00:00.000Z", "timeend": "2022-05-25T05:00:00.000Z", "valor": 2.45}
  ]
}"#;

/// Series with no observations in the window.
pub const EMPTY_SERIES_RESPONSE: &str = r#"{"id": 151, "tipo": "puntual"}"#;

/// Forecast run response; values come as `[timestart, timeend, value, qualifier]`.
pub const FORECAST_RESPONSE: &str = r#"{
  "cal_id": 289,
  "id": 1234,
  "forecast_date": "2022-05-25T09:00:00.000Z",
  "series": [
    {
      "series_id": 3398,
      "series_table": "series",
      "pronosticos": [
        ["2022-05-26T03:00:00.000Z", "2022-05-26T03:00:00.000Z", "2.61", "main"],
        ["2022-05-27T03:00:00.000Z", "2022-05-27T03:00:00.000Z", 2.7, "main"],
        ["2022-05-28T03:00:00.000Z", "2022-05-28T03:00:00.000Z", null, "main"]
      ]
    }
  ]
}"#;

/// Run listing returned when querying runs by forecast date.
pub const RUN_LIST_RESPONSE: &str = r#"[
  {"id": 1240, "cal_id": 289, "forecast_date": "2022-05-26T09:00:00.000Z"},
  {"id": 1234, "cal_id": 289, "forecast_date": "2022-05-25T09:00:00.000Z"}
]"#;

/// Observations echoed back after an upload.
pub const CREATED_RESPONSE: &str = r#"[
  {"id": 9001, "series_id": 900, "timestart": "2022-05-25T03:00:00.000Z", "timeend": "2022-05-26T03:00:00.000Z", "valor": 1.5}
]"#;

/// Response to creating a forecast run.
pub const CREATED_RUN_RESPONSE: &str = r#"{
  "id": 1301,
  "cal_id": 489,
  "forecast_date": "2022-05-25T03:00:00.000Z",
  "series": [{"series_id": 900, "series_table": "series", "pronosticos": []}]
}"#;
