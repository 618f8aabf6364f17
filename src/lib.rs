//! `hydrofuse`: conditioning and derivation of hydrological time series.
//!
//! A topology of nodes and variables is loaded from a description, each
//! variable's input series are fetched from an observation provider, then
//! cleaned, regularized onto a fixed time grid, gap-filled, calibrated,
//! spliced with forecasts and derived into further variables. The result is
//! one canonical series per variable, ready for upload or for use as a
//! boundary condition by external simulation procedures.
//!
//! - `model`     — series, tags and the error taxonomy
//! - `timegrid`  — intervals, timestamp parsing, regular grids
//! - `analysis`  — pure series transforms
//! - `ingest`    — provider trait, HTTP and in-memory providers
//! - `topology`  — the graph and its batch pipeline
//! - `procedure` — boundary-condition interface
//! - `report`    — provenance report and pivot view
//! - `config`    — pipeline configuration
//! - `logging`   — stage-tagged logger

pub mod analysis;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod procedure;
pub mod report;
pub mod timegrid;
pub mod topology;
