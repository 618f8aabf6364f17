/// Structured logging for the conditioning pipeline
///
/// Every entry carries the pipeline stage that produced it and, when known,
/// the series or variable it concerns. Output goes to the console and,
/// optionally, to an append-only log file.
///
/// A `Logger` is passed explicitly to the topology rather than held in a
/// global, so concurrent leaf loads and independent topologies in tests do
/// not share state.

use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::model::{ProviderError, SeriesId, Stage};

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the series simply has no data in the window
    Expected,
    /// Provider outage or a response we could not parse
    Unexpected,
    /// Anything else; needs a human to look at it
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Logger {
    /// Entries below this level are dropped
    min_level: LogLevel,
    /// Append-only sink, in addition to the console
    log_file: Option<String>,
    /// Console lines carry the full formatted entry when set
    console_timestamps: bool,
    /// When false every call is a no-op
    enabled: bool,
    /// Shared by clones; held while an entry is written so lines from
    /// concurrent loads do not interleave
    write_lock: Arc<Mutex<()>>,
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(LogLevel::Info, None, false)
    }
}

impl Logger {
    pub fn new(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) -> Self {
        Logger {
            min_level,
            log_file: log_file.map(String::from),
            console_timestamps,
            enabled: true,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A logger that discards everything. Used by tests and library callers
    /// that collect issues from the report instead.
    pub fn disabled() -> Self {
        Logger {
            enabled: false,
            ..Logger::default()
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Formats a single log line. Kept separate from `log` so the format is
    /// testable without touching stdout.
    pub fn format_entry(level: LogLevel, stage: Stage, target: Option<&str>, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let target_part = target.map(|s| format!(" [{}]", s)).unwrap_or_default();
        format!("{} {} {}{}: {}", timestamp, level, stage, target_part, message)
    }

    pub fn log(&self, level: LogLevel, stage: Stage, target: Option<&str>, message: &str) {
        if !self.enabled || level < self.min_level {
            return;
        }

        let log_entry = Self::format_entry(level, stage, target, message);
        let target_part = target.map(|s| format!(" [{}]", s)).unwrap_or_default();
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.console_timestamps {
            match level {
                LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
                LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", stage, target_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", stage, target_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}{}: {}", stage, target_part, message),
            }
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }

    pub fn info(&self, stage: Stage, target: Option<&str>, message: &str) {
        self.log(LogLevel::Info, stage, target, message);
    }

    pub fn warn(&self, stage: Stage, target: Option<&str>, message: &str) {
        self.log(LogLevel::Warning, stage, target, message);
    }

    pub fn error(&self, stage: Stage, target: Option<&str>, message: &str) {
        self.log(LogLevel::Error, stage, target, message);
    }

    pub fn debug(&self, stage: Stage, target: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, stage, target, message);
    }
}

// ---------------------------------------------------------------------------
// Provider failures and stage summaries
// ---------------------------------------------------------------------------

/// Classify a provider failure. Server-side and parse errors point at
/// service degradation or an API change; a 404 usually means the series id
/// does not exist for that type.
pub fn classify_provider_failure(err: &ProviderError) -> FailureType {
    match err {
        ProviderError::Http { status: 404, .. } => FailureType::Expected,
        ProviderError::Http { status, .. } if *status >= 500 => FailureType::Unexpected,
        ProviderError::Http { .. } => FailureType::Unknown,
        ProviderError::Parse(_) => FailureType::Unexpected,
        ProviderError::Request(msg) if msg.contains("timed out") || msg.contains("timeout") => {
            FailureType::Unexpected
        }
        ProviderError::Request(_) => FailureType::Unknown,
    }
}

/// Log a provider failure with automatic classification
pub fn log_provider_failure(logger: &Logger, series_id: SeriesId, stage: Stage, operation: &str, err: &ProviderError) {
    let failure_type = classify_provider_failure(err);
    let target = format!("series {}", series_id);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => logger.debug(stage, Some(&target), &message),
        FailureType::Unexpected => logger.error(stage, Some(&target), &message),
        FailureType::Unknown => logger.warn(stage, Some(&target), &message),
    }
}

// ---------------------------------------------------------------------------
// Stage Summary Logging
// ---------------------------------------------------------------------------

/// Log how many variables a stage touched and how many came out degraded.
pub fn log_stage_summary(logger: &Logger, stage: Stage, total: usize, degraded: usize) {
    let message = format!(
        "{} complete: {}/{} variables clean, {} degraded",
        stage,
        total - degraded.min(total),
        total,
        degraded
    );

    if degraded == 0 {
        logger.info(stage, None, &message);
    } else if degraded >= total {
        logger.error(stage, None, &message);
    } else {
        logger.warn(stage, None, &message);
    }
}
