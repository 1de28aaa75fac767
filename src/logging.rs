// SPDX-License-Identifier: GPL-3.0-only

//! Logging setup
//!
//! Console output goes through the `tracing-subscriber` fmt layer, filtered by
//! `RUST_LOG`. Events at or above the configured level are additionally
//! appended to the system log, one JSON object per line:
//!
//! ```text
//! {"timestamp":"2025-01-01T12:00:00.000+01:00","level":"INFO","source":"stillcam::pipelines::photo::session","message":"Photo saved path=..."}
//! ```
//!
//! Writing the system log is best-effort; a broken log file never fails a
//! capture.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// One line of the system log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub source: String,
    pub message: String,
}

/// Append-only JSON-lines log file
#[derive(Debug)]
pub struct SystemLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
    /// Set after the first write failure so stderr is not flooded
    failed: AtomicBool,
}

impl SystemLog {
    /// The file is opened (and its directory created) on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; returns whether it reached the file
    pub fn log(&self, level: &str, source: &str, message: &str) -> bool {
        let record = LogRecord {
            timestamp: chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
            level: level.to_string(),
            source: source.to_string(),
            message: message.to_string(),
        };
        match self.append(&record) {
            Ok(()) => true,
            Err(e) => {
                if !self.failed.swap(true, Ordering::Relaxed) {
                    eprintln!("Unable to write system log {}: {}", self.path.display(), e);
                }
                false
            }
        }
    }

    fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if file.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        match file.as_mut() {
            Some(handle) => handle.write_all(line.as_bytes()),
            None => Ok(()),
        }
    }
}

/// Read every record of a system log file
pub fn read_records(path: &Path) -> std::io::Result<Vec<LogRecord>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(std::io::Error::from))
        .collect()
}

/// Forwards tracing events to a [`SystemLog`]
pub struct SystemLogLayer {
    log: Arc<SystemLog>,
    min_level: Level,
}

impl SystemLogLayer {
    /// Forward events at `min_level` and more severe
    pub fn new(log: Arc<SystemLog>, min_level: Level) -> Self {
        Self { log, min_level }
    }
}

impl<S: Subscriber> Layer<S> for SystemLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater
        if *metadata.level() > self.min_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.log
            .log(metadata.level().as_str(), metadata.target(), &visitor.finish());
    }
}

/// Collects the message and `key=value` fields of an event
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: &dyn std::fmt::Display) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), &format_args!("{:?}", value));
        }
    }
}

/// Install the global subscriber
///
/// `default_filter` applies to the console when `RUST_LOG` is unset.
pub fn init(default_filter: &str, log_file: &Path, min_level: Level) -> AppResult<Arc<SystemLog>> {
    let log = Arc::new(SystemLog::new(log_file));
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .with(SystemLogLayer::new(Arc::clone(&log), min_level))
        .try_init()
        .map_err(|e| AppError::Other(format!("logging already initialized: {}", e)))?;

    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> PathBuf {
        std::env::temp_dir()
            .join(format!("stillcam-log-{}", uuid::Uuid::new_v4()))
            .join("logs")
            .join("system.log")
    }

    #[test]
    fn test_records_are_appended_as_json_lines() {
        let path = temp_log();
        let log = SystemLog::new(&path);
        assert!(log.log("INFO", "camera", "initialized"));
        assert!(log.log("ERROR", "camera", "capture failed"));

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "INFO");
        assert_eq!(records[1].message, "capture failed");
        assert!(!records[0].timestamp.is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[test]
    fn test_unwritable_log_is_not_fatal() {
        let log = SystemLog::new("/proc/stillcam/system.log");
        assert!(!log.log("INFO", "test", "dropped"));
        assert!(!log.log("INFO", "test", "dropped again"));
    }

    #[test]
    fn test_layer_forwards_by_level() {
        let path = temp_log();
        let log = Arc::new(SystemLog::new(&path));
        let subscriber =
            tracing_subscriber::registry().with(SystemLogLayer::new(Arc::clone(&log), Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("too verbose");
            tracing::info!(frames = 2, "Capture finished");
            tracing::warn!("Driver adjusted configuration");
        });

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "Capture finished frames=2");
        assert_eq!(records[1].level, "WARN");

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }
}
