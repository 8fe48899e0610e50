//! Request/event log shared across request tasks.
//!
//! Entries are kept in a bounded ring buffer, appended to an optional JSONL
//! file, and mirrored to `tracing` so they show up on the console too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// One routed request, as recorded in the log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary<'a> {
    pub original_model: &'a str,
    pub resolved_model: &'a str,
    pub provider: &'a str,
    pub channel: Option<&'a str>,
    pub stream: bool,
    pub messages: usize,
    pub tools: usize,
}

/// Ring-buffer logger that optionally persists to JSONL
pub struct Logger {
    entries: VecDeque<LogEntry>,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(file_path: Option<&Path>) -> std::io::Result<Self> {
        let writer = match file_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        Ok(Self {
            entries: VecDeque::with_capacity(256),
            writer,
        })
    }

    pub fn log(&mut self, entry: LogEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    /// Logger appending to the JSONL file at `file_path`.
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(Some(
            file_path.as_ref(),
        ))?))))
    }

    /// Logger that only keeps the in-memory ring buffer.
    #[must_use]
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Logger {
            entries: VecDeque::with_capacity(256),
            writer: None,
        })))
    }

    pub fn log(&self, entry: LogEntry) {
        mirror_to_tracing(&entry);
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    pub fn log_request(&self, summary: &RequestSummary<'_>) {
        let message = format!(
            "{} -> {} ({} messages, {} tools{})",
            summary.original_model,
            summary.resolved_model,
            summary.messages,
            summary.tools,
            if summary.stream { ", streaming" } else { "" }
        );
        let context = serde_json::to_value(summary).unwrap_or(serde_json::Value::Null);
        self.log_with_context(LogLevel::Info, "request", message, context);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let component = entry.component.as_str();
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Debug => tracing::debug!(component, "{message}"),
        LogLevel::Info => tracing::info!(component, "{message}"),
        LogLevel::Warn => tracing::warn!(component, "{message}"),
        LogLevel::Error => tracing::error!(component, "{message}"),
    }
}
