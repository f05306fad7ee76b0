//! Serde DTOs for the task configuration blob and the events a task emits.
//!
//! # Design
//! The binding layer treats both as opaque strings. These types exist for the
//! built-in engine, which parses the configuration and serializes events as
//! `{"key": ..., "value": {...}}` objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every event key the built-in engine may emit.
pub const KNOWN_EVENTS: &[&str] = &[
    "failure.measurement",
    "failure.startup",
    "log",
    "measurement",
    "status.end",
    "status.measurement_done",
    "status.measurement_start",
    "status.progress",
    "status.queued",
    "status.started",
];

pub fn is_known_event(key: &str) -> bool {
    KNOWN_EVENTS.contains(&key)
}

/// Top-level configuration keys the built-in engine understands.
pub const KNOWN_SETTINGS: &[&str] = &[
    "annotations",
    "disabled_events",
    "input_filepaths",
    "inputs",
    "log_filepath",
    "log_level",
    "name",
    "options",
    "output_filepath",
];

/// One record in a task's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub key: String,
    pub value: Value,
}

impl EventRecord {
    pub fn new(key: &str, value: Value) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }

    pub fn empty(key: &str) -> Self {
        Self::new(key, Value::Object(Map::new()))
    }
}

/// Log verbosity, most severe first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Err,
    #[default]
    Warning,
    Info,
    Debug,
    Debug2,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Err,
        LogLevel::Warning,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Debug2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Debug2 => "DEBUG2",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown log level '{s}'"))
    }
}

/// A scalar option value passed to a nettest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Int(n) => Some(*n as f64),
            OptionValue::Float(n) => Some(*n),
            OptionValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// The configuration blob accepted by the built-in engine.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Settings {
    pub name: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub annotations: Map<String, Value>,
    #[serde(default)]
    pub inputs: Vec<Value>,
    #[serde(default)]
    pub input_filepaths: Vec<Value>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub disabled_events: Vec<Value>,
    #[serde(default)]
    pub log_filepath: Option<String>,
    #[serde(default)]
    pub output_filepath: Option<String>,
}
