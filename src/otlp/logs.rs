use crate::otlp::value::{serialize_u64_as_string, AnyValue, KeyValue};
use serde::Serialize;

/// Top-level envelope of the logs signal: `{"resourceLogs": [...]}` on the
/// wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsData {
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    pub resource: Resource,
    pub scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    pub log_records: Vec<LogRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Unix nanoseconds, rendered as a decimal string per the protobuf JSON
    /// mapping of fixed64.
    #[serde(serialize_with = "serialize_u64_as_string")]
    pub time_unix_nano: u64,
    #[serde(skip_serializing_if = "severity_number_is_unset")]
    pub severity_number: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub severity_text: String,
    pub body: AnyValue,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
}

fn severity_number_is_unset(n: &i32) -> bool {
    *n == 0
}

impl LogRecord {
    /// A record with just a timestamp and body; severity and attributes
    /// unset.
    pub fn new(time_unix_nano: u64, body: AnyValue) -> LogRecord {
        LogRecord {
            time_unix_nano,
            severity_number: 0,
            severity_text: String::new(),
            body,
            attributes: Vec::new(),
        }
    }
}
