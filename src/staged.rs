//! Per-record service attribution for staged-batch deliveries, where input
//! arrives as newline-delimited JSON drained from an object store rather
//! than as a logs-stream event.

use crate::{
    otlp::{AnyValue, KeyValue, LogRecord, LogsData, Resource, ResourceLogs, ScopeLogs},
    FORWARDER_ID, MAX_RECORDS_PER_REQUEST,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Service attributed to records that carry neither a usable log name nor a
/// resource type.
pub const FALLBACK_SERVICE: &str = "gcp-service-unknown";

/// Attribute carried by every staged record, naming the object it was
/// drained from.
const FILE_SOURCE_KEY: &str = "gcs.file_source";

/// Derives the service name a record is attributed to: the last segment of
/// its log name, unless that segment is one of the catch-all log names
/// (`syslog`, `activity`), in which case the resource type is used instead.
pub fn service_name(record: &Value) -> String {
    let segment = record
        .get("logName")
        .and_then(Value::as_str)
        .and_then(|name| name.rsplit('/').next())
        .filter(|segment| !segment.is_empty())
        .filter(|segment| *segment != "syslog" && *segment != "activity");

    if let Some(segment) = segment {
        return segment.to_owned();
    }

    record
        .pointer("/resource/type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(FALLBACK_SERVICE)
        .to_owned()
}

/// The record's timestamp as Unix nanoseconds, trying the known timestamp
/// fields in order and falling back to the current wall clock when none
/// parses.
pub fn timestamp_nanos(record: &Value) -> u64 {
    for field in ["timestamp", "time", "receiveTimestamp"] {
        if let Some(parsed) = record
            .get(field)
            .and_then(Value::as_str)
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        {
            return u64::try_from(parsed.timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0);
        }
    }
    u64::try_from(Utc::now().timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0)
}

/// Maps a severity string onto the OTLP severity number scale. Unrecognized
/// severities count as informational.
pub fn severity_number(severity: &str) -> i32 {
    match severity {
        "DEBUG" => 5,
        "INFO" | "NOTICE" => 9,
        "WARNING" => 13,
        "ERROR" => 17,
        "CRITICAL" | "ALERT" | "EMERGENCY" => 21,
        _ => 9,
    }
}

/// Shapes one staged record into a log record: timestamp chain, severity,
/// the whole JSON tree re-shaped as the body, and the source object stamped
/// as an attribute. Returns the service name the record belongs to.
pub fn attribute_record(record: &Value, source_object: &str) -> (String, LogRecord) {
    let service = service_name(record);

    let severity_text = record
        .get("severity")
        .and_then(Value::as_str)
        .unwrap_or("INFO")
        .to_owned();

    let mut log_record = LogRecord::new(timestamp_nanos(record), AnyValue::from_json(record));
    log_record.severity_number = severity_number(&severity_text);
    log_record.severity_text = severity_text;
    log_record.attributes = vec![KeyValue::string(FILE_SOURCE_KEY, source_object)];

    (service, log_record)
}

/// Renders one service's accumulated records as a logs payload.
fn service_payload(service: &str, records: Vec<LogRecord>) -> LogsData {
    LogsData {
        resource_logs: vec![ResourceLogs {
            resource: Resource {
                attributes: vec![
                    KeyValue::string("service.name", service),
                    KeyValue::string("cloud.provider", "gcp"),
                    KeyValue::string("telemetry.sdk.name", FORWARDER_ID),
                ],
            },
            scope_logs: vec![ScopeLogs {
                log_records: records,
            }],
        }],
    }
}

/// Accumulates staged records per service name, yielding a full payload
/// whenever a service reaches the sub-batch cap. Residual records are
/// yielded by [`Self::drain`] on EOF.
#[derive(Debug, Default)]
pub struct ServiceBatcher {
    open: HashMap<String, Vec<LogRecord>>,
}

impl ServiceBatcher {
    pub fn new() -> ServiceBatcher {
        ServiceBatcher::default()
    }

    /// Adds a record under its service. When the service's open sub-batch
    /// reaches the cap, it is closed and returned for export.
    pub fn push(&mut self, service: String, record: LogRecord) -> Option<LogsData> {
        let batch = self.open.entry(service.clone()).or_default();
        batch.push(record);
        if batch.len() >= MAX_RECORDS_PER_REQUEST {
            let records = self.open.remove(&service).unwrap_or_default();
            return Some(service_payload(&service, records));
        }
        None
    }

    /// Closes out every non-empty sub-batch still open.
    pub fn drain(self) -> Vec<LogsData> {
        self.open
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(service, records)| service_payload(&service, records))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_from_log_name_suffix() {
        let record = json!({"logName": "projects/my-project/logs/nginx-access"});
        assert_eq!(service_name(&record), "nginx-access");
    }

    #[test]
    fn catch_all_log_names_fall_back_to_resource_type() {
        for name in ["syslog", "activity"] {
            let record = json!({
                "logName": format!("projects/my-project/logs/{name}"),
                "resource": {"type": "gce_instance"}
            });
            assert_eq!(service_name(&record), "gce_instance", "log name {name}");
        }
    }

    #[test]
    fn missing_everything_uses_fallback_service() {
        assert_eq!(service_name(&json!({})), FALLBACK_SERVICE);
        let record = json!({"logName": "projects/p/logs/syslog"});
        assert_eq!(service_name(&record), FALLBACK_SERVICE);
    }

    #[test]
    fn timestamp_field_chain() {
        let record = json!({"timestamp": "2021-05-03T00:00:00Z"});
        assert_eq!(timestamp_nanos(&record), 1_620_000_000_000_000_000);

        // Unparseable primary timestamp falls through to the next field.
        let record = json!({"timestamp": "not a date", "time": "2021-05-03T00:00:01Z"});
        assert_eq!(timestamp_nanos(&record), 1_620_000_001_000_000_000);

        let record = json!({"receiveTimestamp": "2021-05-03T00:00:02+00:00"});
        assert_eq!(timestamp_nanos(&record), 1_620_000_002_000_000_000);

        // Nothing parseable: wall clock, which is at least later than the
        // fixtures above.
        let record = json!({});
        assert!(timestamp_nanos(&record) > 1_620_000_000_000_000_000);
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(severity_number("DEBUG"), 5);
        assert_eq!(severity_number("INFO"), 9);
        assert_eq!(severity_number("NOTICE"), 9);
        assert_eq!(severity_number("WARNING"), 13);
        assert_eq!(severity_number("ERROR"), 17);
        assert_eq!(severity_number("CRITICAL"), 21);
        assert_eq!(severity_number("ALERT"), 21);
        assert_eq!(severity_number("EMERGENCY"), 21);
        assert_eq!(severity_number("anything else"), 9);
    }

    #[test]
    fn record_attribution() {
        let record = json!({
            "logName": "projects/p/logs/app",
            "severity": "ERROR",
            "timestamp": "2021-05-03T00:00:00Z",
            "jsonPayload": {"message": "boom", "count": 3}
        });

        let (service, log_record) = attribute_record(&record, "staging/batch-0001.ndjson");
        assert_eq!(service, "app");
        assert_eq!(log_record.severity_text, "ERROR");
        assert_eq!(log_record.severity_number, 17);
        assert_eq!(
            log_record.attributes,
            vec![KeyValue::string("gcs.file_source", "staging/batch-0001.ndjson")]
        );
        // The body is the whole record re-shaped, not a string copy.
        assert!(matches!(log_record.body, AnyValue::KvlistValue(_)));
    }

    #[test]
    fn batcher_flushes_at_cap_and_drains_residue() {
        let mut batcher = ServiceBatcher::new();
        let record = json!({"logName": "projects/p/logs/app"});

        let mut flushed = Vec::new();
        for _ in 0..MAX_RECORDS_PER_REQUEST + 5 {
            let (service, log_record) = attribute_record(&record, "obj");
            if let Some(payload) = batcher.push(service, log_record) {
                flushed.push(payload);
            }
        }
        assert_eq!(flushed.len(), 1);
        assert_eq!(
            flushed[0].resource_logs[0].scope_logs[0].log_records.len(),
            MAX_RECORDS_PER_REQUEST
        );

        let residue = batcher.drain();
        assert_eq!(residue.len(), 1);
        assert_eq!(residue[0].resource_logs[0].scope_logs[0].log_records.len(), 5);
    }

    #[test]
    fn empty_batcher_drains_nothing() {
        assert!(ServiceBatcher::new().drain().is_empty());
    }
}
