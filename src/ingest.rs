use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};

/// A delivery from the logs stream: the account that owns the events, the
/// group and stream they came from, and the events themselves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsDelivery {
    pub owner: String,
    pub log_group: String,
    pub log_stream: String,
    pub log_events: Vec<LogEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogEvent {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message: String,
}

impl LogEvent {
    /// The event timestamp as Unix nanoseconds, the granularity log records
    /// are shipped with.
    pub fn timestamp_nanos(&self) -> u64 {
        u64::try_from(self.timestamp).unwrap_or(0) * 1_000_000
    }
}

/// The trigger message wrapping a logs-stream delivery:
/// `{"awslogs": {"data": "<base64(gzip(json))>"}}`.
#[derive(Debug, Deserialize)]
struct TriggerEnvelope {
    awslogs: AwsLogs,
}

#[derive(Debug, Deserialize)]
struct AwsLogs {
    data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerEventError {
    #[error("trigger event is not valid JSON: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload did not decompress: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("decompressed payload is not a logs delivery: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Decodes a logs-stream trigger event into the delivery it wraps. The
/// payload travels base64-wrapped and gzip-compressed inside the event JSON.
pub fn decode_logs_event(raw: &[u8]) -> Result<LogsDelivery, TriggerEventError> {
    let envelope: TriggerEnvelope =
        serde_json::from_slice(raw).map_err(TriggerEventError::Envelope)?;
    decode_logs_payload(&envelope.awslogs.data)
}

/// Decodes the base64-gzipped payload portion of a trigger event.
pub fn decode_logs_payload(data: &str) -> Result<LogsDelivery, TriggerEventError> {
    let compressed = BASE64.decode(data.trim())?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(TriggerEventError::Gzip)?;

    serde_json::from_slice(&decompressed).map_err(TriggerEventError::Payload)
}

/// Iterates over the records of a staged newline-delimited JSON object,
/// skipping blank lines. Each item is one raw record string; I/O errors end
/// the iteration after surfacing once.
pub fn ndjson_lines<R: Read>(reader: R) -> impl Iterator<Item = std::io::Result<String>> {
    BufReader::new(reader)
        .lines()
        .filter(|line| match line {
            Ok(text) => !text.trim().is_empty(),
            Err(_) => true,
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    /// Builds a wire-shaped trigger event from a delivery description, for
    /// driver tests.
    pub(crate) fn encode_logs_event(
        owner: &str,
        log_group: &str,
        log_stream: &str,
        messages: &[(&str, i64, &str)],
    ) -> Vec<u8> {
        let events: Vec<serde_json::Value> = messages
            .iter()
            .map(|(id, timestamp, message)| {
                serde_json::json!({"id": id, "timestamp": timestamp, "message": message})
            })
            .collect();
        let payload = serde_json::json!({
            "owner": owner,
            "logGroup": log_group,
            "logStream": log_stream,
            "logEvents": events,
        });

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload.to_string().as_bytes())
            .expect("gzip write");
        let compressed = encoder.finish().expect("gzip finish");

        serde_json::json!({"awslogs": {"data": BASE64.encode(compressed)}})
            .to_string()
            .into_bytes()
    }
}
