use crate::{
    flowlog::FlowLogRecord,
    otlp::{
        Gauge, InstrumentationScope, KeyValue, Metric, MetricsData, NumberDataPoint, Resource,
        ResourceMetrics, ScopeMetrics,
    },
};

const RESOURCE_NAME_KEY: &str = "Name";
const RESOURCE_NAME: &str = "VPC Flow Logs";
const SCOPE_NAME: &str = "vpc_flow_logs";
const SCOPE_VERSION: &str = "1.0.0";
const BYTES_METRIC: &str = "AWS.VPC.Flows.Bytes";
const PACKETS_METRIC: &str = "AWS.VPC.Flows.Packets";

/// Maximum length of a data point attribute value, in code points.
const MAX_ATTRIBUTE_LENGTH: usize = 255;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Code points in the Unicode format (Cf) category, which are invisible but
/// are neither control characters nor whitespace: soft hyphen, zero-width
/// and directional marks, interlinear annotation, tag characters.
fn is_format(c: char) -> bool {
    matches!(
        u32::from(c),
        0x00AD
            | 0x0600..=0x0605
            | 0x061C
            | 0x06DD
            | 0x070F
            | 0x08E2
            | 0x180E
            | 0x200B..=0x200F
            | 0x202A..=0x202E
            | 0x2060..=0x2064
            | 0x2066..=0x206F
            | 0xFEFF
            | 0xFFF9..=0xFFFB
            | 0x110BD
            | 0x110CD
            | 0x13430..=0x13438
            | 0x1BCA0..=0x1BCA3
            | 0x1D173..=0x1D17A
            | 0xE0001
            | 0xE0020..=0xE007F
    )
}

/// Whether a code point is printable: plain space is, and anything in the
/// control and format categories or in a whitespace category other than
/// plain space (no-break space, line/paragraph separators) is not.
fn is_printable(c: char) -> bool {
    c == ' ' || (!c.is_control() && !c.is_whitespace() && !is_format(c))
}

/// Strips unprintable code points and truncates to the attribute length
/// limit. Idempotent.
pub(crate) fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| is_printable(*c))
        .take(MAX_ATTRIBUTE_LENGTH)
        .collect()
}

/// Builds the attribute set shared by both data points: every non-empty
/// string field, sanitized, under its internal snake_case key, plus the flow
/// window bounds as integers.
fn data_point_attributes(record: &FlowLogRecord) -> Vec<KeyValue> {
    let mut attributes: Vec<KeyValue> = record
        .string_fields()
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| KeyValue::string(key, sanitize(value)))
        .collect();

    attributes.push(KeyValue::int("start", record.start));
    attributes.push(KeyValue::int("end", record.end));
    attributes
}

fn gauge_metric(name: &str, unit: &str, time_unix_nano: u64, value: i64, attributes: &[KeyValue]) -> Metric {
    Metric {
        name: name.to_owned(),
        unit: unit.to_owned(),
        gauge: Gauge {
            data_points: vec![NumberDataPoint {
                time_unix_nano,
                as_int: value,
                attributes: attributes.to_vec(),
            }],
        },
    }
}

/// Shapes one valid flow log record into a metrics envelope carrying the
/// flow's byte and packet counts as gauges. Both data points are stamped
/// with the start of the flow window, at second granularity.
pub fn build_flow_metrics(record: &FlowLogRecord) -> MetricsData {
    let timestamp = u64::try_from(record.start).unwrap_or(0) * NANOS_PER_SECOND;
    let attributes = data_point_attributes(record);

    MetricsData {
        resource_metrics: vec![ResourceMetrics {
            resource: Resource {
                attributes: vec![KeyValue::string(RESOURCE_NAME_KEY, RESOURCE_NAME)],
            },
            scope_metrics: vec![ScopeMetrics {
                scope: InstrumentationScope {
                    name: SCOPE_NAME.to_owned(),
                    version: SCOPE_VERSION.to_owned(),
                    attributes: vec![
                        KeyValue::string("identifier", "nio"),
                        KeyValue::string("swi-reporter", ""),
                    ],
                },
                metrics: vec![
                    gauge_metric(BYTES_METRIC, "Bytes", timestamp, record.bytes, &attributes),
                    gauge_metric(
                        PACKETS_METRIC,
                        "Count",
                        timestamp,
                        record.packets,
                        &attributes,
                    ),
                ],
            }],
        }],
    }
}
