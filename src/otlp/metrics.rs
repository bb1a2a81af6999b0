use crate::otlp::logs::Resource;
use crate::otlp::value::{serialize_i64_as_string, serialize_u64_as_string, KeyValue};
use serde::Serialize;

/// Top-level envelope of the metrics signal: `{"resourceMetrics": [...]}` on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub resource: Resource,
    pub scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetrics {
    pub scope: InstrumentationScope,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationScope {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub unit: String,
    pub gauge: Gauge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Gauge {
    pub data_points: Vec<NumberDataPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberDataPoint {
    #[serde(serialize_with = "serialize_u64_as_string")]
    pub time_unix_nano: u64,
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub as_int: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let payload = MetricsData {
            resource_metrics: vec![ResourceMetrics {
                resource: Resource {
                    attributes: vec![KeyValue::string("Name", "VPC Flow Logs")],
                },
                scope_metrics: vec![ScopeMetrics {
                    scope: InstrumentationScope {
                        name: "vpc_flow_logs".to_owned(),
                        version: "1.0.0".to_owned(),
                        attributes: vec![KeyValue::string("identifier", "nio")],
                    },
                    metrics: vec![Metric {
                        name: "AWS.VPC.Flows.Bytes".to_owned(),
                        unit: "Bytes".to_owned(),
                        gauge: Gauge {
                            data_points: vec![NumberDataPoint {
                                time_unix_nano: 1_620_000_000_000_000_000,
                                as_int: 4000,
                                attributes: vec![],
                            }],
                        },
                    }],
                }],
            }],
        };

        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            encoded["resourceMetrics"][0]["scopeMetrics"][0]["scope"]["name"],
            json!("vpc_flow_logs")
        );
        let point =
            &encoded["resourceMetrics"][0]["scopeMetrics"][0]["metrics"][0]["gauge"]["dataPoints"][0];
        assert_eq!(point["timeUnixNano"], json!("1620000000000000000"));
        assert_eq!(point["asInt"], json!("4000"));
    }
}
