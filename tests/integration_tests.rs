use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::{write::GzEncoder, Compression};
use logship::{
    cancel::CancellationToken,
    export::HttpExporter,
    flowlog::{FlowLogFormatSource, FormatCache, FormatLookup},
    ingest::decode_logs_event,
    logging::setup_test_logging,
    metrics::{ApiClientMetricsCollector, ExportMetricsCollector, PipelineMetricsCollector},
    pipeline::Pipeline,
    secrets::ResolvedSecrets,
};
use once_cell::sync::Lazy;
use serde_json::json;
use std::{io::Write, time::Duration};
use url::Url;

// Registering the same counters twice in the process-global prometheus
// registry fails, so both tests share one collector set.
static COLLECTORS: Lazy<(PipelineMetricsCollector, ExportMetricsCollector)> = Lazy::new(|| {
    (
        PipelineMetricsCollector::new().unwrap(),
        ExportMetricsCollector::new().unwrap(),
    )
});

fn encode_event(log_group: &str, log_stream: &str, messages: &[&str]) -> Vec<u8> {
    let events: Vec<serde_json::Value> = messages
        .iter()
        .enumerate()
        .map(|(i, message)| {
            json!({
                "id": format!("event-{i}"),
                "timestamp": 1_620_000_000_000i64 + i as i64,
                "message": message,
            })
        })
        .collect();
    let payload = json!({
        "owner": "123456789012",
        "logGroup": log_group,
        "logStream": log_stream,
        "logEvents": events,
    });

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.to_string().as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    json!({"awslogs": {"data": BASE64.encode(compressed)}})
        .to_string()
        .into_bytes()
}

fn pipeline_against_mockito(name: &str) -> Pipeline {
    let api_metrics = ApiClientMetricsCollector::new_with_metric_name(name).unwrap();
    let secrets = ResolvedSecrets {
        endpoint: Url::parse(&mockito::server_url()).unwrap(),
        token: "integration-token".to_owned(),
    };
    let exporter = HttpExporter::new(&secrets, &api_metrics);

    Pipeline::new(
        Box::new(exporter),
        Some("us-east-1".to_owned()),
        CancellationToken::new(),
        COLLECTORS.0.clone(),
        COLLECTORS.1.clone(),
        &setup_test_logging(),
    )
}

struct DefaultFormat;

impl FlowLogFormatSource for DefaultFormat {
    fn lookup(&self, _log_group: &str) -> Result<FormatLookup> {
        Ok(FormatLookup {
            format: String::new(),
            flow_log_id: "fl-0123".to_owned(),
            flow_log_count: 1,
        })
    }
}

#[test]
fn logs_delivery_end_to_end() {
    let audit_event = json!({
        "eventVersion": "1.08",
        "eventSource": "ec2.amazonaws.com",
        "awsRegion": "us-east-2",
        "responseElements": {"instancesSet": {"items": [{"instanceId": "i-061bf37e959383a04"}]}}
    })
    .to_string();

    let raw = encode_event(
        "/aws/eks/app",
        "generic-stream",
        &["plain line", &audit_event],
    );
    let delivery = decode_logs_event(&raw).unwrap();

    let mocked_post = mockito::mock("POST", "/v1/logs")
        .match_header("Authorization", "Bearer integration-token")
        .match_header("Content-Encoding", "gzip")
        .with_status(200)
        .expect(1)
        .create();

    let pipeline = pipeline_against_mockito("logs_end_to_end");
    let summary = pipeline.run_logs_delivery(&delivery);

    mocked_post.assert();
    assert!(summary.success);
    assert_eq!(summary.exported_batches, 1);
    assert_eq!(summary.processed_records, 2);
}

#[test]
fn flow_log_delivery_end_to_end() {
    let raw = encode_event(
        "vpc-flow-logs",
        "eni-stream",
        &["2 123456789012 eni-0a 10.0.0.1 10.0.0.2 443 49152 6 25 4000 1620000000 1620000060 ACCEPT OK"],
    );
    let delivery = decode_logs_event(&raw).unwrap();

    let mocked_post = mockito::mock("POST", "/v1/metrics")
        .match_header("Content-Type", "application/json")
        .with_status(200)
        .expect(1)
        .create();

    let pipeline = pipeline_against_mockito("flow_end_to_end");
    let cache = FormatCache::new(Duration::from_secs(600));
    let summary = pipeline.run_flow_log_delivery(&delivery, &cache, &DefaultFormat, 100, false);

    mocked_post.assert();
    assert!(summary.success);
    assert_eq!(summary.exported_batches, 1);
    assert_eq!(summary.dropped_records, 0);
}
