use anyhow::{Context, Result};
use http::Response;
use log::{error, info};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::runtime::Runtime;
use warp::Filter;

/// Starts listening on an HTTP endpoint so that Prometheus can scrape metrics
/// from this instance. On success, returns a Runtime value that the caller
/// must keep live, or the task that handles Prometheus scrapes will not run.
/// Returns an error if something goes wrong setting up the endpoint.
pub fn start_metrics_scrape_endpoint(port: u16) -> Result<Runtime> {
    // The default, multi-threaded runtime should suffice for our needs
    let runtime = Runtime::new().context("failed to create runtime for metrics endpoint")?;

    // This task will run forever, so we intentionally drop the returned handle
    runtime.spawn(async move {
        let endpoint = warp::get().and(warp::path("metrics")).map(|| {
            match handle_scrape() {
                Ok(body) => {
                    Response::builder()
                        // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(body)
                }
                Err(err) => {
                    error!("unable to scrape Prometheus metrics: {}", err);
                    Response::builder().status(500).body(vec![])
                }
            }
        });

        info!("serving metrics scrapes on 0.0.0.0:{}", port);
        warp::serve(endpoint)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

fn handle_scrape() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Counters covering the per-delivery pipeline: how records were classified
/// and why any were dropped.
#[derive(Debug, Clone)]
pub struct PipelineMetricsCollector {
    pub records_processed: IntCounterVec,
    pub records_dropped: IntCounterVec,
    pub deliveries_finished: IntCounterVec,
}

impl PipelineMetricsCollector {
    pub fn new() -> Result<PipelineMetricsCollector> {
        let records_processed = register_int_counter_vec!(
            "logship_records_processed",
            "Number of log records processed, by classified kind",
            &["kind"]
        )
        .context("failed to register metrics counter for processed records")?;

        let records_dropped = register_int_counter_vec!(
            "logship_records_dropped",
            "Number of log records dropped before export, by reason",
            &["reason"]
        )
        .context("failed to register metrics counter for dropped records")?;

        let deliveries_finished = register_int_counter_vec!(
            "logship_deliveries_finished",
            "Number of deliveries processed to completion, by outcome",
            &["status"]
        )
        .context("failed to register metrics counter for finished deliveries")?;

        Ok(PipelineMetricsCollector {
            records_processed,
            records_dropped,
            deliveries_finished,
        })
    }
}

/// Counters covering outbound export requests.
#[derive(Debug, Clone)]
pub struct ExportMetricsCollector {
    pub batches_exported: IntCounterVec,
}

impl ExportMetricsCollector {
    pub fn new() -> Result<ExportMetricsCollector> {
        let batches_exported = register_int_counter_vec!(
            "logship_batches_exported",
            "Number of outbound batches shipped, by signal and outcome",
            &["signal", "status"]
        )
        .context("failed to register metrics counter for exported batches")?;

        Ok(ExportMetricsCollector { batches_exported })
    }
}

/// Counters covering the flow log format cache.
#[derive(Debug, Clone)]
pub struct FormatCacheMetricsCollector {
    pub lookups: IntCounterVec,
}

impl FormatCacheMetricsCollector {
    pub fn new() -> Result<FormatCacheMetricsCollector> {
        let lookups = register_int_counter_vec!(
            "logship_format_cache_lookups",
            "Flow log format cache lookups, by result (hit, miss, expired)",
            &["result"]
        )
        .context("failed to register metrics counter for format cache lookups")?;

        Ok(FormatCacheMetricsCollector { lookups })
    }
}

/// Histograms tracking latency of calls made to external HTTP APIs.
#[derive(Debug, Clone)]
pub struct ApiClientMetricsCollector {
    pub latency: HistogramVec,
}

impl ApiClientMetricsCollector {
    pub fn new() -> Result<ApiClientMetricsCollector> {
        Self::new_with_metric_name("logship")
    }

    /// Registers the latency histogram under a caller-provided prefix.
    /// Needed by tests, which would otherwise collide in the process-global
    /// prometheus registry.
    pub fn new_with_metric_name(name: &str) -> Result<ApiClientMetricsCollector> {
        let latency = register_histogram_vec!(
            format!("{}_api_request_latency_ms", name),
            "Latency of requests to external APIs, in milliseconds",
            &["service", "endpoint", "http_status"]
        )
        .context("failed to register API client latency histogram")?;

        Ok(ApiClientMetricsCollector { latency })
    }
}
