use crate::{
    http::{Method, RequestParameters, RetryingAgent, StaticAccessTokenProvider},
    metrics::ApiClientMetricsCollector,
    otlp::{LogsData, MetricsData},
    secrets::ResolvedSecrets,
    ErrorClassification,
};
use dyn_clone::{clone_trait_object, DynClone};
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use slog::Logger;
use std::{fmt::Debug, io::Write};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress payload: {0}")]
    Compress(#[source] std::io::Error),
    #[error("export request failed: {0}")]
    Http(#[from] Box<ureq::Error>),
}

impl ErrorClassification for ExportError {
    fn is_retryable(&self) -> bool {
        match self {
            // A payload that cannot be encoded will never encode.
            ExportError::Serialize(_) | ExportError::Compress(_) => false,
            ExportError::Http(e) => match e.as_ref() {
                ureq::Error::Transport(_) => true,
                // The retrying agent has already exhausted backoff on
                // retryable statuses by the time this surfaces.
                ureq::Error::Status(status, _) => *status >= 500,
            },
        }
    }
}

/// Ships OTLP payloads to the remote ingest endpoint. The pipeline only ever
/// talks to this trait; production uses [`HttpExporter`], tests capture
/// payloads in memory.
pub trait Exporter: Debug + DynClone + Send + Sync {
    fn export_logs(&self, payload: &LogsData, logger: &Logger) -> Result<(), ExportError>;
    fn export_metrics(&self, payload: &MetricsData, logger: &Logger) -> Result<(), ExportError>;
}

clone_trait_object!(Exporter);

/// Exporter shipping gzip-compressed OTLP/JSON over HTTP with bearer
/// authentication. One instance wraps one pooled agent and should be reused
/// across deliveries.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    agent: RetryingAgent,
    logs_url: Url,
    metrics_url: Url,
    token_provider: StaticAccessTokenProvider,
}

impl HttpExporter {
    pub fn new(secrets: &ResolvedSecrets, api_metrics: &ApiClientMetricsCollector) -> HttpExporter {
        let endpoint = &secrets.endpoint;
        HttpExporter {
            agent: RetryingAgent::new("otlp-ingest", api_metrics),
            logs_url: join_path(endpoint, "v1/logs"),
            metrics_url: join_path(endpoint, "v1/metrics"),
            token_provider: StaticAccessTokenProvider::from(secrets.token.clone()),
        }
    }

    fn send<P: Serialize>(
        &self,
        url: &Url,
        payload: &P,
        endpoint_label: &'static str,
        logger: &Logger,
    ) -> Result<(), ExportError> {
        let body = serde_json::to_vec(payload)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).map_err(ExportError::Compress)?;
        let compressed = encoder.finish().map_err(ExportError::Compress)?;

        let request = self
            .agent
            .prepare_request(RequestParameters {
                url: url.clone(),
                method: Method::Post,
                token_provider: Some(&self.token_provider),
            })
            .set("Content-Type", "application/json")
            .set("Content-Encoding", "gzip");

        self.agent
            .send_bytes(logger, &request, endpoint_label, &compressed)
            .map_err(Box::new)?;
        Ok(())
    }
}

impl Exporter for HttpExporter {
    fn export_logs(&self, payload: &LogsData, logger: &Logger) -> Result<(), ExportError> {
        self.send(&self.logs_url, payload, "v1/logs", logger)
    }

    fn export_metrics(&self, payload: &MetricsData, logger: &Logger) -> Result<(), ExportError> {
        self.send(&self.metrics_url, payload, "v1/metrics", logger)
    }
}

/// Joins a path onto the endpoint, tolerating endpoints with and without a
/// trailing slash.
fn join_path(endpoint: &Url, path: &str) -> Url {
    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(path).unwrap_or(base)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures exported payloads for assertions, optionally failing the
    /// first N export calls.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CapturingExporter {
        pub logs: Arc<Mutex<Vec<LogsData>>>,
        pub metrics: Arc<Mutex<Vec<MetricsData>>>,
        pub failures_remaining: Arc<Mutex<usize>>,
    }

    impl CapturingExporter {
        pub(crate) fn new() -> CapturingExporter {
            CapturingExporter::default()
        }

        pub(crate) fn failing(failures: usize) -> CapturingExporter {
            CapturingExporter {
                failures_remaining: Arc::new(Mutex::new(failures)),
                ..CapturingExporter::default()
            }
        }

        fn try_fail(&self) -> Result<(), ExportError> {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ExportError::Http(Box::new(ureq::Error::Status(
                    503,
                    ureq::Response::new(503, "Service Unavailable", "").unwrap(),
                ))));
            }
            Ok(())
        }
    }

    impl Exporter for CapturingExporter {
        fn export_logs(&self, payload: &LogsData, _logger: &Logger) -> Result<(), ExportError> {
            self.try_fail()?;
            self.logs.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn export_metrics(
            &self,
            payload: &MetricsData,
            _logger: &Logger,
        ) -> Result<(), ExportError> {
            self.try_fail()?;
            self.metrics.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn join_path_handles_trailing_slash() {
        let with_slash = Url::parse("https://otel.example.com/base/").unwrap();
        assert_eq!(
            join_path(&with_slash, "v1/logs").as_str(),
            "https://otel.example.com/base/v1/logs"
        );

        let without_slash = Url::parse("https://otel.example.com").unwrap();
        assert_eq!(
            join_path(&without_slash, "v1/metrics").as_str(),
            "https://otel.example.com/v1/metrics"
        );
    }

    #[test]
    fn ships_gzipped_json_with_headers() {
        let logger = setup_test_logging();
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("ships_gzipped_json").unwrap();

        let mocked_post = mockito::mock("POST", "/ship/v1/logs")
            .match_header("Authorization", "Bearer test-token")
            .match_header("Content-Type", "application/json")
            .match_header("Content-Encoding", "gzip")
            .with_status(200)
            .create();

        let secrets = ResolvedSecrets {
            endpoint: Url::parse(&format!("{}/ship", mockito::server_url())).unwrap(),
            token: "test-token".to_owned(),
        };
        let exporter = HttpExporter::new(&secrets, &api_metrics);

        let payload = crate::otlp::LogsRequestBuilder::new().build();
        exporter.export_logs(&payload, &logger).unwrap();
        mocked_post.assert();
    }

    #[test]
    fn status_400_is_an_error() {
        let logger = setup_test_logging();
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name("status_400").unwrap();

        let _mocked_post = mockito::mock("POST", "/rejects/v1/logs")
            .with_status(400)
            .create();

        let secrets = ResolvedSecrets {
            endpoint: Url::parse(&format!("{}/rejects", mockito::server_url())).unwrap(),
            token: "t".to_owned(),
        };
        let exporter = HttpExporter::new(&secrets, &api_metrics);

        let payload = crate::otlp::LogsRequestBuilder::new().build();
        let err = exporter.export_logs(&payload, &logger).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn body_is_valid_gzip() {
        let body = serde_json::to_vec(&crate::otlp::LogsRequestBuilder::new().build()).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);
    }
}
