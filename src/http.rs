use crate::{metrics::ApiClientMetricsCollector, retries::retry_request};
use dyn_clone::DynClone;
use slog::Logger;
use std::{
    fmt::Debug,
    time::{Duration, Instant},
};
use ureq::{Agent, AgentBuilder, Request, Response};
use url::Url;

/// Method contains the HTTP methods supported by this crate.
#[derive(Debug)]
pub(crate) enum Method {
    Get,
    Post,
}

impl Method {
    fn to_primitive_string(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// An HTTP agent that can be configured to manage "Authorization" headers and
/// retries using exponential backoff. The wrapped `ureq::Agent` keeps a pool
/// of warm connections, so one `RetryingAgent` should be constructed per
/// outbound peer and reused for that peer's requests.
#[derive(Debug, Clone)]
pub(crate) struct RetryingAgent {
    /// Agent to use for constructing HTTP requests.
    agent: Agent,
    /// Requests which fail due to transport problems or which return any HTTP
    /// status code in this list or in the 5xx range will be retried with
    /// exponential backoff.
    additional_retryable_http_status_codes: Vec<u16>,
    service: String,
    api_metrics: ApiClientMetricsCollector,
}

impl RetryingAgent {
    /// Create a `RetryingAgent` with a customized `ureq::Agent` and a list of
    /// retryable HTTP status codes.
    pub fn new_with_agent(
        agent: Agent,
        additional_retryable_http_status_codes: Vec<u16>,
        service: &str,
        api_metrics: &ApiClientMetricsCollector,
    ) -> Self {
        Self {
            agent,
            additional_retryable_http_status_codes,
            service: service.to_string(),
            api_metrics: api_metrics.clone(),
        }
    }

    /// Create a `RetryingAgent` suitable for shipping telemetry payloads: a
    /// 30 second request timeout, a small pool of warm connections per
    /// host, and 429 treated as retryable on top of the 5xx range.
    pub fn new(service: &str, api_metrics: &ApiClientMetricsCollector) -> Self {
        Self::new_with_agent(
            AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .max_idle_connections_per_host(4)
                .build(),
            vec![429],
            service,
            api_metrics,
        )
    }

    /// Prepares a request for the provided `RequestParameters`. Returns a
    /// `ureq::Request` permitting the caller to further customize the request
    /// (e.g., with HTTP headers or query parameters). Callers must use
    /// `RetryingAgent::send_bytes` or `::call` on the returned request to get
    /// retries.
    pub(crate) fn prepare_request(&self, parameters: RequestParameters) -> Request {
        let mut request = self
            .agent
            .request_url(parameters.method.to_primitive_string(), &parameters.url);
        if let Some(token_provider) = parameters.token_provider {
            request = request.set(
                "Authorization",
                &format!("Bearer {}", token_provider.bearer_token()),
            );
        }
        request
    }

    fn is_http_status_retryable(&self, http_status: u16) -> bool {
        http_status >= 500
            || self
                .additional_retryable_http_status_codes
                .contains(&http_status)
    }

    fn is_error_retryable(&self, error: &ureq::Error) -> bool {
        match error {
            ureq::Error::Status(http_status, _) => self.is_http_status_retryable(*http_status),
            ureq::Error::Transport(_) => true,
        }
    }

    /// Send the provided request with the provided bytes as the body.
    pub(crate) fn send_bytes(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
        data: &[u8],
    ) -> Result<Response, ureq::Error> {
        retry_request(
            logger,
            || self.do_request_with_metrics(endpoint, || request.clone().send_bytes(data)),
            |ureq_error| self.is_error_retryable(ureq_error),
        )
    }

    /// Send the provided request with no body.
    pub(crate) fn call(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
    ) -> Result<Response, ureq::Error> {
        retry_request(
            logger,
            || self.do_request_with_metrics(endpoint, || request.clone().call()),
            |ureq_error| self.is_error_retryable(ureq_error),
        )
    }

    /// Perform some operation `op`, logging metrics on the request status and
    /// latency.
    fn do_request_with_metrics<F>(
        &self,
        endpoint: &'static str,
        mut op: F,
    ) -> Result<Response, ureq::Error>
    where
        F: FnMut() -> Result<Response, ureq::Error>,
    {
        let before = Instant::now();
        let result = op();
        let latency = before.elapsed().as_millis();

        let http_status_label = match result {
            Ok(ref r) => r.status().to_string(),
            Err(ureq::Error::Status(http_status, _)) => http_status.to_string(),
            Err(_) => "unknown".to_owned(),
        };

        self.api_metrics
            .latency
            .with_label_values(&[&self.service, endpoint, &http_status_label])
            .observe(latency as f64);

        result
    }
}

/// Defines a behavior responsible for producing bearer authorization tokens.
pub(crate) trait AccessTokenProvider: Debug + DynClone + Send + Sync {
    /// Returns a valid bearer authorization token
    fn bearer_token(&self) -> String;
}

dyn_clone::clone_trait_object!(AccessTokenProvider);

/// StaticAccessTokenProvider is an AccessTokenProvider that always vends the
/// same string, resolved once at startup.
#[derive(Clone, Debug)]
pub(crate) struct StaticAccessTokenProvider {
    pub token: String,
}

impl AccessTokenProvider for StaticAccessTokenProvider {
    fn bearer_token(&self) -> String {
        self.token.clone()
    }
}

impl From<String> for StaticAccessTokenProvider {
    fn from(token: String) -> Self {
        StaticAccessTokenProvider { token }
    }
}

/// Struct containing parameters for prepare_request.
#[derive(Debug)]
pub(crate) struct RequestParameters<'a> {
    /// The url to request
    pub url: Url,
    /// The method of the request (GET, POST, etc)
    pub method: Method,
    /// If this field is set, the request will be sent with an "Authorization"
    /// header containing a bearer token obtained from the
    /// AccessTokenProvider. If unset, the request is sent unauthenticated.
    pub token_provider: Option<&'a dyn AccessTokenProvider>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use mockito::{mock, Matcher};

    #[test]
    fn retryable_error() {
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("retryable_error").unwrap();

        let http_400 = ureq::Error::Status(400, Response::new(400, "", "").unwrap());
        let http_429 = ureq::Error::Status(429, Response::new(429, "", "").unwrap());
        let http_500 = ureq::Error::Status(500, Response::new(500, "", "").unwrap());
        let http_503 = ureq::Error::Status(503, Response::new(503, "", "").unwrap());

        let agent = RetryingAgent::new("retryable_error", &api_metrics);
        assert!(!agent.is_error_retryable(&http_400));
        assert!(agent.is_error_retryable(&http_429));
        assert!(agent.is_error_retryable(&http_500));
        assert!(agent.is_error_retryable(&http_503));
    }

    #[test]
    fn authenticated_request() {
        let logger = setup_test_logging();
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("authenticated_request").unwrap();

        let mocked_post = mock("POST", "/agent/v1/logs")
            .match_header("Authorization", "Bearer fake-token")
            .with_status(200)
            .with_body("{}")
            .expect_at_most(1)
            .create();

        let token_provider = StaticAccessTokenProvider {
            token: "fake-token".to_string(),
        };

        let request_parameters = RequestParameters {
            url: Url::parse(&format!("{}/agent/v1/logs", mockito::server_url())).unwrap(),
            method: Method::Post,
            token_provider: Some(&token_provider),
        };

        let agent = RetryingAgent::new("authenticated_request", &api_metrics);
        let request = agent.prepare_request(request_parameters);
        let response = agent
            .send_bytes(&logger, &request, "fake-endpoint", b"payload")
            .unwrap();

        mocked_post.assert();
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn unauthenticated_request() {
        let logger = setup_test_logging();
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("unauthenticated_request").unwrap();

        let mocked_get = mock("GET", "/resource")
            .match_header("Authorization", Matcher::Missing)
            .with_status(200)
            .with_body("fake body")
            .expect_at_most(1)
            .create();

        let request_parameters = RequestParameters {
            url: Url::parse(&format!("{}/resource", mockito::server_url())).unwrap(),
            method: Method::Get,
            token_provider: None,
        };

        let agent = RetryingAgent::new("unauthenticated_request", &api_metrics);
        let request = agent.prepare_request(request_parameters);
        let response = agent.call(&logger, &request, "fake-endpoint").unwrap();

        mocked_get.assert();
        assert_eq!(response.status(), 200);
        assert_eq!(response.into_string().unwrap(), "fake body");
    }
}
